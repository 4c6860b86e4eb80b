//! Tracker HTTP endpoints.
//!
//! Three GET routes, all answering HTTP 200 with either a bencoded document
//! or a plain-text error body; this mirrors the protocol the downloading
//! clients already speak, which keys off body content rather than status
//! codes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::query;
use super::registry::{Peer, PeerRegistry};
use crate::metadata::{Metadata, MetadataInfo};
use crate::seed::SeedSupervisor;
use crate::watcher::{File, Watcher};

/// How long `/serve` polls for metadata before answering `timeout`.
const METADATA_WAIT_SECS: u64 = 30;

/// Announce interval range handed to clients, jittered per response so the
/// swarm does not re-announce in lockstep.
const INTERVAL_SECS: std::ops::Range<i64> = 300..420;

/// The bencoded announce response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnnounceReply {
    pub interval: i64,
    pub peers: Vec<Peer>,
}

/// Serves torrent documents and coordinates the peer swarms for a set of
/// watched directories.
pub struct Tracker {
    watchers: HashMap<String, Arc<Watcher>>,
    registry: PeerRegistry,
    seeds: SeedSupervisor,
}

impl Tracker {
    pub fn new(
        watchers: HashMap<String, Arc<Watcher>>,
        seed_binary: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            watchers,
            registry: PeerRegistry::new(),
            seeds: SeedSupervisor::new(seed_binary),
        })
    }

    /// Builds the router. Serve it with connect info enabled: `/announce`
    /// falls back to the remote socket address when no `ip` parameter is
    /// given.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/serve", get(serve))
            .route("/serve_last_updated", get(serve_last_updated))
            .route("/announce", get(announce))
            .with_state(self)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Finds a file by watcher-relative path, searching every watcher.
    fn find_file(&self, rel: &Path) -> Option<Arc<File>> {
        self.watchers
            .values()
            .find_map(|watcher| watcher.get_file(rel))
    }

    /// Waits out metadata generation, starts a seed, and answers with the
    /// bencoded torrent document.
    async fn torrent_response(&self, file: Arc<File>, headers: &HeaderMap) -> Response {
        let Some(info) = wait_for_metadata(&file).await else {
            return "timeout".into_response();
        };

        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let metadata = Metadata {
            announce: format!("http://{}/announce", host),
            info: (*info).clone(),
        };

        if let Err(err) = self.seeds.ensure_seed(&file, &metadata).await {
            error!(file = %file.path.display(), %err, "failed to start seed");
        }

        match serde_bencode::to_bytes(&metadata) {
            Ok(body) => body.into_response(),
            Err(err) => {
                error!(file = %file.path.display(), %err, "failed to encode torrent document");
                "failed to encode torrent".into_response()
            }
        }
    }
}

/// `GET /serve?<filename>`: the raw query is a watcher-relative path.
async fn serve(
    State(tracker): State<Arc<Tracker>>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> Response {
    let name = raw.unwrap_or_default();
    debug!(%name, "serve request");

    let Some(file) = tracker.find_file(Path::new(&name)) else {
        return "file not found".into_response();
    };
    tracker.torrent_response(file, &headers).await
}

/// `GET /serve_last_updated[?<watcher_name>]`: serves the most recently
/// modified file with metadata, from one watcher or from all of them.
async fn serve_last_updated(
    State(tracker): State<Arc<Tracker>>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> Response {
    let selector = raw.unwrap_or_default();

    let watchers: Vec<&Arc<Watcher>> = if selector.is_empty() {
        tracker.watchers.values().collect()
    } else {
        match tracker.watchers.get(&selector) {
            Some(watcher) => vec![watcher],
            None => return "invalid watcher name".into_response(),
        }
    };

    let newest = watchers
        .iter()
        .flat_map(|watcher| watcher.files())
        .filter(|file| file.metadata().is_some())
        .max_by_key(|file| file.modified());

    let Some(file) = newest else {
        return "file not found".into_response();
    };
    tracker.torrent_response(file, &headers).await
}

/// `GET /announce?...`: the classic HTTP tracker announce.
async fn announce(
    State(tracker): State<Arc<Tracker>>,
    RawQuery(raw): RawQuery,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    let raw = raw.unwrap_or_default();
    let request = match query::parse_announce(&raw, remote.ip().to_string()) {
        Ok(request) => request,
        Err(body) => return body.into_response(),
    };

    debug!(
        info_hash = %request.info_hash,
        ip = %request.ip,
        port = request.port,
        "announce"
    );

    let peers = tracker.registry.announce(&request, Instant::now());
    let reply = AnnounceReply {
        interval: rand::rng().random_range(INTERVAL_SECS),
        peers,
    };

    match serde_bencode::to_bytes(&reply) {
        Ok(body) => body.into_response(),
        Err(err) => {
            error!(%err, "failed to encode announce response");
            "failed to encode response".into_response()
        }
    }
}

pub(super) async fn wait_for_metadata(file: &File) -> Option<Arc<MetadataInfo>> {
    for _ in 0..METADATA_WAIT_SECS {
        if let Some(info) = file.metadata() {
            return Some(info);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    file.metadata()
}
