//! Swarm membership bookkeeping.
//!
//! The registry maps each info-hash to the set of peers that have announced
//! for it, along with when each peer was last heard from. Everything lives
//! in memory under a single lock, so announces are linearized; nothing is
//! persisted across restarts.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A peer that has not announced for this long is evicted the next time a
/// new peer joins its swarm.
pub const PEER_EXPIRY: Duration = Duration::from_secs(300);

/// Default number of peers returned when the client does not ask.
pub const DEFAULT_NUMWANT: usize = 50;

/// Hard cap on the peers returned; out-of-range requests clamp here.
pub const MAX_NUMWANT: usize = 100;

/// An opaque swarm identifier as supplied by announcing clients.
///
/// The tracker never checks it against any torrent document, so it is kept
/// as raw bytes rather than a fixed-width hash.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InfoHash(Bytes);

impl InfoHash {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}

/// One participant in a swarm, as reported back to announcing clients.
///
/// Fields are declared in bencode key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub ip: String,
    /// Client-supplied identifier, unique within one swarm.
    #[serde(rename = "peer id", with = "serde_bytes")]
    pub id: Vec<u8>,
    pub port: u16,
}

/// A validated announce request.
#[derive(Debug, Clone)]
pub struct Announce {
    pub info_hash: InfoHash,
    pub peer_id: Vec<u8>,
    pub ip: String,
    pub port: u16,
    pub event: Option<String>,
    pub numwant: usize,
}

#[derive(Default)]
struct Swarm {
    peers: HashMap<Vec<u8>, Peer>,
    last_seen: HashMap<Vec<u8>, Instant>,
}

/// Per-info-hash peer sets with opportunistic eviction.
#[derive(Default)]
pub struct PeerRegistry {
    swarms: Mutex<HashMap<InfoHash, Swarm>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announce and returns the peers to report back.
    ///
    /// Eviction runs only when an unknown peer_id arrives: entries sharing
    /// the newcomer's address and entries past [`PEER_EXPIRY`] are dropped
    /// from both maps. The returned list never includes a peer with the
    /// requester's own address and is capped at `numwant` entries.
    pub fn announce(&self, request: &Announce, now: Instant) -> Vec<Peer> {
        let mut swarms = self.swarms.lock();
        let swarm = swarms.entry(request.info_hash.clone()).or_default();

        if !swarm.peers.contains_key(&request.peer_id) {
            let mut evict: Vec<Vec<u8>> = swarm
                .peers
                .values()
                .filter(|peer| peer.ip == request.ip)
                .map(|peer| peer.id.clone())
                .collect();
            evict.extend(
                swarm
                    .last_seen
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) > PEER_EXPIRY)
                    .map(|(id, _)| id.clone()),
            );
            for id in evict {
                swarm.peers.remove(&id);
                swarm.last_seen.remove(&id);
            }
        }

        swarm.peers.insert(
            request.peer_id.clone(),
            Peer {
                ip: request.ip.clone(),
                id: request.peer_id.clone(),
                port: request.port,
            },
        );
        swarm.last_seen.insert(request.peer_id.clone(), now);

        if request.event.as_deref() == Some("stopped") {
            swarm.peers.remove(&request.peer_id);
        }

        swarm
            .peers
            .values()
            .filter(|peer| peer.ip != request.ip)
            .take(request.numwant)
            .cloned()
            .collect()
    }

    /// Number of registered peers for an info-hash.
    pub fn peer_count(&self, info_hash: &InfoHash) -> usize {
        self.swarms
            .lock()
            .get(info_hash)
            .map_or(0, |swarm| swarm.peers.len())
    }
}
