//! Seed subprocess supervision.
//!
//! Serving the actual file bytes is delegated to an external
//! ctorrent-compatible binary. The supervisor guarantees at most one live
//! seeding child per file: a `/serve` request either finds a child already
//! running or spawns one, and a detached wait task reaps the child,
//! removes its temporary torrent file, and frees the slot so a later
//! request can seed again.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tempfile::TempPath;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::metadata::Metadata;
use crate::watcher::File;

/// How long a child seeds before exiting on its own (ctorrent `-e`).
const SEED_HOURS: u32 = 4;

/// Whether a file currently has a live seeding child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedState {
    Idle,
    Running,
}

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode torrent document: {0}")]
    Encode(#[from] serde_bencode::Error),
}

/// Spawns and tracks seeding children.
pub struct SeedSupervisor {
    seed_binary: PathBuf,
    /// Serializes spawn and exit bookkeeping across all files.
    spawn_lock: tokio::sync::Mutex<()>,
}

impl SeedSupervisor {
    pub fn new(seed_binary: impl Into<PathBuf>) -> Self {
        Self {
            seed_binary: seed_binary.into(),
            spawn_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Ensures a seeding child is running for `file`.
    ///
    /// Returns immediately when one already is. Otherwise writes the
    /// bencoded `metadata` to a temporary torrent file, flushes it, and
    /// spawns the seeding binary against it. The child exits on its own
    /// after a bounded runtime; the next request re-spawns.
    pub async fn ensure_seed(&self, file: &Arc<File>, metadata: &Metadata) -> Result<(), SeedError> {
        let _guard = self.spawn_lock.lock().await;

        if !file.begin_seed() {
            return Ok(());
        }

        match self.spawn(file, metadata).await {
            Ok(()) => Ok(()),
            Err(err) => {
                file.end_seed();
                Err(err)
            }
        }
    }

    async fn spawn(&self, file: &Arc<File>, metadata: &Metadata) -> Result<(), SeedError> {
        let document = serde_bencode::to_bytes(metadata)?;

        let torrent_path = tokio::task::spawn_blocking(move || write_torrent(&document))
            .await
            .map_err(std::io::Error::other)??;

        let mut child = Command::new(&self.seed_binary)
            .arg("-e")
            .arg(SEED_HOURS.to_string())
            .arg("-s")
            .arg(&file.path)
            .arg(&*torrent_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        info!(
            file = %file.path.display(),
            torrent = %torrent_path.display(),
            "seed started"
        );

        // Detached reaper: sole writer of the running -> idle transition.
        // Dropping the TempPath removes the torrent file best-effort.
        let file = file.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(file = %file.path.display(), %status, "seed exited"),
                Err(err) => error!(file = %file.path.display(), %err, "failed to wait for seed"),
            }
            drop(torrent_path);
            file.end_seed();
        });

        Ok(())
    }
}

/// Writes the torrent document to a fresh temp file and flushes it to disk
/// before the child gets pointed at it.
fn write_torrent(document: &[u8]) -> Result<TempPath, std::io::Error> {
    let mut tmp = tempfile::Builder::new()
        .prefix("distributor-")
        .suffix(".torrent")
        .tempfile()?;
    tmp.write_all(document)?;
    tmp.as_file().sync_all()?;
    Ok(tmp.into_temp_path())
}
