//! Distributor lifecycle: composition of watchers and tracker.
//!
//! ```no_run
//! use distributor::Distributor;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let distributor = Distributor::new(
//!     "/var/www",
//!     "/usr/local/bin/ctorrent",
//!     "127.0.0.1",
//!     6390,
//! )?;
//! distributor.start().await?;
//! // ... later:
//! distributor.close();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::tracker::Tracker;
use crate::watcher::{WatchError, Watcher};

#[derive(Debug, Error)]
pub enum DistributorError {
    #[error("serve path does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("serve path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("seed binary not found at: {0}")]
    MissingSeedBinary(PathBuf),

    #[error("port must be in range 1..65535")]
    InvalidPort,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// Owns the watchers and the tracker for one served tree.
pub struct Distributor {
    root: PathBuf,
    seed_binary: PathBuf,
    address: String,
    port: u16,
    watchers: Mutex<HashMap<String, Arc<Watcher>>>,
    server: Mutex<Option<JoinHandle<()>>>,
    quit: watch::Sender<bool>,
}

impl Distributor {
    /// Validates the configuration and builds an idle distributor.
    pub fn new(
        root: impl Into<PathBuf>,
        seed_binary: impl Into<PathBuf>,
        address: impl Into<String>,
        port: u16,
    ) -> Result<Self, DistributorError> {
        let root: PathBuf = root.into();
        let seed_binary: PathBuf = seed_binary.into();

        let stat =
            std::fs::metadata(&root).map_err(|_| DistributorError::MissingRoot(root.clone()))?;
        if !stat.is_dir() {
            return Err(DistributorError::NotADirectory(root));
        }
        if std::fs::metadata(&seed_binary).is_err() {
            return Err(DistributorError::MissingSeedBinary(seed_binary));
        }
        if port == 0 {
            return Err(DistributorError::InvalidPort);
        }

        let (quit, _) = watch::channel(false);
        Ok(Self {
            root,
            seed_binary,
            address: address.into(),
            port,
            watchers: Mutex::new(HashMap::new()),
            server: Mutex::new(None),
            quit,
        })
    }

    /// Starts the watchers, then binds and serves the tracker. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr, DistributorError> {
        let watcher = Watcher::start(&self.root)?;
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());

        let watchers = HashMap::from([(name, watcher)]);
        *self.watchers.lock() = watchers.clone();

        let tracker = Tracker::new(watchers, &self.seed_binary);
        let listener =
            tokio::net::TcpListener::bind((self.address.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        let app = tracker
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(%err, "tracker server failed");
            }
        });
        *self.server.lock() = Some(handle);

        info!(root = %self.root.display(), %addr, "distributing");
        Ok(addr)
    }

    /// [`start`](Self::start), then block until [`close`](Self::close).
    pub async fn run(&self) -> Result<(), DistributorError> {
        self.start().await?;
        self.wait().await;
        Ok(())
    }

    /// Blocks until the distributor is closed.
    pub async fn wait(&self) {
        let mut quit = self.quit.subscribe();
        while !*quit.borrow() {
            if quit.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stops the watchers, releases the tracker's bind, and wakes any
    /// [`wait`](Self::wait) callers. Seeding children keep running until
    /// they exit on their own.
    pub fn close(&self) {
        for watcher in self.watchers.lock().values() {
            watcher.close();
        }
        if let Some(server) = self.server.lock().take() {
            server.abort();
        }
        let _ = self.quit.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn rejects_bad_configuration() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, b"x").unwrap();

        let missing = dir.path().join("nope");
        assert!(matches!(
            Distributor::new(&missing, "/bin/sh", "127.0.0.1", 6390),
            Err(DistributorError::MissingRoot(_))
        ));
        assert!(matches!(
            Distributor::new(&file, "/bin/sh", "127.0.0.1", 6390),
            Err(DistributorError::NotADirectory(_))
        ));
        assert!(matches!(
            Distributor::new(dir.path(), dir.path().join("no-binary"), "127.0.0.1", 6390),
            Err(DistributorError::MissingSeedBinary(_))
        ));
        assert!(matches!(
            Distributor::new(dir.path(), "/bin/sh", "127.0.0.1", 0),
            Err(DistributorError::InvalidPort)
        ));
    }

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_serve_close() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("payload.bin"), b"testing").unwrap();

        let port = free_port().await;
        let distributor = Distributor::new(dir.path(), "/bin/sh", "127.0.0.1", port).unwrap();
        let addr = distributor.start().await.unwrap();

        // Poll: the watcher needs a moment to hash the file.
        let url = format!("http://{}/serve?payload.bin", addr);
        let mut document = None;
        for _ in 0..200 {
            let body = reqwest::get(&url).await.unwrap().bytes().await.unwrap();
            if body.as_ref() != b"file not found" {
                document = Some(body);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let document: crate::metadata::Metadata =
            serde_bencode::from_bytes(&document.expect("file never appeared")).unwrap();
        assert_eq!(document.info.name, "payload.bin");

        distributor.close();
        distributor.wait().await;

        // The bind is released; fresh connections are refused.
        for _ in 0..200 {
            if reqwest::get(&url).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("listener still accepting after close");
    }
}
