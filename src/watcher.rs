//! Live file tables driven by filesystem notifications.
//!
//! A [`Watcher`] is instantiated for each directory being served. It keeps
//! a map from watcher-relative path to [`File`], updated from an initial
//! walk of the root plus a stream of change notifications, and runs a
//! single metadata worker that hashes files and publishes their
//! [`MetadataInfo`].
//!
//! Notifications are treated as opaque "something happened at this path"
//! signals; the watcher re-stats the path and infers what to do from the
//! present state. Lost notifications are tolerated because the next one
//! re-synchronizes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::metadata::{self, MetadataInfo, CACHE_SUFFIX};
use crate::seed::SeedState;

/// Capacity of the raw notification queue. Bursts beyond this are dropped.
const EVENT_QUEUE: usize = 1000;

/// Capacity of the metadata work queue.
const METADATA_QUEUE: usize = 10000;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),
}

/// A single file being served.
///
/// Created and destroyed by the watcher; `size`, `mtime`, and `metadata`
/// are written only by the watcher's metadata worker, as one atomic
/// publication under the state lock. The seed slot has its own lock and is
/// owned by the seed supervisor.
pub struct File {
    /// Base filename.
    pub name: String,
    /// Absolute path on disk.
    pub path: PathBuf,
    state: Mutex<FileState>,
    seed: Mutex<SeedState>,
}

#[derive(Default)]
struct FileState {
    size: u64,
    mtime: Option<SystemTime>,
    metadata: Option<Arc<MetadataInfo>>,
}

impl File {
    pub(crate) fn new(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            state: Mutex::new(FileState::default()),
            seed: Mutex::new(SeedState::Idle),
        }
    }

    /// The published metadata, or `None` while hashing has not completed.
    pub fn metadata(&self) -> Option<Arc<MetadataInfo>> {
        self.state.lock().metadata.clone()
    }

    /// Modification time at the moment the current metadata was computed.
    pub fn modified(&self) -> Option<SystemTime> {
        self.state.lock().mtime
    }

    /// True when metadata is published and still matches the given stat.
    fn is_current(&self, size: u64, mtime: Option<SystemTime>) -> bool {
        let state = self.state.lock();
        state.metadata.is_some() && state.size == size && state.mtime == mtime
    }

    /// Publishes the size/mtime/metadata triple in one step.
    pub(crate) fn publish(&self, size: u64, mtime: Option<SystemTime>, info: Arc<MetadataInfo>) {
        let mut state = self.state.lock();
        state.size = size;
        state.mtime = mtime;
        state.metadata = Some(info);
    }

    pub fn seed_state(&self) -> SeedState {
        *self.seed.lock()
    }

    /// Claims the seed slot. Returns false when a seed is already running.
    pub(crate) fn begin_seed(&self) -> bool {
        let mut seed = self.seed.lock();
        if *seed == SeedState::Running {
            return false;
        }
        *seed = SeedState::Running;
        true
    }

    /// Releases the seed slot. Called only by the supervisor's wait task
    /// (or its spawn-failure path).
    pub(crate) fn end_seed(&self) {
        *self.seed.lock() = SeedState::Idle;
    }
}

/// Watches one root directory and maintains its file table.
pub struct Watcher {
    root: PathBuf,
    files: Mutex<HashMap<PathBuf, Arc<File>>>,
    quit: watch::Sender<bool>,
}

impl Watcher {
    /// Starts watching `root`: subscribes to change notifications, walks
    /// the existing tree, and spawns the dispatcher and metadata worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(root: impl Into<PathBuf>) -> Result<Arc<Self>, WatchError> {
        let root: PathBuf = root.into();
        let root = root.canonicalize()?;

        let (event_tx, event_rx) = mpsc::channel::<PathBuf>(EVENT_QUEUE);
        let (quit_tx, quit_rx) = watch::channel(false);

        // The notify callback runs on the notification thread; it bridges
        // into the bounded event queue and drops on overflow.
        let bridge = event_tx.clone();
        let fs_watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for path in event.paths {
                        let _ = bridge.try_send(path);
                    }
                }
                Err(err) => error!(%err, "watch error"),
            })?;
        let fs_watcher = Arc::new(Mutex::new(fs_watcher));

        let watcher = Arc::new(Self {
            root,
            files: Mutex::new(HashMap::new()),
            quit: quit_tx,
        });

        // Backfill: the subscription only reports future changes, so walk
        // the tree once and synthesize an event per existing file. Files
        // modified mid-walk are caught by their own notifications later.
        tokio::spawn(walk_and_watch(
            watcher.root.clone(),
            fs_watcher.clone(),
            event_tx.clone(),
        ));

        tokio::spawn(
            watcher
                .clone()
                .dispatch(event_rx, event_tx, fs_watcher, quit_rx),
        );

        Ok(watcher)
    }

    /// The canonicalized root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Looks up a file by its watcher-relative path.
    pub fn get_file(&self, rel: &Path) -> Option<Arc<File>> {
        self.files.lock().get(rel).cloned()
    }

    /// Snapshot of every tracked file.
    pub fn files(&self) -> Vec<Arc<File>> {
        self.files.lock().values().cloned().collect()
    }

    /// Signals the dispatcher to stop. In-flight metadata work finishes;
    /// the queues drain and the subscription is released.
    pub fn close(&self) {
        let _ = self.quit.send(true);
    }

    /// Main event loop. Owns the notify handle (keeping the subscription
    /// alive) and the metadata queue sender; dropping both on exit winds
    /// down the worker after it drains.
    async fn dispatch(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PathBuf>,
        event_tx: mpsc::Sender<PathBuf>,
        fs_watcher: Arc<Mutex<RecommendedWatcher>>,
        mut quit: watch::Receiver<bool>,
    ) {
        let (meta_tx, meta_rx) = mpsc::channel::<PathBuf>(METADATA_QUEUE);
        tokio::spawn(self.clone().generate_metadata(meta_rx));

        loop {
            tokio::select! {
                _ = quit.changed() => {
                    debug!(root = %self.root.display(), "watcher stopping");
                    return;
                }
                event = events.recv() => {
                    // recv cannot fail while we hold a sender clone.
                    let Some(path) = event else { return };
                    self.handle_event(path, &event_tx, &fs_watcher, &meta_tx).await;
                }
            }
        }
    }

    async fn handle_event(
        &self,
        path: PathBuf,
        event_tx: &mpsc::Sender<PathBuf>,
        fs_watcher: &Arc<Mutex<RecommendedWatcher>>,
        meta_tx: &mpsc::Sender<PathBuf>,
    ) {
        if path == self.root {
            return;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        if name.starts_with('.') || name.ends_with(CACHE_SUFFIX) {
            return;
        }

        let Ok(rel) = path.strip_prefix(&self.root) else {
            warn!(
                path = %path.display(),
                root = %self.root.display(),
                "notification outside watched root"
            );
            return;
        };
        let rel = rel.to_path_buf();

        let stat = tokio::fs::metadata(&path).await.ok();

        let mut request_metadata = false;
        {
            let mut files = self.files.lock();
            let tracked = files.contains_key(&rel);

            match stat {
                None => {
                    if tracked {
                        debug!(path = %rel.display(), "file removed");
                        files.remove(&rel);
                    }
                }
                Some(stat) if stat.is_dir() => {
                    // Directories get walked, files just get added.
                    tokio::spawn(walk_and_watch(
                        path.clone(),
                        fs_watcher.clone(),
                        event_tx.clone(),
                    ));
                }
                Some(_) => {
                    if !tracked {
                        debug!(path = %rel.display(), "file discovered");
                        files.insert(rel.clone(), Arc::new(File::new(name.to_string(), path)));
                    }
                    request_metadata = true;
                }
            }
        }

        // The send happens after the table lock is released: the metadata
        // worker takes that lock itself, and this send can block when the
        // queue is full.
        if request_metadata {
            let _ = meta_tx.send(rel).await;
        }
    }

    /// Single-consumer metadata worker. The only writer of any `File`'s
    /// published state; hashing runs unlocked because it can take a while.
    async fn generate_metadata(self: Arc<Self>, mut queue: mpsc::Receiver<PathBuf>) {
        while let Some(rel) = queue.recv().await {
            let Some(file) = self.get_file(&rel) else {
                continue;
            };

            let stat = match tokio::fs::metadata(&file.path).await {
                Ok(stat) => stat,
                Err(err) => {
                    error!(path = %file.path.display(), %err, "failed to stat");
                    continue;
                }
            };
            let size = stat.len();
            let mtime = stat.modified().ok();

            if file.is_current(size, mtime) {
                continue;
            }

            let path = file.path.clone();
            let generated = tokio::task::spawn_blocking(move || metadata::generate(&path)).await;
            let info = match generated {
                Ok(Ok(Some(info))) => info,
                Ok(Ok(None)) => continue,
                Ok(Err(err)) => {
                    error!(path = %file.path.display(), %err, "failed to generate metadata");
                    continue;
                }
                Err(err) => {
                    error!(path = %file.path.display(), %err, "metadata task failed");
                    continue;
                }
            };

            let stat = match tokio::fs::metadata(&file.path).await {
                Ok(stat) => stat,
                Err(err) => {
                    error!(path = %file.path.display(), %err, "failed to stat");
                    continue;
                }
            };
            if stat.len() != size || stat.modified().ok() != mtime {
                debug!(
                    path = %file.path.display(),
                    "file changed while hashing, waiting for next notification"
                );
                continue;
            }

            file.publish(size, mtime, Arc::new(info));
            debug!(path = %rel.display(), "metadata ready");
        }
    }
}

/// Walks a directory tree, subscribing to every directory and synthesizing
/// an event for every regular file found.
async fn walk_and_watch(
    dir: PathBuf,
    fs_watcher: Arc<Mutex<RecommendedWatcher>>,
    events: mpsc::Sender<PathBuf>,
) {
    debug!(path = %dir.display(), "walking directory");

    let mut stack = vec![dir];
    while let Some(dir) = stack.pop() {
        if let Err(err) = fs_watcher.lock().watch(&dir, RecursiveMode::NonRecursive) {
            error!(path = %dir.display(), %err, "failed to watch directory");
            continue;
        }
        info!(path = %dir.display(), "watching directory");

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                error!(path = %dir.display(), %err, "failed to read directory");
                continue;
            }
        };

        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    match entry.file_type().await {
                        Ok(kind) if kind.is_dir() => stack.push(path),
                        Ok(_) => {
                            let _ = events.send(path).await;
                        }
                        Err(err) => {
                            error!(path = %path.display(), %err, "failed to stat entry")
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(path = %dir.display(), %err, "failed to read directory entry");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Polls until `check` passes or a generous deadline expires.
    async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initial_scan_discovers_existing_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"testing").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"more testing").unwrap();
        fs::write(dir.path().join(".hidden"), b"nope").unwrap();
        fs::write(dir.path().join("c.mdcache"), b"nope").unwrap();

        let watcher = Watcher::start(dir.path()).unwrap();

        wait_for("metadata for a.txt", || {
            watcher
                .get_file(Path::new("a.txt"))
                .and_then(|f| f.metadata())
                .is_some()
        })
        .await;
        wait_for("metadata for sub/b.txt", || {
            watcher
                .get_file(Path::new("sub/b.txt"))
                .and_then(|f| f.metadata())
                .is_some()
        })
        .await;

        assert!(watcher.get_file(Path::new(".hidden")).is_none());
        assert!(watcher.get_file(Path::new("c.mdcache")).is_none());
        assert_eq!(watcher.files().len(), 2);

        let info = watcher
            .get_file(Path::new("a.txt"))
            .unwrap()
            .metadata()
            .unwrap();
        assert_eq!(info.name, "a.txt");
        assert_eq!(info.length, 7);
        assert_eq!(info.piece_count(), 1);

        watcher.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn created_file_is_discovered() {
        let dir = TempDir::new().unwrap();
        let watcher = Watcher::start(dir.path()).unwrap();

        // Give the initial walk a moment to subscribe the root.
        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::write(dir.path().join("late.txt"), b"arrived late").unwrap();

        wait_for("metadata for late.txt", || {
            watcher
                .get_file(Path::new("late.txt"))
                .and_then(|f| f.metadata())
                .is_some()
        })
        .await;

        watcher.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleted_file_is_dropped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("gone.txt"), b"soon gone").unwrap();

        let watcher = Watcher::start(dir.path()).unwrap();
        wait_for("gone.txt tracked", || {
            watcher.get_file(Path::new("gone.txt")).is_some()
        })
        .await;

        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        wait_for("gone.txt dropped", || {
            watcher.get_file(Path::new("gone.txt")).is_none()
        })
        .await;

        watcher.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_file_has_no_metadata() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("empty.bin"), b"").unwrap();

        let watcher = Watcher::start(dir.path()).unwrap();
        wait_for("empty.bin tracked", || {
            watcher.get_file(Path::new("empty.bin")).is_some()
        })
        .await;

        // It is tracked but never published, so it is never served.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(watcher
            .get_file(Path::new("empty.bin"))
            .unwrap()
            .metadata()
            .is_none());

        watcher.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rewrite_republishes_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, b"testing").unwrap();

        let watcher = Watcher::start(dir.path()).unwrap();
        wait_for("first metadata", || {
            watcher
                .get_file(Path::new("data.txt"))
                .and_then(|f| f.metadata())
                .is_some()
        })
        .await;

        fs::write(&path, b"testing, but considerably longer now").unwrap();
        wait_for("updated metadata", || {
            watcher
                .get_file(Path::new("data.txt"))
                .and_then(|f| f.metadata())
                .is_some_and(|m| m.length == 36)
        })
        .await;

        watcher.close();
    }
}
