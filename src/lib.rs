//! distributor - serve a directory of files over BitTorrent
//!
//! A distributor watches one or more root directories, hashes every regular
//! file into torrent pieces (caching the digests on disk next to the file),
//! and runs an HTTP endpoint that both synthesizes `.torrent` documents on
//! demand and acts as the tracker for the resulting swarms. Actual payload
//! transfer is delegated to an external ctorrent-compatible seeding binary,
//! spawned lazily per served file.
//!
//! # Modules
//!
//! - [`hash`] - SHA-1 piece hashing
//! - [`metadata`] - torrent metadata generation and the on-disk hash cache
//! - [`watcher`] - live file tables driven by filesystem notifications
//! - [`seed`] - seeding subprocess supervision
//! - [`tracker`] - the `/serve`, `/serve_last_updated`, and `/announce`
//!   HTTP endpoints with per-info-hash peer registries
//! - [`distributor`] - composition root and lifecycle
//!
//! # Usage
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
//! distributor.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod distributor;
pub mod hash;
pub mod metadata;
pub mod seed;
pub mod tracker;
pub mod watcher;

pub use distributor::{Distributor, DistributorError};
pub use hash::{hash_pieces, PieceHashes, PIECE_LENGTH};
pub use metadata::{Metadata, MetadataError, MetadataInfo};
pub use seed::{SeedError, SeedState, SeedSupervisor};
pub use tracker::{AnnounceReply, InfoHash, Peer, PeerRegistry, Tracker};
pub use watcher::{File, WatchError, Watcher};
