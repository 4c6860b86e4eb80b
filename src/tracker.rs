//! HTTP tracker and torrent serving ([BEP-3]).
//!
//! The tracker side of the distributor: it hands out torrent documents for
//! watched files and coordinates the swarm for each of them.
//!
//! # Endpoints
//!
//! - `GET /serve?<filename>` — synthesizes the `.torrent` document for a
//!   watcher-relative filename, starting a seed for it as a side effect.
//! - `GET /serve_last_updated[?<watcher_name>]` — the same for whichever
//!   file changed most recently.
//! - `GET /announce?...` — the classic announce: registers the caller in
//!   the swarm for its info-hash and returns other peers.
//!
//! Responses are bencoded documents or plain-text error literals, always
//! with HTTP 200; the consuming clients parse bodies, not status codes.
//!
//! # Peer bookkeeping
//!
//! Swarm state is in-memory only. Peers are evicted opportunistically when
//! a new peer arrives: anything reusing the newcomer's address goes, as
//! does anything that has not announced within the expiry window. An
//! announce response never includes peers sharing the requester's address.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod http;
mod query;
mod registry;

pub use http::{AnnounceReply, Tracker};
pub use registry::{
    Announce, InfoHash, Peer, PeerRegistry, DEFAULT_NUMWANT, MAX_NUMWANT, PEER_EXPIRY,
};
