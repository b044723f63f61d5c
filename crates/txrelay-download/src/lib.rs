//! # Transaction Download Scheduling
//!
//! This crate decides from which peer and when to download each newly
//! announced transaction. Peers advertise transactions via `inv`; we answer
//! with `getdata` requests, one peer at a time per transaction.
//!
//! Design goals, in order:
//!
//! - Request a transaction from one peer at a time to avoid wasting
//!   bandwidth.
//! - Prefer downloading from outbound peers, which makes it harder for an
//!   adversary holding many inbound connections to blind us to a
//!   transaction or to map the relay topology.
//! - Bound the announcement and in-flight state any single peer can force
//!   us to hold.
//! - Time out unresponsive peers and fall back to another announcer.
//!
//! The crate is a synchronous library. The embedding network layer feeds it
//! `inv` arrivals, transaction arrivals, disconnects, and a periodic tick,
//! and sends the `getdata` batches it returns.

mod download_state;
mod downloader;
mod peer_tally;
mod recent_rejects;

use std::net::SocketAddr;

pub use self::download_state::{DownloadLimits, PeerDownloadState};
pub use self::downloader::{DownloadOptions, TxDownloader};
pub use self::peer_tally::{NoPeerTally, PeerTally};

/// Identifies a peer.
pub type PeerId = SocketAddr;

/// Who initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote side connected to us.
    Inbound,
    /// We connected to the remote side.
    Outbound,
}

impl Direction {
    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Outbound)
    }
}

/// Download scheduling error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Too many inventory items")]
    TooManyInventoryItems,
    #[error("Peer {0:?} not found")]
    PeerNotFound(PeerId),
}
