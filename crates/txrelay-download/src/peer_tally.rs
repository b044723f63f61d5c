//! Hook for reporting peer misbehavior to the surrounding layer.

use crate::PeerId;

/// Receives misbehavior reports from the download scheduler. The scheduler
/// never disconnects or bans a peer itself; scoring policy lives with the
/// embedder.
pub trait PeerTally: Send + Sync {
    /// The peer announced more transactions than its limit allows.
    fn record_announcement_overflow(&self, peer_id: PeerId);

    /// The peer sent a message violating protocol bounds, such as an
    /// oversized inv batch.
    fn record_protocol_violation(&self, peer_id: PeerId);

    /// The peer delivered a transaction we never requested from it.
    fn record_unsolicited_tx(&self, peer_id: PeerId);
}

/// Tally that ignores all reports.
#[derive(Debug, Clone, Copy)]
pub struct NoPeerTally;

impl PeerTally for NoPeerTally {
    fn record_announcement_overflow(&self, _peer_id: PeerId) {}
    fn record_protocol_violation(&self, _peer_id: PeerId) {}
    fn record_unsolicited_tx(&self, _peer_id: PeerId) {}
}
