//! Cross-peer transaction download scheduling.
//!
//! The scheduler owns one [`PeerDownloadState`] per connected peer plus the
//! process-wide `asked_for` map recording which transaction currently has an
//! outstanding getdata request and when it was sent. A transaction is
//! requested from at most one peer at a time; every other announcer is
//! re-armed to fire after the outstanding request would time out, with a
//! small random delay so a fixed peer-processing order does not bias which
//! fallback wins.

use crate::download_state::{DownloadLimits, PeerDownloadState};
use crate::peer_tally::PeerTally;
use crate::recent_rejects::RecentRejects;
use crate::{Direction, Error, PeerId};
use bitcoin::p2p::message::MAX_INV_SIZE;
use bitcoin::Txid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use txrelay_primitives::TxPool;

/// Capacity of the recently-rejected txid filter.
const RECENT_REJECTS_CAPACITY: usize = 40_000;

/// Tuning knobs for the download scheduler.
#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    /// Per-peer announcement and in-flight limits.
    pub limits: DownloadLimits,
    /// How long to wait before considering a request to an inbound peer, so
    /// outbound announcers get the first chance.
    pub inbound_peer_tx_delay: Duration,
    /// How long a getdata request may stay unanswered before we try another
    /// peer.
    pub getdata_tx_interval: Duration,
    /// Upper bound of the random delay added when re-arming a fallback peer.
    pub max_getdata_random_delay: Duration,
    /// Maximum number of items accepted in a single inv message.
    pub max_inv_items: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            limits: DownloadLimits::default(),
            inbound_peer_tx_delay: Duration::from_secs(2),
            getdata_tx_interval: Duration::from_secs(60),
            max_getdata_random_delay: Duration::from_secs(2),
            max_inv_items: MAX_INV_SIZE,
        }
    }
}

/// Transaction download scheduler.
pub struct TxDownloader<Pool> {
    /// The local transaction pool, consulted to skip announcements of
    /// transactions we already have.
    pool: Arc<Pool>,
    options: DownloadOptions,
    /// Download state per connected peer.
    peers: HashMap<PeerId, PeerDownloadState>,
    /// Transactions with an outstanding getdata request anywhere, keyed to
    /// the time the request was sent.
    asked_for: HashMap<Txid, Duration>,
    /// Transactions that recently failed validation.
    recent_rejects: RecentRejects,
    /// Misbehavior reporting hook.
    peer_tally: Arc<dyn PeerTally>,
    /// Randomness for fallback request jitter.
    rng: fastrand::Rng,
}

impl<Pool: TxPool> TxDownloader<Pool> {
    pub fn new(pool: Arc<Pool>, peer_tally: Arc<dyn PeerTally>) -> Self {
        Self::with_options(pool, peer_tally, DownloadOptions::default())
    }

    pub fn with_options(
        pool: Arc<Pool>,
        peer_tally: Arc<dyn PeerTally>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            pool,
            options,
            peers: HashMap::new(),
            asked_for: HashMap::new(),
            recent_rejects: RecentRejects::new(RECENT_REJECTS_CAPACITY),
            peer_tally,
            rng: fastrand::Rng::new(),
        }
    }

    /// Start tracking a newly connected peer.
    pub fn on_peer_connected(&mut self, peer_id: PeerId, direction: Direction) {
        let limits = self.options.limits;
        self.peers
            .entry(peer_id)
            .or_insert_with(|| PeerDownloadState::new(direction, limits));
    }

    /// Drop all state owned by a disconnected peer, releasing any request
    /// claims it held so other announcers become immediately eligible.
    pub fn on_peer_disconnected(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.remove(&peer_id) else {
            return;
        };

        for (hash, expiry) in peer.in_flight() {
            release_claim(
                &mut self.asked_for,
                hash,
                expiry,
                self.options.getdata_tx_interval,
            );
        }

        tracing::debug!(?peer_id, "Removed download state of disconnected peer");
    }

    /// Handle a batch of transaction announcements from a peer.
    ///
    /// Inbound announcers are scheduled [`DownloadOptions::inbound_peer_tx_delay`]
    /// into the future so an outbound peer announcing the same transaction
    /// wins the first request.
    pub fn on_inv(&mut self, peer_id: PeerId, txids: Vec<Txid>, now: Duration) -> Result<(), Error> {
        if txids.len() > self.options.max_inv_items {
            self.peer_tally.record_protocol_violation(peer_id);
            return Err(Error::TooManyInventoryItems);
        }

        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Err(Error::PeerNotFound(peer_id));
        };

        let request_time = if peer.direction().is_outbound() {
            now
        } else {
            now + self.options.inbound_peer_tx_delay
        };

        for txid in txids {
            if self.pool.contains(&txid) || self.recent_rejects.contains(&txid) {
                continue;
            }

            if !peer.add_announced(txid, request_time) {
                tracing::trace!(?peer_id, "Announcement limit reached, dropping {txid}");
                self.peer_tally.record_announcement_overflow(peer_id);
            }
        }

        Ok(())
    }

    /// A transaction arrived. Clear it everywhere: the delivering peer, every
    /// fallback announcer, and the global request claim, so nobody fetches it
    /// again.
    pub fn on_tx_received(&mut self, peer_id: PeerId, txid: Txid) {
        if let Some(peer) = self.peers.get(&peer_id) {
            if !peer.has_requested(&txid) {
                self.peer_tally.record_unsolicited_tx(peer_id);
            }
        }

        self.asked_for.remove(&txid);

        for peer in self.peers.values_mut() {
            peer.remove(txid);
        }
    }

    /// A received transaction failed validation. Remember it so renewed
    /// announcements are not fetched again.
    pub fn on_tx_rejected(&mut self, txid: Txid) {
        self.recent_rejects.insert(txid);
    }

    /// Select the transactions to request from this peer now.
    ///
    /// Walks the peer's due announcements in request-time order. Transactions
    /// we already have are dropped; transactions with an outstanding request
    /// at another peer are re-armed to fire after that request would time
    /// out; the rest are moved to the requested queue, claimed globally, and
    /// returned for a getdata batch.
    pub fn get_announcements_to_request(&mut self, peer_id: PeerId, now: Duration) -> Vec<Txid> {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Vec::new();
        };

        // Free up request slots and claims held by timed-out requests before
        // selecting new work.
        let timed_out = peer.expire_requests(now);
        if !timed_out.is_empty() {
            tracing::debug!(
                ?peer_id,
                count = timed_out.len(),
                "Expiring timed-out getdata requests"
            );
            for (hash, expiry) in timed_out {
                release_claim(
                    &mut self.asked_for,
                    hash,
                    expiry,
                    self.options.getdata_tx_interval,
                );
            }
        }

        let stale = peer.expire_old_announcements(now);
        if stale > 0 {
            tracing::debug!(?peer_id, count = stale, "Expired stale announcements");
        }

        let mut to_request = Vec::new();

        while !peer.max_in_flight() {
            let Some(hash) = peer.next_due_announcement(now) else {
                break;
            };

            if self.pool.contains(&hash) || self.recent_rejects.contains(&hash) {
                peer.remove(hash);
                continue;
            }

            match self.asked_for.get(&hash) {
                Some(&last_request)
                    if last_request + self.options.getdata_tx_interval > now =>
                {
                    // Another peer owns the outstanding request. Re-arm this
                    // peer to fire once that request times out, preferring
                    // outbound fallbacks and adding jitter so iteration
                    // order does not pick the same fallback every time.
                    let mut request_time = last_request + self.options.getdata_tx_interval;
                    if !peer.direction().is_outbound() {
                        request_time += self.options.inbound_peer_tx_delay;
                    }
                    let max_jitter = self.options.max_getdata_random_delay.as_micros() as u64;
                    request_time += Duration::from_micros(self.rng.u64(0..=max_jitter));

                    tracing::trace!(?peer_id, "Requeueing {hash} until {request_time:?}");
                    peer.requeue(hash, request_time);
                }
                _ => {
                    let expiry = now + self.options.getdata_tx_interval;
                    peer.set_request_expiry(hash, expiry);
                    self.asked_for.insert(hash, now);
                    to_request.push(hash);
                }
            }
        }

        to_request
    }

    /// One scheduling pass over all peers, producing the getdata batches to
    /// send. The interrupt flag is checked between peers so shutdown does
    /// not wait for a full pass; per-peer state is always left consistent.
    pub fn process_pending(
        &mut self,
        now: Duration,
        interrupt: &AtomicBool,
    ) -> Vec<(PeerId, Vec<Txid>)> {
        let peer_ids = self.peers.keys().copied().collect::<Vec<_>>();

        let mut batches = Vec::new();
        for peer_id in peer_ids {
            if interrupt.load(Ordering::Relaxed) {
                break;
            }

            let to_request = self.get_announcements_to_request(peer_id, now);
            if !to_request.is_empty() {
                batches.push((peer_id, to_request));
            }
        }

        batches
    }

    /// Whether any peer currently has an outstanding request for this
    /// transaction.
    pub fn is_in_flight(&self, txid: &Txid) -> bool {
        self.asked_for.contains_key(txid)
    }

    /// Download state of a connected peer.
    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerDownloadState> {
        self.peers.get(peer_id)
    }

    pub fn connected_peers_count(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub(crate) fn seed_rng(&mut self, seed: u64) {
        self.rng = fastrand::Rng::with_seed(seed);
    }

    /// Every claim must have exactly one requesting peer, and every live
    /// request must be backed by its own claim.
    #[cfg(test)]
    pub(crate) fn check_consistency(&self, now: Duration) {
        let interval = self.options.getdata_tx_interval;

        for peer in self.peers.values() {
            peer.check_consistency();
        }

        for (hash, request_time) in &self.asked_for {
            let expiry = *request_time + interval;
            let claimants = self
                .peers
                .values()
                .filter(|peer| peer.in_flight().any(|(h, e)| h == *hash && e == expiry))
                .count();
            assert_eq!(claimants, 1, "claim for {hash} has {claimants} requesters");
        }

        for peer in self.peers.values() {
            for (hash, expiry) in peer.in_flight() {
                if expiry > now {
                    assert_eq!(
                        self.asked_for.get(&hash),
                        Some(&(expiry - interval)),
                        "live request for {hash} lacks a matching claim"
                    );
                }
            }
        }
    }
}

/// Release a request claim when the owning request times out or the owning
/// peer goes away. Another peer may have re-claimed the transaction in the
/// same pass, so the claim is only dropped if it still records the owning
/// request's send time.
fn release_claim(
    asked_for: &mut HashMap<Txid, Duration>,
    hash: Txid,
    expiry: Duration,
    interval: Duration,
) {
    let own_request_time = expiry.saturating_sub(interval);
    if asked_for.get(&hash) == Some(&own_request_time) {
        asked_for.remove(&hash);
    }
}
