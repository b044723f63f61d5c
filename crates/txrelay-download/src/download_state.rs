//! Per-peer transaction announcement tracking.
//!
//! Every peer gets one [`PeerDownloadState`]. A transaction announced by the
//! peer lives in exactly one of two time-ordered queues: `announced` (not yet
//! requested, ordered by the next time we may request it) or `requested`
//! (getdata sent, ordered by the time the request expires). The canonical
//! timestamp is kept in the `by_hash` map; the queues store `(timestamp,
//! txid)` keys only, so moving a transaction between queues means removing
//! the old key, updating the map entry, and inserting the new key.

use crate::Direction;
use bitcoin::Txid;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Per-peer resource limits for announcement tracking.
#[derive(Debug, Clone, Copy)]
pub struct DownloadLimits {
    /// Maximum number of transactions tracked for a peer across both queues.
    pub max_announcements: usize,
    /// Maximum number of concurrent getdata requests to a peer.
    pub max_in_flight: usize,
    /// How long an unrequested announcement is kept before it is dropped.
    pub announcement_lifetime: Duration,
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self {
            max_announcements: 5000,
            max_in_flight: 100,
            announcement_lifetime: Duration::from_secs(20 * 60),
        }
    }
}

/// Which queue currently holds an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Announced,
    Requested,
}

/// Tracked announcement. The timestamp means "earliest request time" while
/// the entry sits in `announced` and "request expiry time" once it has moved
/// to `requested`.
#[derive(Debug, Clone, Copy)]
struct Announcement {
    timestamp: Duration,
    queue: Queue,
}

/// Transaction download state for a single peer.
#[derive(Debug)]
pub struct PeerDownloadState {
    direction: Direction,
    limits: DownloadLimits,
    /// All transactions announced by this peer.
    by_hash: HashMap<Txid, Announcement>,
    /// Announced but not yet requested, ordered by earliest request time.
    announced: BTreeSet<(Duration, Txid)>,
    /// Requested from this peer, ordered by expiry time.
    requested: BTreeSet<(Duration, Txid)>,
    /// Announcements rejected because the peer exceeded its limit.
    dropped_announcements: u64,
}

impl PeerDownloadState {
    pub fn new(direction: Direction, limits: DownloadLimits) -> Self {
        Self {
            direction,
            limits,
            by_hash: HashMap::new(),
            announced: BTreeSet::new(),
            requested: BTreeSet::new(),
            dropped_announcements: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The peer announced a transaction. Returns `false` if the announcement
    /// was rejected because the peer is at its announcement limit; an
    /// announcement for a transaction that is already tracked is a no-op.
    pub fn add_announced(&mut self, hash: Txid, request_time: Duration) -> bool {
        if self.by_hash.contains_key(&hash) {
            return true;
        }

        if self.by_hash.len() >= self.limits.max_announcements {
            self.dropped_announcements += 1;
            return false;
        }

        self.by_hash.insert(
            hash,
            Announcement {
                timestamp: request_time,
                queue: Queue::Announced,
            },
        );
        self.announced.insert((request_time, hash));

        true
    }

    /// Another peer holds the outstanding request for this transaction.
    /// Re-arm this peer as a fallback by moving the announcement back to the
    /// announced queue with a fresh request time.
    pub fn requeue(&mut self, hash: Txid, new_request_time: Duration) {
        let Some(announcement) = self.by_hash.get_mut(&hash) else {
            return;
        };

        match announcement.queue {
            Queue::Announced => {
                self.announced.remove(&(announcement.timestamp, hash));
            }
            Queue::Requested => {
                self.requested.remove(&(announcement.timestamp, hash));
            }
        }

        announcement.timestamp = new_request_time;
        announcement.queue = Queue::Announced;
        self.announced.insert((new_request_time, hash));
    }

    /// A getdata for this transaction was sent to the peer. Move the
    /// announcement to the requested queue keyed by its expiry time.
    ///
    /// The caller must have checked [`Self::max_in_flight`] first.
    pub fn set_request_expiry(&mut self, hash: Txid, expiry: Duration) {
        debug_assert!(self.requested.len() < self.limits.max_in_flight);

        let Some(announcement) = self.by_hash.get_mut(&hash) else {
            return;
        };

        if announcement.queue == Queue::Announced {
            self.announced.remove(&(announcement.timestamp, hash));
        } else {
            self.requested.remove(&(announcement.timestamp, hash));
        }

        announcement.timestamp = expiry;
        announcement.queue = Queue::Requested;
        self.requested.insert((expiry, hash));
    }

    /// The transaction was received or expired. Forget it entirely.
    /// Idempotent.
    pub fn remove(&mut self, hash: Txid) {
        let Some(announcement) = self.by_hash.remove(&hash) else {
            return;
        };

        match announcement.queue {
            Queue::Announced => {
                self.announced.remove(&(announcement.timestamp, hash));
            }
            Queue::Requested => {
                self.requested.remove(&(announcement.timestamp, hash));
            }
        }
    }

    /// Drop announcements that have been waiting longer than the
    /// announcement lifetime without ever being requested. Returns how many
    /// were dropped so the caller can log a single per-peer line.
    pub fn expire_old_announcements(&mut self, now: Duration) -> usize {
        let cutoff = now.saturating_sub(self.limits.announcement_lifetime);

        let mut expired = 0;
        while let Some(&(timestamp, hash)) = self.announced.first() {
            if timestamp >= cutoff {
                break;
            }
            self.announced.remove(&(timestamp, hash));
            self.by_hash.remove(&hash);
            expired += 1;
        }

        expired
    }

    /// Pop every request whose expiry has passed. Returns `(txid, expiry)`
    /// pairs so the scheduler can release the matching global claims.
    pub fn expire_requests(&mut self, now: Duration) -> Vec<(Txid, Duration)> {
        let mut expired = Vec::new();
        while let Some(&(expiry, hash)) = self.requested.first() {
            if expiry > now {
                break;
            }
            self.requested.remove(&(expiry, hash));
            self.by_hash.remove(&hash);
            expired.push((hash, expiry));
        }
        expired
    }

    /// Head of the announced queue if its request time has been reached.
    pub fn next_due_announcement(&self, now: Duration) -> Option<Txid> {
        self.announced
            .first()
            .filter(|(timestamp, _)| *timestamp <= now)
            .map(|(_, hash)| *hash)
    }

    /// Whether the peer is at its concurrent request limit.
    pub fn max_in_flight(&self) -> bool {
        self.requested.len() >= self.limits.max_in_flight
    }

    /// Requests currently in flight to this peer, with their expiry times.
    pub fn in_flight(&self) -> impl Iterator<Item = (Txid, Duration)> + '_ {
        self.requested.iter().map(|(expiry, hash)| (*hash, *expiry))
    }

    pub fn contains(&self, hash: &Txid) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Whether a getdata for this transaction is outstanding at this peer.
    pub fn has_requested(&self, hash: &Txid) -> bool {
        self.by_hash
            .get(hash)
            .is_some_and(|announcement| announcement.queue == Queue::Requested)
    }

    /// Number of transactions tracked for this peer.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn announced_len(&self) -> usize {
        self.announced.len()
    }

    pub fn requested_len(&self) -> usize {
        self.requested.len()
    }

    /// Announcements rejected so far because the peer was over its limit.
    pub fn dropped_announcements(&self) -> u64 {
        self.dropped_announcements
    }

    /// Every tracked transaction must sit in exactly one queue.
    #[cfg(test)]
    pub(crate) fn check_consistency(&self) {
        assert_eq!(self.by_hash.len(), self.announced.len() + self.requested.len());
        assert!(self.by_hash.len() <= self.limits.max_announcements);
        assert!(self.requested.len() <= self.limits.max_in_flight);

        for (hash, announcement) in &self.by_hash {
            let key = (announcement.timestamp, *hash);
            match announcement.queue {
                Queue::Announced => {
                    assert!(self.announced.contains(&key));
                    assert!(!self.requested.contains(&key));
                }
                Queue::Requested => {
                    assert!(self.requested.contains(&key));
                    assert!(!self.announced.contains(&key));
                }
            }
        }
    }
}
