//! Bounded store of per-transaction rebroadcast attempts.
//!
//! Two indices are kept in lockstep: a hash map by wtxid for O(1) policy
//! lookups and a `BTreeSet` ordered by last attempt time for O(log n) trim
//! scans of the oldest entries. The attempt time stored in the map entry is
//! the set key, so reindexing an entry means removing the old key, mutating,
//! and inserting the new key.

use bitcoin::Wtxid;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Maximum number of transactions tracked.
pub const MAX_ENTRIES: usize = 500;

/// Entries untouched for longer than this are dropped, roughly three months.
pub const MAX_ENTRY_AGE: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Maximum number of times a transaction is rebroadcast.
pub const MAX_REBROADCAST_COUNT: u32 = 6;

/// Minimum gap between two rebroadcast attempts of the same transaction.
pub const MIN_REATTEMPT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub(crate) struct RebroadcastEntry {
    pub last_attempt: Duration,
    pub count: u32,
}

/// Tracks how often and how recently each transaction has been rebroadcast.
#[derive(Debug, Default)]
pub(crate) struct AttemptTracker {
    entries: HashMap<Wtxid, RebroadcastEntry>,
    by_last_attempt: BTreeSet<(Duration, Wtxid)>,
}

impl AttemptTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Apply the attempt policy for one candidate. Returns whether the
    /// transaction may be rebroadcast now, recording the attempt if so.
    ///
    /// A transaction with no history is always admitted. A known transaction
    /// is rejected once it has hit [`MAX_REBROADCAST_COUNT`] attempts or if
    /// its previous attempt is younger than [`MIN_REATTEMPT_INTERVAL`];
    /// rejected entries are left untouched.
    pub(crate) fn record_attempt(&mut self, wtxid: Wtxid, now: Duration) -> bool {
        match self.entries.get_mut(&wtxid) {
            None => {
                self.entries.insert(
                    wtxid,
                    RebroadcastEntry {
                        last_attempt: now,
                        count: 1,
                    },
                );
                self.by_last_attempt.insert((now, wtxid));
                true
            }
            Some(entry) if entry.count >= MAX_REBROADCAST_COUNT => false,
            Some(entry) if entry.last_attempt + MIN_REATTEMPT_INTERVAL > now => false,
            Some(entry) => {
                self.by_last_attempt.remove(&(entry.last_attempt, wtxid));
                entry.last_attempt = now;
                entry.count += 1;
                self.by_last_attempt.insert((now, wtxid));
                true
            }
        }
    }

    /// Forget a transaction, typically because it left the mempool.
    /// Idempotent.
    pub(crate) fn remove(&mut self, wtxid: &Wtxid) {
        if let Some(entry) = self.entries.remove(wtxid) {
            self.by_last_attempt.remove(&(entry.last_attempt, *wtxid));
        }
    }

    /// Restore the age and capacity bounds, oldest entries first.
    pub(crate) fn trim(&mut self, now: Duration) {
        let cutoff = now.saturating_sub(MAX_ENTRY_AGE);
        while let Some(&(last_attempt, wtxid)) = self.by_last_attempt.first() {
            if last_attempt >= cutoff {
                break;
            }
            self.by_last_attempt.remove(&(last_attempt, wtxid));
            self.entries.remove(&wtxid);
        }

        while self.entries.len() > MAX_ENTRIES {
            let Some(&(last_attempt, wtxid)) = self.by_last_attempt.first() else {
                break;
            };
            self.by_last_attempt.remove(&(last_attempt, wtxid));
            self.entries.remove(&wtxid);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, wtxid: &Wtxid) -> Option<&RebroadcastEntry> {
        self.entries.get(wtxid)
    }

    #[cfg(test)]
    pub(crate) fn force_count(&mut self, wtxid: &Wtxid, count: u32) {
        if let Some(entry) = self.entries.get_mut(wtxid) {
            entry.count = count;
        }
    }

    #[cfg(test)]
    pub(crate) fn oldest_attempt(&self) -> Option<Duration> {
        self.by_last_attempt.first().map(|(time, _)| *time)
    }
}
