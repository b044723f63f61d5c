//! Bounded filter of recently rejected transactions.

use bitcoin::Txid;
use indexmap::IndexSet;

/// Remembers txids that recently failed validation so they are not fetched
/// again from other announcers. FIFO order, oldest entry evicted at capacity.
#[derive(Debug)]
pub(crate) struct RecentRejects {
    txids: IndexSet<Txid>,
    capacity: usize,
}

impl RecentRejects {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            txids: IndexSet::new(),
            capacity,
        }
    }

    pub(crate) fn insert(&mut self, txid: Txid) {
        if self.txids.contains(&txid) {
            return;
        }

        if self.txids.len() == self.capacity {
            self.txids.shift_remove_index(0);
        }

        self.txids.insert(txid);
    }

    pub(crate) fn contains(&self, txid: &Txid) -> bool {
        self.txids.contains(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::txid;

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut rejects = RecentRejects::new(2);

        rejects.insert(txid(1));
        rejects.insert(txid(2));
        rejects.insert(txid(3));

        assert!(!rejects.contains(&txid(1)));
        assert!(rejects.contains(&txid(2)));
        assert!(rejects.contains(&txid(3)));
    }

    #[test]
    fn reinsert_does_not_evict() {
        let mut rejects = RecentRejects::new(2);

        rejects.insert(txid(1));
        rejects.insert(txid(2));
        rejects.insert(txid(2));

        assert!(rejects.contains(&txid(1)));
        assert!(rejects.contains(&txid(2)));
    }
}
