//! Mempool abstraction consumed by the propagation components.

use bitcoin::{Amount, FeeRate, Txid, Weight, Wtxid};
use std::time::Duration;

/// Per-transaction data the propagation components read from a mempool entry.
#[derive(Debug, Clone, Copy)]
pub struct PoolEntry {
    /// Fee including any prioritisation delta.
    pub modified_fee: Amount,
    /// Transaction weight.
    pub weight: Weight,
    /// Time at which the transaction entered the pool.
    pub time: Duration,
}

impl PoolEntry {
    /// Fee rate derived from the modified fee and the transaction weight.
    pub fn fee_rate(&self) -> FeeRate {
        let wu = self.weight.to_wu();
        if wu == 0 {
            return FeeRate::ZERO;
        }
        FeeRate::from_sat_per_kwu(self.modified_fee.to_sat().saturating_mul(1000) / wu)
    }
}

/// Transaction pool trait for the propagation components.
///
/// All methods are synchronous; the embedder decides whether to call them
/// inline or from a blocking executor. Implementations must answer
/// consistently within a single call into the propagation core, which in
/// practice means holding their internal lock per method call.
pub trait TxPool: Send + Sync + 'static {
    /// Whether the pool contains a transaction with this txid.
    fn contains(&self, txid: &Txid) -> bool;

    /// Whether the pool contains a transaction with this wtxid.
    fn contains_wtxid(&self, wtxid: &Wtxid) -> bool;

    /// Entry data for a transaction, if present.
    fn entry(&self, txid: &Txid) -> Option<PoolEntry>;

    /// Snapshot of all entries, sorted by mining priority (highest first).
    fn entries(&self) -> Vec<(Txid, PoolEntry)>;
}

/// Pool stub reporting an empty mempool.
#[derive(Debug, Default, Clone)]
pub struct NoOpTxPool;

impl TxPool for NoOpTxPool {
    fn contains(&self, _txid: &Txid) -> bool {
        false
    }

    fn contains_wtxid(&self, _wtxid: &Wtxid) -> bool {
        false
    }

    fn entry(&self, _txid: &Txid) -> Option<PoolEntry> {
        None
    }

    fn entries(&self) -> Vec<(Txid, PoolEntry)> {
        Vec::new()
    }
}
