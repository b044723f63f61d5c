//! # Mempool Rebroadcast
//!
//! Periodically re-announces local transactions that should have been mined
//! by now but were not. Candidates are picked by running the miner's own
//! candidate selection over the mempool, so only transactions competitive at
//! the current fee level are re-announced, and a per-transaction attempt
//! tracker keeps any single transaction from being rebroadcast too often or
//! too many times.
//!
//! The handler is driven by the embedder from two timers: a rebroadcast run
//! roughly every [`TX_REBROADCAST_INTERVAL`] and a fee rate cache update
//! every [`REBROADCAST_FEE_RATE_CACHE_INTERVAL`]. A rebroadcast run only
//! produces candidates once at least one block has connected after the last
//! cache update, which bounds rebroadcast to at most one run per block; the
//! cache must therefore be driven from the periodic timer, not solely from
//! block-connected notifications.

mod attempt_tracker;
#[cfg(test)]
mod tests;

use crate::attempt_tracker::AttemptTracker;
use bitcoin::{BlockHash, FeeRate, Weight, Wtxid};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use txrelay_primitives::{AssembleOptions, BlockAssembler, ChainApi, TxIds, TxPool};

pub use crate::attempt_tracker::{
    MAX_ENTRIES, MAX_ENTRY_AGE, MAX_REBROADCAST_COUNT, MIN_REATTEMPT_INTERVAL,
};

/// Average delay between rebroadcast runs.
pub const TX_REBROADCAST_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Frequency of fee rate cache updates.
pub const REBROADCAST_FEE_RATE_CACHE_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Minimum age for a transaction to be a rebroadcast candidate.
const REBROADCAST_MIN_TX_AGE: Duration = Duration::from_secs(30 * 60);

/// Rebroadcast candidate selection runs with 3/4 of the maximum block weight
/// to reduce noise from circumstances such as miners prioritising their own
/// transactions.
const MAX_REBROADCAST_WEIGHT: Weight = Weight::from_wu(Weight::MAX_BLOCK.to_wu() * 3 / 4);

/// Fee rate cache and attempt history, guarded by one mutex so a reader sees
/// either the pre-update or the post-update cache, never a mix.
#[derive(Debug)]
struct RebroadcastState {
    attempts: AttemptTracker,
    /// Marginal package fee rate of the last cache run.
    cached_fee_rate: FeeRate,
    /// Fee rate the cache held before the last update.
    previous_cached_fee_rate: FeeRate,
    /// Chain tip observed when the cache last ran.
    tip_at_cache_time: Option<BlockHash>,
    /// When the next cache run is due.
    next_min_fee_cache: Duration,
}

/// Selects which local transactions to re-announce to the network.
pub struct TxRebroadcastHandler<Pool, Chain, Assembler> {
    pool: Arc<Pool>,
    chain: Arc<Chain>,
    assembler: Arc<Assembler>,
    state: Mutex<RebroadcastState>,
}

impl<Pool, Chain, Assembler> TxRebroadcastHandler<Pool, Chain, Assembler>
where
    Pool: TxPool,
    Chain: ChainApi,
    Assembler: BlockAssembler,
{
    pub fn new(pool: Arc<Pool>, chain: Arc<Chain>, assembler: Arc<Assembler>) -> Self {
        Self {
            pool,
            chain,
            assembler,
            state: Mutex::new(RebroadcastState {
                attempts: AttemptTracker::new(),
                cached_fee_rate: FeeRate::ZERO,
                previous_cached_fee_rate: FeeRate::ZERO,
                tip_at_cache_time: None,
                next_min_fee_cache: Duration::ZERO,
            }),
        }
    }

    /// Identify the transactions to re-announce.
    ///
    /// Runs the block assembler over the mempool with a reduced weight
    /// budget, excluding transactions younger than thirty minutes and
    /// packages below the cached fee rate, then filters the candidates
    /// through the per-transaction attempt policy.
    pub fn get_rebroadcast_transactions(&self, now: Duration) -> Vec<TxIds> {
        if self.chain.is_initial_block_download() {
            return Vec::new();
        }

        let tip = self.chain.active_tip();

        let (cached_fee_rate, tip_at_cache_time) = {
            let state = self.state.lock();
            (state.cached_fee_rate, state.tip_at_cache_time)
        };

        if tip_at_cache_time == Some(tip) {
            tracing::trace!("Skipping rebroadcast: no block connected since the last cache run");
            return Vec::new();
        }

        // A zero fee rate means the cache never ran and the fee filter below
        // would admit everything.
        if cached_fee_rate == FeeRate::ZERO {
            tracing::trace!("Skipping rebroadcast: fee rate cache is empty");
            return Vec::new();
        }

        let mut max_weight = MAX_REBROADCAST_WEIGHT;
        if let Some(last_block_weight) = self.chain.last_block_weight() {
            let capped = Weight::from_wu(last_block_weight.to_wu() * 3 / 4);
            if capped < max_weight {
                max_weight = capped;
            }
        }

        let options = AssembleOptions {
            max_weight,
            skip_until: Some(now.saturating_sub(REBROADCAST_MIN_TX_AGE)),
            min_fee_rate: cached_fee_rate,
            validate_block: false,
        };

        let template = match self.assembler.assemble(options) {
            Ok(template) => template,
            Err(err) => {
                tracing::debug!("Skipping rebroadcast: {err}");
                return Vec::new();
            }
        };

        let mut state = self.state.lock();
        let mut rebroadcast_txs = Vec::new();
        let mut candidate_count = 0;

        for tx in template.txs.iter().filter(|tx| !tx.is_coinbase()) {
            candidate_count += 1;

            let wtxid = tx.compute_wtxid();

            // The transaction may have left the mempool since assembly.
            if !self.pool.contains_wtxid(&wtxid) {
                continue;
            }

            if state.attempts.record_attempt(wtxid, now) {
                rebroadcast_txs.push(TxIds {
                    txid: tx.compute_txid(),
                    wtxid,
                });
            }
        }

        // The age and capacity sweep runs on every pass, including those
        // where the assembler produced no candidates.
        state.attempts.trim(now);

        tracing::debug!(
            "{} rebroadcast candidates identified from {candidate_count} assembled, \
             with cached fee rate {cached_fee_rate:?}",
            rebroadcast_txs.len(),
        );

        rebroadcast_txs
    }

    /// Refresh the cached marginal inclusion fee rate and stamp the tip it
    /// was computed at. Skipped wholesale during initial sync.
    pub fn cache_min_rebroadcast_fee(&self, now: Duration) {
        if self.chain.is_initial_block_download() {
            return;
        }

        let tip = self.chain.active_tip();
        let fee_rate = self.assembler.min_tx_fee_rate();

        let mut state = self.state.lock();
        state.next_min_fee_cache = now + REBROADCAST_FEE_RATE_CACHE_INTERVAL;
        state.previous_cached_fee_rate = state.cached_fee_rate;
        state.cached_fee_rate = fee_rate;
        state.tip_at_cache_time = Some(tip);

        tracing::debug!(
            "Rebroadcast fee rate cache updated from {:?} to {:?}",
            state.previous_cached_fee_rate,
            state.cached_fee_rate,
        );
    }

    /// Whether the periodic fee rate cache run is due.
    pub fn fee_cache_due(&self, now: Duration) -> bool {
        self.state.lock().next_min_fee_cache <= now
    }

    /// Forget the attempt history of a transaction that left the mempool.
    pub fn remove_from_attempt_tracker(&self, wtxid: &Wtxid) {
        self.state.lock().attempts.remove(wtxid);
    }

    /// The currently cached marginal inclusion fee rate.
    pub fn cached_fee_rate(&self) -> FeeRate {
        self.state.lock().cached_fee_rate
    }

    #[cfg(test)]
    fn attempt_entry(&self, wtxid: &Wtxid) -> Option<(Duration, u32)> {
        self.state
            .lock()
            .attempts
            .get(wtxid)
            .map(|entry| (entry.last_attempt, entry.count))
    }

    #[cfg(test)]
    fn force_attempt_count(&self, wtxid: &Wtxid, count: u32) {
        self.state.lock().attempts.force_count(wtxid, count);
    }

    #[cfg(test)]
    fn tracker_len(&self) -> usize {
        self.state.lock().attempts.len()
    }

    #[cfg(test)]
    fn previous_cached_fee_rate(&self) -> FeeRate {
        self.state.lock().previous_cached_fee_rate
    }
}
