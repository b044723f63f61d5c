//! Block assembler abstraction.
//!
//! The rebroadcast selector reuses the miner's candidate selection to find
//! the highest fee-rate transactions in the mempool. Only the knobs the
//! selector actually turns are modelled here.

use bitcoin::{FeeRate, Transaction, Weight};
use std::sync::Arc;
use std::time::Duration;

/// Options for a single block assembly run.
#[derive(Debug, Clone, Copy)]
pub struct AssembleOptions {
    /// Weight budget for the candidate block.
    pub max_weight: Weight,
    /// Exclude transactions that entered the pool after this time.
    pub skip_until: Option<Duration>,
    /// Exclude packages below this fee rate.
    pub min_fee_rate: FeeRate,
    /// Whether the assembler should run block validity checks on the result.
    pub validate_block: bool,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            max_weight: Weight::MAX_BLOCK,
            skip_until: None,
            min_fee_rate: FeeRate::ZERO,
            validate_block: true,
        }
    }
}

/// A candidate block produced by the assembler.
///
/// The first transaction is the coinbase, matching what the miner produces.
#[derive(Debug, Clone, Default)]
pub struct BlockTemplate {
    pub txs: Vec<Arc<Transaction>>,
}

/// Failure to assemble a candidate block.
#[derive(Debug, thiserror::Error)]
#[error("block assembly failed: {0}")]
pub struct AssembleError(pub String);

/// Candidate selection interface of the block assembler.
pub trait BlockAssembler: Send + Sync + 'static {
    /// Assemble a candidate block from the mempool under the given options.
    fn assemble(&self, options: AssembleOptions) -> Result<BlockTemplate, AssembleError>;

    /// Marginal fee rate for a package to be included in the last assembled
    /// block.
    fn min_tx_fee_rate(&self) -> FeeRate;
}
