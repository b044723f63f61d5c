//! Primitives shared by the transaction propagation components.
//!
//! The download scheduler and the rebroadcast selector only ever touch their
//! external collaborators (mempool, block assembler, chain state) through the
//! traits defined here, so embedders can plug in their own implementations
//! and tests can substitute deterministic mocks.

pub mod assemble;
pub mod tx_pool;

use bitcoin::{BlockHash, Txid, Weight, Wtxid};

pub use self::assemble::{AssembleError, AssembleOptions, BlockAssembler, BlockTemplate};
pub use self::tx_pool::{NoOpTxPool, PoolEntry, TxPool};

/// Both identifiers of a transaction, so that announcements can be served to
/// peers relaying by txid as well as peers relaying by wtxid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxIds {
    pub txid: Txid,
    pub wtxid: Wtxid,
}

/// Read-only view of the active chain.
///
/// The tip is exposed as an owned block hash rather than a reference into the
/// chain's index, so holding on to a stale value across a reorg is harmless.
pub trait ChainApi: Send + Sync + 'static {
    /// Hash of the current chain tip.
    fn active_tip(&self) -> BlockHash;

    /// Whether the node is still catching up to the network tip.
    fn is_initial_block_download(&self) -> bool;

    /// Total weight of the most recently connected block, if known.
    fn last_block_weight(&self) -> Option<Weight>;
}
