use crate::{TxRebroadcastHandler, MAX_ENTRY_AGE, MAX_REBROADCAST_COUNT, MIN_REATTEMPT_INTERVAL};
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, transaction, Amount, BlockHash, FeeRate, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Weight, Witness, Wtxid,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use txrelay_primitives::{
    AssembleError, AssembleOptions, BlockAssembler, BlockTemplate, ChainApi, PoolEntry, TxPool,
};

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 60 * 60)
}

fn block_hash(n: u8) -> BlockHash {
    BlockHash::from_byte_array([n; 32])
}

fn coinbase_tx() -> Transaction {
    Transaction {
        version: transaction::Version::ONE,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(5_000_000_000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// A distinct non-coinbase transaction per seed.
fn spend_tx(seed: u32) -> Transaction {
    let mut prevout = [0u8; 32];
    prevout[..4].copy_from_slice(&seed.to_le_bytes());

    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array(prevout),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(4_900_000_000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// Mempool mock with mutable membership and per-entry data.
#[derive(Default)]
struct MockPool {
    txs: RwLock<Vec<(Arc<Transaction>, PoolEntry)>>,
}

impl MockPool {
    fn insert(&self, tx: Transaction, fee: Amount, time: Duration) -> Arc<Transaction> {
        let weight = tx.weight();
        let tx = Arc::new(tx);
        self.txs.write().push((
            tx.clone(),
            PoolEntry {
                modified_fee: fee,
                weight,
                time,
            },
        ));
        tx
    }

    fn remove(&self, txid: &Txid) {
        self.txs
            .write()
            .retain(|(tx, _)| tx.compute_txid() != *txid);
    }
}

impl TxPool for MockPool {
    fn contains(&self, txid: &Txid) -> bool {
        self.txs
            .read()
            .iter()
            .any(|(tx, _)| tx.compute_txid() == *txid)
    }

    fn contains_wtxid(&self, wtxid: &Wtxid) -> bool {
        self.txs
            .read()
            .iter()
            .any(|(tx, _)| tx.compute_wtxid() == *wtxid)
    }

    fn entry(&self, txid: &Txid) -> Option<PoolEntry> {
        self.txs
            .read()
            .iter()
            .find(|(tx, _)| tx.compute_txid() == *txid)
            .map(|(_, entry)| *entry)
    }

    fn entries(&self) -> Vec<(Txid, PoolEntry)> {
        let mut entries = self
            .txs
            .read()
            .iter()
            .map(|(tx, entry)| (tx.compute_txid(), *entry))
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| b.1.fee_rate().cmp(&a.1.fee_rate()));
        entries
    }
}

/// Chain mock with a settable tip.
struct MockChain {
    tip: RwLock<BlockHash>,
    next_tip: RwLock<u8>,
    ibd: AtomicBool,
    last_block_weight: RwLock<Option<Weight>>,
}

impl MockChain {
    fn new() -> Self {
        Self {
            tip: RwLock::new(block_hash(0)),
            next_tip: RwLock::new(1),
            ibd: AtomicBool::new(false),
            last_block_weight: RwLock::new(None),
        }
    }

    /// Pretend a new block connected.
    fn bump_tip(&self) {
        let mut next = self.next_tip.write();
        *self.tip.write() = block_hash(*next);
        *next += 1;
    }

    fn set_ibd(&self, ibd: bool) {
        self.ibd.store(ibd, Ordering::Relaxed);
    }

    fn set_last_block_weight(&self, weight: Weight) {
        *self.last_block_weight.write() = Some(weight);
    }
}

impl ChainApi for MockChain {
    fn active_tip(&self) -> BlockHash {
        *self.tip.read()
    }

    fn is_initial_block_download(&self) -> bool {
        self.ibd.load(Ordering::Relaxed)
    }

    fn last_block_weight(&self) -> Option<Weight> {
        *self.last_block_weight.read()
    }
}

/// Assembler mock selecting from the mock pool by fee rate, age, and weight
/// budget, with a coinbase at the front like the real miner.
struct MockAssembler {
    pool: Arc<MockPool>,
    min_fee_rate: RwLock<FeeRate>,
    fail: AtomicBool,
    fixed_template: RwLock<Option<Vec<Arc<Transaction>>>>,
    last_options: RwLock<Option<AssembleOptions>>,
}

impl MockAssembler {
    fn new(pool: Arc<MockPool>) -> Self {
        Self {
            pool,
            min_fee_rate: RwLock::new(FeeRate::ZERO),
            fail: AtomicBool::new(false),
            fixed_template: RwLock::new(None),
            last_options: RwLock::new(None),
        }
    }

    fn set_min_fee_rate(&self, fee_rate: FeeRate) {
        *self.min_fee_rate.write() = fee_rate;
    }

    fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    fn set_fixed_template(&self, txs: Vec<Arc<Transaction>>) {
        *self.fixed_template.write() = Some(txs);
    }

    fn last_options(&self) -> AssembleOptions {
        self.last_options.read().expect("no assembly ran")
    }
}

impl BlockAssembler for MockAssembler {
    fn assemble(&self, options: AssembleOptions) -> Result<BlockTemplate, AssembleError> {
        *self.last_options.write() = Some(options);

        if self.fail.load(Ordering::Relaxed) {
            return Err(AssembleError("mempool unavailable".to_string()));
        }

        let mut txs = vec![Arc::new(coinbase_tx())];

        if let Some(fixed) = self.fixed_template.read().clone() {
            txs.extend(fixed);
            return Ok(BlockTemplate { txs });
        }

        let mut candidates = self
            .pool
            .txs
            .read()
            .iter()
            .filter(|(_, entry)| match options.skip_until {
                Some(skip_until) => entry.time <= skip_until,
                None => true,
            })
            .filter(|(_, entry)| entry.fee_rate() >= options.min_fee_rate)
            .cloned()
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.1.fee_rate().cmp(&a.1.fee_rate()));

        let mut total_weight = Weight::ZERO;
        for (tx, entry) in candidates {
            if total_weight + entry.weight > options.max_weight {
                break;
            }
            total_weight = total_weight + entry.weight;
            txs.push(tx);
        }

        Ok(BlockTemplate { txs })
    }

    fn min_tx_fee_rate(&self) -> FeeRate {
        *self.min_fee_rate.read()
    }
}

struct TestSetup {
    pool: Arc<MockPool>,
    chain: Arc<MockChain>,
    assembler: Arc<MockAssembler>,
    handler: TxRebroadcastHandler<MockPool, MockChain, MockAssembler>,
}

fn setup() -> TestSetup {
    let pool = Arc::new(MockPool::default());
    let chain = Arc::new(MockChain::new());
    let assembler = Arc::new(MockAssembler::new(pool.clone()));
    let handler = TxRebroadcastHandler::new(pool.clone(), chain.clone(), assembler.clone());

    TestSetup {
        pool,
        chain,
        assembler,
        handler,
    }
}

impl TestSetup {
    /// Run a cache update and connect a block afterwards so rebroadcast runs
    /// are not skipped for an unchanged tip.
    fn prime_fee_cache(&self, fee_rate: FeeRate, now: Duration) {
        self.assembler.set_min_fee_rate(fee_rate);
        self.handler.cache_min_rebroadcast_fee(now);
        self.chain.bump_tip();
    }
}

#[test]
fn recency_filter_selects_only_aged_transactions() {
    let s = setup();

    let entered = hours(10);
    let tx_old = s
        .pool
        .insert(spend_tx(1), Amount::from_sat(10_000), entered);

    // 35 minutes later a fresh transaction arrives.
    let now = entered + minutes(35);
    s.pool.insert(spend_tx(2), Amount::from_sat(10_000), now);

    s.prime_fee_cache(FeeRate::from_sat_per_kwu(100), now);
    let candidates = s.handler.get_rebroadcast_transactions(now);

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].txid, tx_old.compute_txid());
    assert_eq!(candidates[0].wtxid, tx_old.compute_wtxid());
}

#[test]
fn attempt_throttle_and_ceiling() {
    let s = setup();

    let entered = hours(1);
    let tx = s.pool.insert(spend_tx(1), Amount::from_sat(10_000), entered);
    let wtxid = tx.compute_wtxid();

    let first_run = entered + hours(1);
    s.prime_fee_cache(FeeRate::from_sat_per_kwu(100), first_run);
    assert_eq!(s.handler.get_rebroadcast_transactions(first_run).len(), 1);
    assert_eq!(s.handler.attempt_entry(&wtxid), Some((first_run, 1)));

    // A run within the reattempt interval yields nothing and leaves the
    // tracker untouched.
    let early = first_run + hours(1);
    assert!(s.handler.get_rebroadcast_transactions(early).is_empty());
    assert_eq!(s.handler.attempt_entry(&wtxid), Some((first_run, 1)));

    // After the interval the transaction is admitted again.
    let second_run = first_run + MIN_REATTEMPT_INTERVAL;
    assert_eq!(s.handler.get_rebroadcast_transactions(second_run).len(), 1);
    assert_eq!(s.handler.attempt_entry(&wtxid), Some((second_run, 2)));

    // At the attempt ceiling the transaction is never admitted again.
    s.handler.force_attempt_count(&wtxid, MAX_REBROADCAST_COUNT);
    let after_ceiling = second_run + MIN_REATTEMPT_INTERVAL;
    assert!(s.handler.get_rebroadcast_transactions(after_ceiling).is_empty());
    assert_eq!(
        s.handler.attempt_entry(&wtxid),
        Some((second_run, MAX_REBROADCAST_COUNT))
    );
}

#[test]
fn skips_run_until_a_block_connects_after_cache() {
    let s = setup();

    let entered = hours(1);
    s.pool.insert(spend_tx(1), Amount::from_sat(10_000), entered);

    let now = entered + hours(1);
    s.assembler.set_min_fee_rate(FeeRate::from_sat_per_kwu(100));
    s.handler.cache_min_rebroadcast_fee(now);

    // No block has connected since the cache ran.
    assert!(s.handler.get_rebroadcast_transactions(now).is_empty());

    s.chain.bump_tip();
    assert_eq!(s.handler.get_rebroadcast_transactions(now).len(), 1);
}

#[test]
fn skips_run_during_initial_block_download() {
    let s = setup();

    let entered = hours(1);
    s.pool.insert(spend_tx(1), Amount::from_sat(10_000), entered);

    let now = entered + hours(1);
    s.prime_fee_cache(FeeRate::from_sat_per_kwu(100), now);

    s.chain.set_ibd(true);
    assert!(s.handler.get_rebroadcast_transactions(now).is_empty());

    s.chain.set_ibd(false);
    assert_eq!(s.handler.get_rebroadcast_transactions(now).len(), 1);
}

#[test]
fn skips_run_with_empty_fee_cache() {
    let s = setup();

    let entered = hours(1);
    s.pool.insert(spend_tx(1), Amount::from_sat(10_000), entered);

    // The tip has moved but the cache never ran.
    s.chain.bump_tip();
    let now = entered + hours(1);
    assert!(s.handler.get_rebroadcast_transactions(now).is_empty());
}

#[test]
fn cache_is_skipped_during_initial_block_download() {
    let s = setup();

    s.chain.set_ibd(true);
    s.assembler.set_min_fee_rate(FeeRate::from_sat_per_kwu(100));
    s.handler.cache_min_rebroadcast_fee(hours(1));

    assert_eq!(s.handler.cached_fee_rate(), FeeRate::ZERO);
}

#[test]
fn assembler_failure_yields_empty_result() {
    let s = setup();

    let entered = hours(1);
    s.pool.insert(spend_tx(1), Amount::from_sat(10_000), entered);

    let now = entered + hours(1);
    s.prime_fee_cache(FeeRate::from_sat_per_kwu(100), now);
    s.assembler.set_failing(true);

    assert!(s.handler.get_rebroadcast_transactions(now).is_empty());
    assert_eq!(s.handler.tracker_len(), 0);
}

#[test]
fn coinbase_only_template_yields_no_candidates() {
    let s = setup();

    // Nothing in the pool, so the template holds only the coinbase.
    let now = hours(2);
    s.prime_fee_cache(FeeRate::from_sat_per_kwu(100), now);

    assert!(s.handler.get_rebroadcast_transactions(now).is_empty());
    assert_eq!(s.handler.tracker_len(), 0);
}

#[test]
fn tracker_is_trimmed_even_without_candidates() {
    let s = setup();

    let entered = hours(1);
    let tx = s.pool.insert(spend_tx(1), Amount::from_sat(10_000), entered);

    let first_run = entered + hours(1);
    s.prime_fee_cache(FeeRate::from_sat_per_kwu(100), first_run);
    assert_eq!(s.handler.get_rebroadcast_transactions(first_run).len(), 1);
    assert_eq!(s.handler.tracker_len(), 1);

    // The mempool drains, so later runs assemble a coinbase-only template.
    // The age sweep still runs and drops the stale entry.
    s.pool.remove(&tx.compute_txid());
    let much_later = first_run + MAX_ENTRY_AGE + hours(1);
    assert!(s.handler.get_rebroadcast_transactions(much_later).is_empty());
    assert_eq!(s.handler.tracker_len(), 0);
}

#[test]
fn candidates_no_longer_pooled_are_skipped() {
    let s = setup();

    let entered = hours(1);
    let pooled = s.pool.insert(spend_tx(1), Amount::from_sat(10_000), entered);
    let evicted = s.pool.insert(spend_tx(2), Amount::from_sat(10_000), entered);

    // Freeze the assembled template, then evict one candidate from the pool
    // before the handler collects the result.
    s.assembler
        .set_fixed_template(vec![pooled.clone(), evicted.clone()]);
    s.pool.remove(&evicted.compute_txid());

    let now = entered + hours(1);
    s.prime_fee_cache(FeeRate::from_sat_per_kwu(100), now);
    let candidates = s.handler.get_rebroadcast_transactions(now);

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].txid, pooled.compute_txid());
}

#[test]
fn assembly_options_reflect_cache_and_last_block() {
    let s = setup();

    let entered = hours(1);
    s.pool.insert(spend_tx(1), Amount::from_sat(10_000), entered);

    let fee_rate = FeeRate::from_sat_per_kwu(250);
    let now = entered + hours(1);
    s.prime_fee_cache(fee_rate, now);
    s.chain.set_last_block_weight(Weight::from_wu(2_000_000));

    s.handler.get_rebroadcast_transactions(now);

    let options = s.assembler.last_options();
    assert_eq!(options.max_weight, Weight::from_wu(1_500_000));
    assert_eq!(options.min_fee_rate, fee_rate);
    assert_eq!(options.skip_until, Some(now - minutes(30)));
    assert!(!options.validate_block);
}

#[test]
fn removing_attempt_history_allows_fresh_start() {
    let s = setup();

    let entered = hours(1);
    let tx = s.pool.insert(spend_tx(1), Amount::from_sat(10_000), entered);
    let wtxid = tx.compute_wtxid();

    let first_run = entered + hours(1);
    s.prime_fee_cache(FeeRate::from_sat_per_kwu(100), first_run);
    assert_eq!(s.handler.get_rebroadcast_transactions(first_run).len(), 1);

    // The transaction leaves the mempool and comes back; its history is gone.
    s.handler.remove_from_attempt_tracker(&wtxid);

    let second_run = first_run + hours(1);
    assert_eq!(s.handler.get_rebroadcast_transactions(second_run).len(), 1);
    assert_eq!(s.handler.attempt_entry(&wtxid), Some((second_run, 1)));
}

#[test]
fn fee_cache_bookkeeping() {
    let s = setup();

    let first = FeeRate::from_sat_per_kwu(100);
    let second = FeeRate::from_sat_per_kwu(400);

    let now = hours(1);
    assert!(s.handler.fee_cache_due(now));

    s.assembler.set_min_fee_rate(first);
    s.handler.cache_min_rebroadcast_fee(now);
    assert_eq!(s.handler.cached_fee_rate(), first);
    assert_eq!(s.handler.previous_cached_fee_rate(), FeeRate::ZERO);

    assert!(!s.handler.fee_cache_due(now + minutes(19)));
    assert!(s.handler.fee_cache_due(now + minutes(20)));

    s.assembler.set_min_fee_rate(second);
    s.handler.cache_min_rebroadcast_fee(now + minutes(20));
    assert_eq!(s.handler.cached_fee_rate(), second);
    assert_eq!(s.handler.previous_cached_fee_rate(), first);
}
