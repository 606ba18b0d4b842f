//! The block acceptance state machine.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use ldoged_consensus::constants::{
    LOCKTIME_MEDIAN_TIME_PAST, LOCKTIME_THRESHOLD, LOCKTIME_VERIFY_SEQUENCE, MAX_BLOCK_SIGOPS_COST,
    MAX_BLOCK_WEIGHT, MAX_FUTURE_BLOCK_TIME, MEDIAN_TIMESPAN, SEQUENCE_DISABLE_FLAG,
    SEQUENCE_GRANULARITY, SEQUENCE_MASK, SEQUENCE_TYPE_FLAG, VERSION_TOP_BITS,
};
use ldoged_consensus::money::{Amount, MAX_MONEY};
use ldoged_consensus::rewards::{proof_of_stake_reward, proof_of_work_reward};
use ldoged_consensus::{hash_to_display, ChainParams, Deployment, Hash256, ThresholdState, ZERO_HASH};
use ldoged_pow::difficulty::next_target;
use ldoged_pow::validation::{verify_pos, verify_pow};
use ldoged_primitives::{Block, Transaction};
use ldoged_script::ScriptVerifier;
use ldoged_storage::KeyValueStore;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use primitive_types::U256;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info, warn};

use crate::chaindb::{ChainDb, ResetTarget};
use crate::clock::Clock;
use crate::coins::CoinView;
use crate::deployment::DeploymentState;
use crate::entry::ChainEntry;
use crate::error::{ChainError, VerifyError};
use crate::events::{ChainEvent, EventBus};
use crate::kernel::Kernel;
use crate::metrics::{ConnectMetrics, ConnectMetricsSnapshot};
use crate::options::ChainOptions;
use crate::orphans::{Orphan, OrphanPool};
use crate::validation::{
    block_weight, check_body, check_inputs, coinstake_reward, sigops_cost, ValidationFlags,
};

struct ScriptCheck<'a> {
    tx: &'a Transaction,
    input_index: usize,
    script_pubkey: &'a [u8],
    value: Amount,
}

#[derive(Default)]
struct ChainState {
    tip: Option<ChainEntry>,
    synced: bool,
    deployment: DeploymentState,
}

/// Releases a block hash from the in-flight set when processing ends.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<Hash256>>,
    hash: Hash256,
}

impl<'a> PendingGuard<'a> {
    fn acquire(pending: &'a Mutex<HashSet<Hash256>>, hash: Hash256) -> Option<Self> {
        if !pending.lock().insert(hash) {
            return None;
        }
        Some(Self { pending, hash })
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.hash);
    }
}

pub struct Chain<S> {
    db: ChainDb<S>,
    params: Arc<ChainParams>,
    options: ChainOptions,
    verifier: Arc<dyn ScriptVerifier>,
    clock: Arc<dyn Clock>,
    pool: Option<ThreadPool>,
    /// Serializes every structural mutation.
    locker: Mutex<()>,
    /// Hashes inside `add`. At most one attempt per hash is in flight.
    pending: Mutex<HashSet<Hash256>>,
    state: RwLock<ChainState>,
    orphans: Mutex<OrphanPool>,
    invalid: Mutex<LruCache<Hash256, ()>>,
    events: EventBus,
    metrics: ConnectMetrics,
}

impl<S: KeyValueStore> Chain<S> {
    pub fn new(
        store: S,
        params: Arc<ChainParams>,
        options: ChainOptions,
        verifier: Arc<dyn ScriptVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ChainError> {
        let pool = if options.script_threads > 0 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(options.script_threads)
                .thread_name(|index| format!("script-{index}"))
                .build()
                .map_err(|err| ChainError::ThreadPool(err.to_string()))?;
            Some(pool)
        } else {
            None
        };
        let invalid = NonZeroUsize::new(options.invalid_cache).unwrap_or(NonZeroUsize::MIN);
        let orphans = OrphanPool::new(options.max_orphans, options.orphan_ttl_secs as i64);
        Ok(Self {
            db: ChainDb::new(store, Arc::clone(&params), &options),
            params,
            options,
            verifier,
            clock,
            pool,
            locker: Mutex::new(()),
            pending: Mutex::new(HashSet::new()),
            state: RwLock::new(ChainState::default()),
            orphans: Mutex::new(orphans),
            invalid: Mutex::new(LruCache::new(invalid)),
            events: EventBus::new(),
            metrics: ConnectMetrics::default(),
        })
    }

    pub fn open(&self) -> Result<ChainEntry, ChainError> {
        if self.state.read().tip.is_some() {
            return Err(ChainError::AlreadyOpen);
        }
        info!(network = self.params.network.as_str(), "chain is loading");
        if self.options.checkpoints {
            info!("checkpoints are enabled");
        }

        let tip = self.db.open()?;
        self.set_tip(tip.clone());
        info!(height = tip.height, "chain height");

        let state = self.get_deployment_state()?;
        self.set_deployment_state(state);

        self.events.emit(ChainEvent::Tip(tip.clone()));
        self.maybe_sync();
        Ok(tip)
    }

    pub fn close(&self) -> Result<(), ChainError> {
        let mut state = self.state.write();
        if state.tip.take().is_none() {
            return Err(ChainError::NotOpen);
        }
        state.synced = false;
        drop(state);
        self.db.close();
        Ok(())
    }

    pub fn db(&self) -> &ChainDb<S> {
        &self.db
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn options(&self) -> &ChainOptions {
        &self.options
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> ConnectMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn kernel(&self) -> Kernel<'_, S> {
        Kernel::new(&self.db, self.verifier.as_ref())
    }

    pub fn tip(&self) -> Result<ChainEntry, ChainError> {
        self.state.read().tip.clone().ok_or(ChainError::NotOpen)
    }

    /// Height of the current tip, zero while closed.
    pub fn height(&self) -> u32 {
        self.state
            .read()
            .tip
            .as_ref()
            .map(|tip| tip.height)
            .unwrap_or(0)
    }

    pub fn deployment_state(&self) -> DeploymentState {
        self.state.read().deployment
    }

    pub fn is_full(&self) -> bool {
        self.state.read().synced
    }

    fn set_tip(&self, entry: ChainEntry) {
        self.state.write().tip = Some(entry);
    }

    /// Contextual verification of `block` on top of the current tip,
    /// without proof-of-work or proof-of-stake checks.
    pub fn verify_block(&self, block: &Block) -> Result<(CoinView, DeploymentState), ChainError> {
        let _lock = self.locker.lock();
        let tip = self.tip()?;
        let flags = ValidationFlags {
            check_pow: false,
            check_pos: false,
            check_body: true,
        };
        self.verify_context(block, &tip, flags)
    }

    fn verify_context(
        &self,
        block: &Block,
        prev: &ChainEntry,
        flags: ValidationFlags,
    ) -> Result<(CoinView, DeploymentState), ChainError> {
        let state = self.verify(block, prev, flags)?;

        if self.options.spv {
            return Ok((CoinView::new(), state));
        }

        if self.is_historical(prev) {
            let view = self.update_inputs(block, prev)?;
            return Ok((view, state));
        }

        self.verify_duplicates(block, prev)?;
        let view = self.verify_inputs(block, prev, &state)?;
        Ok((view, state))
    }

    pub fn is_main_hash(&self, hash: &Hash256) -> Result<bool, ChainError> {
        self.db.is_main_hash(hash)
    }

    pub fn is_main_chain(&self, entry: &ChainEntry) -> Result<bool, ChainError> {
        self.db.is_main_chain(entry)
    }

    pub fn get_ancestor(
        &self,
        entry: &ChainEntry,
        height: u32,
    ) -> Result<Option<ChainEntry>, ChainError> {
        self.db.get_ancestor(entry, height)
    }

    pub fn get_previous(&self, entry: &ChainEntry) -> Result<Option<ChainEntry>, ChainError> {
        self.db.get_previous(entry)
    }

    pub fn get_next(&self, entry: &ChainEntry) -> Result<Option<ChainEntry>, ChainError> {
        self.db.get_next(entry)
    }

    /// `entry` itself or its nearest ancestor of the requested proof type.
    /// Stops at the block right after genesis.
    pub fn get_last_entry(
        &self,
        entry: &ChainEntry,
        proof_of_stake: bool,
    ) -> Result<ChainEntry, ChainError> {
        let mut entry = entry.clone();
        while entry.prev_block != ZERO_HASH && entry.is_proof_of_stake() != proof_of_stake {
            entry = self
                .db
                .get_previous(&entry)?
                .ok_or(ChainError::Corrupt("missing previous entry"))?;
        }
        Ok(entry)
    }

    /// Median of the last eleven timestamps ending at `prev`. An explicit
    /// `time` takes the place of the oldest one.
    pub fn get_median_time(&self, prev: &ChainEntry, time: Option<i64>) -> Result<i64, ChainError> {
        let mut timespan = MEDIAN_TIMESPAN;
        let mut median = Vec::with_capacity(MEDIAN_TIMESPAN);
        if let Some(time) = time {
            median.push(time);
            timespan -= 1;
        }

        let mut entry = Some(prev.clone());
        for _ in 0..timespan {
            let Some(current) = entry else {
                break;
            };
            median.push(i64::from(current.time));
            entry = self.db.get_previous(&current)?;
        }

        median.sort_unstable();
        Ok(median[median.len() / 2])
    }

    /// Whether the block after `prev` lies at or below the last checkpoint.
    pub fn is_historical(&self, prev: &ChainEntry) -> bool {
        self.options.checkpoints && prev.height + 1 <= self.params.last_checkpoint
    }

    fn verify(
        &self,
        block: &Block,
        prev: &ChainEntry,
        flags: ValidationFlags,
    ) -> Result<DeploymentState, ChainError> {
        let mut flags = flags;
        let header = &block.header;

        if header.prev_block != prev.hash {
            return Err(VerifyError::invalid("bad-prevblk", 0).into());
        }

        if !self.verify_checkpoint(prev, &block.hash()) {
            return Err(VerifyError::checkpoint("checkpoint mismatch", 100).into());
        }

        if self.is_historical(prev) {
            if self.options.spv {
                return Ok(self.deployment_state());
            }
            if flags.check_body {
                let (root, mutated) = block.merkle_root();
                if mutated || root != header.merkle_root {
                    return Err(VerifyError::invalid_malleated("bad-txnmrklroot", 100).into());
                }
                flags.check_body = false;
            }
        }

        if flags.check_body {
            check_body(block).map_err(|err| VerifyError {
                malleated: true,
                ..err
            })?;
        }

        let bits = self.get_target(Some(prev), block.is_proof_of_stake())?;
        if header.bits != bits {
            return Err(VerifyError::invalid("bad-diffbits", 100).into());
        }

        if self.options.spv {
            return Ok(self.deployment_state());
        }

        let mtp = self.get_median_time(prev, None)?;
        let time = i64::from(header.time);
        if time <= mtp {
            return Err(VerifyError::invalid("time-too-old", 0).into());
        }
        if time > self.clock.now() + MAX_FUTURE_BLOCK_TIME {
            return Err(VerifyError::invalid_malleated("time-too-new", 0).into());
        }

        let height = prev.height + 1;
        let state = self.get_deployments(header.time, prev);

        let lock_time = if state.has_mtp() { mtp } else { time };
        if block
            .transactions
            .iter()
            .any(|tx| !tx.is_final(height, Some(lock_time)))
        {
            return Err(VerifyError::invalid("bad-txns-nonfinal", 10).into());
        }

        if block_weight(block) > MAX_BLOCK_WEIGHT {
            return Err(VerifyError::invalid("bad-blk-weight", 100).into());
        }

        Ok(state)
    }

    /// Rules for the block after `prev` stamped `time`.
    pub fn get_deployments(&self, time: u32, _prev: &ChainEntry) -> DeploymentState {
        DeploymentState::at_time(time)
    }

    fn set_deployment_state(&self, state: DeploymentState) {
        let quiet = self.options.checkpoints && self.height() < self.params.last_checkpoint;
        let mut guard = self.state.write();
        if !quiet {
            if !guard.deployment.has_p2sh() && state.has_p2sh() {
                warn!("P2SH has been activated");
            }
            if !guard.deployment.has_csv() && state.has_csv() {
                warn!("CSV has been activated");
            }
        }
        guard.deployment = state;
    }

    fn verify_duplicates(&self, block: &Block, prev: &ChainEntry) -> Result<(), ChainError> {
        let height = prev.height + 1;
        let hash = block.hash();
        for tx in &block.transactions {
            if !self.db.has_coins(&tx.txid())? {
                continue;
            }
            if self.params.bip30_exception(height) != Some(&hash) {
                return Err(VerifyError::invalid("bad-txns-BIP30", 100).into());
            }
        }
        Ok(())
    }

    /// Applies a checkpointed block's coin changes without any checks.
    fn update_inputs(&self, block: &Block, prev: &ChainEntry) -> Result<CoinView, ChainError> {
        let mut view = CoinView::new();
        let height = prev.height + 1;
        for (index, tx) in block.transactions.iter().enumerate() {
            if index > 0 && !view.spend_inputs(tx, |prevout| self.db.get_coin(prevout))? {
                return Err(ChainError::Corrupt("spent inputs in historical data"));
            }
            view.add_tx(tx, height);
        }
        Ok(view)
    }

    fn verify_inputs(
        &self,
        block: &Block,
        prev: &ChainEntry,
        state: &DeploymentState,
    ) -> Result<CoinView, ChainError> {
        let mut view = CoinView::new();
        let height = prev.height + 1;
        let mut sigops = 0usize;
        let mut fees: Amount = 0;

        for (index, tx) in block.transactions.iter().enumerate() {
            if index > 0 {
                if !view.spend_inputs(tx, |prevout| self.db.get_coin(prevout))? {
                    return Err(VerifyError::invalid("bad-txns-inputs-missingorspent", 100).into());
                }
                if tx.version >= 2 && !self.verify_locks(prev, tx, &view, state.lock_flags)? {
                    return Err(VerifyError::invalid("bad-txns-nonfinal", 100).into());
                }
            }

            sigops += sigops_cost(tx, &view, state.flags);
            if sigops > MAX_BLOCK_SIGOPS_COST {
                return Err(VerifyError::invalid("bad-blk-sigops", 100).into());
            }

            if index > 0 {
                let fee = check_inputs(tx, &view, height)?;
                fees = match fees.checked_add(fee) {
                    Some(fees) if fees <= MAX_MONEY => fees,
                    _ => {
                        return Err(VerifyError::invalid(
                            "bad-txns-accumulated-fee-outofrange",
                            100,
                        )
                        .into())
                    }
                };
            }

            view.add_tx(tx, height);
        }

        let claimed = block
            .transactions
            .first()
            .and_then(Transaction::value_out)
            .ok_or_else(|| VerifyError::invalid("bad-cb-amount", 100))?;
        if claimed > fees + proof_of_work_reward(height) {
            return Err(VerifyError::invalid("bad-cb-amount", 100).into());
        }

        if block.is_proof_of_stake() {
            let minted = block
                .transactions
                .get(1)
                .and_then(|coinstake| coinstake_reward(coinstake, &view))
                .ok_or_else(|| VerifyError::invalid("bad-cs-amount", 100))?;
            if minted > fees + proof_of_stake_reward(height) {
                return Err(VerifyError::invalid("bad-cs-amount", 100).into());
            }
        }

        self.verify_scripts(block, &view, state.flags)?;
        Ok(view)
    }

    /// Runs every non-coinbase input script on the worker pool.
    fn verify_scripts(&self, block: &Block, view: &CoinView, flags: u32) -> Result<(), ChainError> {
        let mut checks = Vec::new();
        for tx in block.transactions.iter().skip(1) {
            for (input_index, input) in tx.vin.iter().enumerate() {
                let coin = view
                    .get(&input.prevout)
                    .ok_or(ChainError::Corrupt("spent coin missing from view"))?;
                checks.push(ScriptCheck {
                    tx,
                    input_index,
                    script_pubkey: &coin.script_pubkey,
                    value: coin.value,
                });
            }
        }
        if checks.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let verifier = self.verifier.as_ref();
        let run = || {
            checks.par_iter().try_for_each(|check| {
                verifier
                    .verify_input(
                        check.tx,
                        check.input_index,
                        check.script_pubkey,
                        check.value,
                        flags,
                    )
                    .map_err(|err| (check.tx.txid(), check.input_index, err))
            })
        };
        let result = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };
        self.metrics.record_scripts(start.elapsed());

        if let Err((txid, input_index, err)) = result {
            warn!(
                tx = %hash_to_display(&txid),
                input = input_index,
                error = %err,
                "script validation failed"
            );
            return Err(VerifyError::invalid("mandatory-script-verify-flag-failed", 100).into());
        }
        Ok(())
    }

    /// Last common entry of `fork` and `longer`.
    fn find_fork(&self, fork: &ChainEntry, longer: &ChainEntry) -> Result<ChainEntry, ChainError> {
        let mut fork = fork.clone();
        let mut longer = longer.clone();
        while fork.hash != longer.hash {
            while longer.height > fork.height {
                longer = self
                    .db
                    .get_previous(&longer)?
                    .ok_or(ChainError::Corrupt("no previous entry for new tip"))?;
            }
            if fork.hash == longer.hash {
                return Ok(fork);
            }
            fork = self
                .db
                .get_previous(&fork)?
                .ok_or(ChainError::Corrupt("no previous entry for old tip"))?;
        }
        Ok(fork)
    }

    /// Entries from `from` back to, but excluding, `fork`.
    fn entries_until(&self, from: &ChainEntry, fork: &ChainEntry) -> Result<Vec<ChainEntry>, ChainError> {
        let mut entries = Vec::new();
        let mut entry = from.clone();
        while entry.hash != fork.hash {
            let prev = self
                .db
                .get_previous(&entry)?
                .ok_or(ChainError::Corrupt("missing previous entry during reorganization"))?;
            entries.push(entry);
            entry = prev;
        }
        Ok(entries)
    }

    fn reorganize(&self, competitor: &ChainEntry) -> Result<(), ChainError> {
        let tip = self.tip()?;
        let fork = self.find_fork(&tip, competitor)?;

        let disconnect = self.entries_until(&tip, &fork)?;
        let connect = self.entries_until(competitor, &fork)?;

        for entry in &disconnect {
            self.disconnect(entry)?;
        }
        // The competitor itself is connected by the caller.
        for entry in connect.iter().skip(1).rev() {
            self.reconnect(entry)?;
        }

        warn!(
            old = %tip.display_hash(),
            old_height = tip.height,
            new = %competitor.display_hash(),
            new_height = competitor.height,
            "chain reorganization"
        );
        self.events.emit(ChainEvent::Reorganize {
            old_tip: tip,
            new_tip: competitor.clone(),
        });
        Ok(())
    }

    /// Headers only: rewind to the fork and let the new branch be fetched
    /// again.
    fn reorganize_spv(&self, competitor: &ChainEntry) -> Result<(), ChainError> {
        let tip = self.tip()?;
        let fork = self.find_fork(&tip, competitor)?;
        let disconnect = self.entries_until(&tip, &fork)?;

        self.reset_inner(ResetTarget::Hash(fork.hash), true)?;

        for entry in disconnect {
            let block = Arc::new(header_block(&entry));
            self.events.emit(ChainEvent::Disconnect { entry, block });
        }

        warn!(
            old = %tip.display_hash(),
            old_height = tip.height,
            new = %competitor.display_hash(),
            new_height = competitor.height,
            "SPV reorganization"
        );
        warn!(height = fork.height, "chain replay from fork necessary");
        self.events.emit(ChainEvent::Reorganize {
            old_tip: tip,
            new_tip: competitor.clone(),
        });
        Ok(())
    }

    fn load_block(&self, entry: &ChainEntry) -> Result<Block, ChainError> {
        match self.db.get_block(&entry.hash)? {
            Some(block) => Ok(block),
            None if self.options.spv => Ok(header_block(entry)),
            None => Err(ChainError::Corrupt("block not found")),
        }
    }

    fn disconnect(&self, entry: &ChainEntry) -> Result<(), ChainError> {
        let block = self.load_block(entry)?;
        let prev = self
            .db
            .get_previous(entry)?
            .ok_or(ChainError::Corrupt("missing previous entry during disconnect"))?;
        self.db.disconnect(entry, &block)?;

        self.set_tip(prev.clone());
        self.events.emit(ChainEvent::Tip(prev));
        self.events.emit(ChainEvent::Disconnect {
            entry: entry.clone(),
            block: Arc::new(block),
        });
        Ok(())
    }

    /// Connects an entry of the winning branch that was stored as an
    /// alternate. Inputs are verified now since they were skipped then.
    fn reconnect(&self, entry: &ChainEntry) -> Result<(), ChainError> {
        let block = self.load_block(entry)?;
        let prev = self
            .db
            .get_previous(entry)?
            .ok_or(ChainError::Corrupt("missing previous entry during reconnect"))?;

        let (view, state) = self
            .verify_context(&block, &prev, ValidationFlags::none())
            .map_err(|err| self.reject(err, entry, "tried to reconnect invalid block"))?;

        self.db.reconnect(entry, &block, &view)?;
        self.set_tip(entry.clone());
        self.set_deployment_state(state);

        let block = Arc::new(block);
        self.events.emit(ChainEvent::Tip(entry.clone()));
        self.events.emit(ChainEvent::Reconnect {
            entry: entry.clone(),
            block: Arc::clone(&block),
        });
        self.events.emit(ChainEvent::Connect {
            entry: entry.clone(),
            block,
        });
        Ok(())
    }

    fn set_best_chain(
        &self,
        entry: &ChainEntry,
        block: &Arc<Block>,
        prev: &ChainEntry,
        flags: ValidationFlags,
    ) -> Result<(), ChainError> {
        if entry.prev_block != self.tip()?.hash {
            warn!(height = entry.height, "reorganizing chain");
            if self.options.spv {
                return self.reorganize_spv(entry);
            }
            self.reorganize(entry)?;
        }

        self.warn_unknown_bits(entry);

        let start = Instant::now();
        let (view, state) = self
            .verify_context(block, prev, flags)
            .map_err(|err| self.reject(err, entry, "tried to connect invalid block"))?;
        self.metrics.record_verify(start.elapsed());

        let start = Instant::now();
        self.db.save(entry, block, Some(&view))?;
        self.metrics.record_store(start.elapsed());

        self.set_tip(entry.clone());
        self.set_deployment_state(state);

        self.events.emit(ChainEvent::Tip(entry.clone()));
        self.events.emit(ChainEvent::Connect {
            entry: entry.clone(),
            block: Arc::clone(block),
        });
        Ok(())
    }

    fn save_alternate(
        &self,
        entry: &ChainEntry,
        block: &Arc<Block>,
        prev: &ChainEntry,
        flags: ValidationFlags,
    ) -> Result<(), ChainError> {
        if self.options.checkpoints && prev.height + 1 < self.params.last_checkpoint {
            return Err(VerifyError::checkpoint("bad-fork-prior-to-checkpoint", 100)
                .with_hash(entry.hash)
                .into());
        }

        self.verify(block, prev, flags)
            .map_err(|err| self.reject(err, entry, "invalid block on alternate chain"))?;

        self.warn_unknown_bits(entry);

        self.db.save(entry, block, None)?;

        let tip = self.tip()?;
        warn!(
            height = entry.height,
            tip_height = tip.height,
            tip = %tip.display_hash(),
            competitor = %entry.display_hash(),
            tip_chain_trust = %tip.chain_trust,
            competitor_chain_trust = %entry.chain_trust,
            chain_trust_diff = %tip.chain_trust.saturating_sub(entry.chain_trust),
            "heads up: competing chain"
        );

        self.events.emit(ChainEvent::Competitor {
            entry: entry.clone(),
            block: Arc::clone(block),
        });
        Ok(())
    }

    /// Marks the entry invalid unless the failure could be transient, and
    /// tags the error with its hash.
    fn reject(&self, err: ChainError, entry: &ChainEntry, message: &'static str) -> ChainError {
        match err {
            ChainError::Verify(err) => {
                if !err.malleated {
                    self.set_invalid(entry.hash);
                }
                warn!(
                    hash = %entry.display_hash(),
                    height = entry.height,
                    reason = %err.reason,
                    "{message}"
                );
                ChainError::Verify(err.with_hash(entry.hash))
            }
            other => other,
        }
    }

    fn warn_unknown_bits(&self, entry: &ChainEntry) {
        if entry.has_unknown(self.params.unknown_bits()) {
            warn!(
                height = entry.height,
                version = %format!("{:08x}", entry.version),
                "unknown version bits in block"
            );
        }
    }

    /// Rewinds the main chain, dropping alternate branches and orphans.
    pub fn reset(&self, target: impl Into<ResetTarget>) -> Result<ChainEntry, ChainError> {
        let _lock = self.locker.lock();
        self.reset_inner(target.into(), false)
    }

    fn reset_inner(&self, target: ResetTarget, silent: bool) -> Result<ChainEntry, ChainError> {
        let tip = self.db.reset(target)?;
        {
            let mut state = self.state.write();
            state.tip = Some(tip.clone());
            state.synced = false;
        }

        let state = self.get_deployment_state()?;
        self.set_deployment_state(state);

        self.events.emit(ChainEvent::Tip(tip.clone()));
        if !silent {
            self.events.emit(ChainEvent::Reset(tip.clone()));
        }

        self.purge_orphans();
        self.maybe_sync();
        Ok(tip)
    }

    /// Resets to the parent of `target` so it gets connected again.
    pub fn replay(&self, target: impl Into<ResetTarget>) -> Result<ChainEntry, ChainError> {
        let _lock = self.locker.lock();
        self.replay_inner(target.into(), true)
    }

    fn replay_inner(&self, target: ResetTarget, silent: bool) -> Result<ChainEntry, ChainError> {
        let entry = match target {
            ResetTarget::Hash(hash) => self.db.get_entry(&hash)?,
            ResetTarget::Height(height) => self.db.get_entry_by_height(height)?,
        }
        .ok_or(ChainError::NotFound)?;

        if !self.db.is_main_chain(&entry)? {
            return Err(ChainError::AlternateChain);
        }

        let target = if entry.is_genesis() {
            entry.hash
        } else {
            entry.prev_block
        };
        self.reset_inner(ResetTarget::Hash(target), silent)
    }

    /// Rewinds below `hash` and refuses it from now on.
    pub fn invalidate(&self, hash: Hash256) -> Result<ChainEntry, ChainError> {
        let _lock = self.locker.lock();
        let tip = self.replay_inner(ResetTarget::Hash(hash), false)?;
        self.set_invalid(hash);
        Ok(tip)
    }

    pub fn prune(&self) -> Result<bool, ChainError> {
        let _lock = self.locker.lock();
        self.db.prune()
    }

    pub fn scan(
        &self,
        start: &ChainEntry,
        filter: &mut dyn FnMut(&Transaction) -> bool,
        iter: &mut dyn FnMut(&ChainEntry, Vec<Transaction>) -> Result<(), ChainError>,
    ) -> Result<(), ChainError> {
        let _lock = self.locker.lock();
        self.db.scan(start, filter, iter)
    }

    /// Verifies and stores `block`. Returns `Ok(None)` when the block was
    /// buffered as an orphan.
    pub fn add(
        &self,
        block: Block,
        flags: ValidationFlags,
        peer: Option<u64>,
    ) -> Result<Option<ChainEntry>, ChainError> {
        let hash = block.hash();
        let Some(_pending) = PendingGuard::acquire(&self.pending, hash) else {
            debug!(hash = %hash_to_display(&hash), "already have pending block");
            return Err(VerifyError::duplicate().with_hash(hash).into());
        };
        self.check_header(&block, hash, flags)?;

        // Only connecting takes the chain lock. Adds of distinct hashes run
        // their header checks in parallel.
        let _lock = self.locker.lock();
        self.add_inner(Arc::new(block), hash, flags, peer)
    }

    /// Checks that need neither the chain lock nor the parent entry.
    fn check_header(
        &self,
        block: &Block,
        hash: Hash256,
        flags: ValidationFlags,
    ) -> Result<(), ChainError> {
        let duplicate = || ChainError::from(VerifyError::duplicate().with_hash(hash));

        if hash == self.params.genesis.hash {
            debug!(hash = %hash_to_display(&hash), "saw genesis block");
            return Err(duplicate());
        }

        if self.orphans.lock().has(&hash) {
            debug!(hash = %hash_to_display(&hash), "already have orphan block");
            return Err(duplicate());
        }

        if flags.check_pow
            && block.is_proof_of_work()
            && !verify_pow(&block.header.pow_hash(), block.header.bits)
        {
            return Err(VerifyError::invalid("high-hash", 50).with_hash(hash).into());
        }

        if flags.check_pos && block.is_proof_of_stake() && !verify_pos(block) {
            return Err(VerifyError::invalid("bad-pos", 50).with_hash(hash).into());
        }

        Ok(())
    }

    fn add_inner(
        &self,
        block: Arc<Block>,
        hash: Hash256,
        flags: ValidationFlags,
        peer: Option<u64>,
    ) -> Result<Option<ChainEntry>, ChainError> {
        if self.db.has_entry(&hash)? {
            debug!(hash = %hash_to_display(&hash), "already have block");
            return Err(VerifyError::duplicate().with_hash(hash).into());
        }

        let Some(prev) = self.db.get_entry(&block.header.prev_block)? else {
            self.store_orphan(block, flags, peer);
            return Ok(None);
        };

        let entry = self.connect(prev, block, flags)?;

        if self.orphans.lock().has_next(&hash) {
            self.handle_orphans(entry.clone())?;
        }

        Ok(Some(entry))
    }

    fn connect(
        &self,
        prev: ChainEntry,
        block: Arc<Block>,
        flags: ValidationFlags,
    ) -> Result<ChainEntry, ChainError> {
        let start = Instant::now();
        let mut entry = ChainEntry::from_block(&block, Some(&prev));
        let kernel = self.kernel();

        let kernel_start = Instant::now();
        match kernel.compute_next_stake_modifier(Some(&prev)) {
            Ok((modifier, generated)) => entry.set_stake_modifier(modifier, generated),
            Err(err) => {
                error!(hash = %entry.display_hash(), error = %err, "unable to compute stake modifier");
                return Err(VerifyError::malformed("compute-next-stake-modifier", 10)
                    .with_hash(entry.hash)
                    .into());
            }
        }

        if entry.is_proof_of_stake() {
            let coinstake = block.transactions.get(1).ok_or_else(|| {
                VerifyError::malformed("bad-cs-missing", 1).with_hash(entry.hash)
            })?;
            match kernel.check_proof_of_stake(&prev, coinstake, entry.bits, self.height()) {
                Ok(proof) => entry.proof_hash = proof.proof_hash,
                Err(ChainError::Verify(err)) => {
                    error!(hash = %entry.display_hash(), error = %err, "proof of stake rejected");
                    return Err(VerifyError::malformed(err.reason, 1)
                        .with_hash(entry.hash)
                        .into());
                }
                Err(err) => return Err(err),
            }
        }
        self.metrics.record_kernel(kernel_start.elapsed());

        if entry.chain_trust <= self.tip()?.chain_trust {
            self.save_alternate(&entry, &block, &prev, flags)?;
        } else {
            self.set_best_chain(&entry, &block, &prev, flags)?;
        }

        self.log_status(start, &block, &entry);
        self.maybe_sync();
        Ok(entry)
    }

    fn handle_orphans(&self, entry: ChainEntry) -> Result<(), ChainError> {
        let mut entry = entry;
        loop {
            let orphan = self.orphans.lock().resolve(&entry.hash);
            let Some(Orphan { block, flags, peer, .. }) = orphan else {
                return Ok(());
            };
            let hash = block.hash();

            entry = match self.connect(entry, block, flags) {
                Ok(entry) => entry,
                Err(ChainError::Verify(err)) => {
                    warn!(hash = %hash_to_display(&hash), error = %err, "could not resolve orphan block");
                    self.events.emit(ChainEvent::BadOrphan { error: err, peer });
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            debug!(hash = %hash_to_display(&hash), height = entry.height, "orphan block was resolved");
            self.events.emit(ChainEvent::Resolved {
                hash,
                entry: entry.clone(),
            });
        }
    }

    /// Per-block status logging is only worth it once blocks arrive slowly.
    fn is_slow(&self) -> bool {
        if self.options.spv {
            return false;
        }
        if self.is_full() {
            return true;
        }
        let height = self.height();
        height == 1 || height % 20 == 0 || height >= self.params.block.slow_height
    }

    fn log_status(&self, start: Instant, block: &Block, entry: &ChainEntry) {
        if !self.is_slow() {
            return;
        }
        info!(
            hash = %entry.display_hash(),
            height = entry.height,
            size = block.size(),
            txs = block.transactions.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "block added to chain"
        );
    }

    fn verify_checkpoint(&self, prev: &ChainEntry, hash: &Hash256) -> bool {
        if !self.options.checkpoints {
            return true;
        }
        let height = prev.height + 1;
        let Some(checkpoint) = self.params.checkpoint(height) else {
            return true;
        };

        if checkpoint == hash {
            debug!(hash = %hash_to_display(hash), height, "hit checkpoint block");
            self.events.emit(ChainEvent::Checkpoint {
                hash: *hash,
                height,
            });
            return true;
        }

        warn!(
            height,
            expected = %hash_to_display(checkpoint),
            received = %hash_to_display(hash),
            "checkpoint mismatch"
        );
        self.purge_orphans();
        false
    }

    fn store_orphan(&self, block: Arc<Block>, flags: ValidationFlags, peer: Option<u64>) {
        let hash = block.hash();
        let now = self.clock.now();
        let orphan = Orphan {
            block,
            flags,
            peer,
            time: now,
        };
        let replaced = self.orphans.lock().insert(orphan, now);
        if let Some(replaced) = replaced {
            warn!(hash = %hash_to_display(&replaced), "removing forked orphan block");
        }
        debug!(hash = %hash_to_display(&hash), "storing orphan block");
        self.events.emit(ChainEvent::Orphan { hash });
    }

    pub fn purge_orphans(&self) {
        let count = self.orphans.lock().purge();
        if count > 0 {
            debug!(count, "purged orphans");
        }
    }

    pub fn has_orphan(&self, hash: &Hash256) -> bool {
        self.orphans.lock().has(hash)
    }

    pub fn get_orphan(&self, hash: &Hash256) -> Option<Arc<Block>> {
        self.orphans
            .lock()
            .get(hash)
            .map(|orphan| Arc::clone(&orphan.block))
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// First missing ancestor of the orphan chain ending in `hash`.
    pub fn get_orphan_root(&self, hash: &Hash256) -> Option<Hash256> {
        self.orphans.lock().root(hash)
    }

    pub fn has_pending(&self, hash: &Hash256) -> bool {
        self.pending.lock().contains(hash)
    }

    /// Known invalid, or built directly on a known invalid parent.
    pub fn has_invalid(&self, block: &Block) -> bool {
        let hash = block.hash();
        let mut invalid = self.invalid.lock();
        if invalid.contains(&hash) {
            return true;
        }
        if invalid.contains(&block.header.prev_block) {
            invalid.put(hash, ());
            return true;
        }
        false
    }

    pub fn set_invalid(&self, hash: Hash256) {
        self.invalid.lock().put(hash, ());
    }

    pub fn remove_invalid(&self, hash: &Hash256) {
        self.invalid.lock().pop(hash);
    }

    /// Whether the block is stored, buffered, in flight or known invalid.
    pub fn has(&self, hash: &Hash256) -> Result<bool, ChainError> {
        if self.has_orphan(hash) || self.has_pending(hash) || self.invalid.lock().contains(hash) {
            return Ok(true);
        }
        self.db.has_entry(hash)
    }

    pub fn get_entry(&self, hash: &Hash256) -> Result<Option<ChainEntry>, ChainError> {
        self.db.get_entry(hash)
    }

    pub fn get_entry_by_height(&self, height: u32) -> Result<Option<ChainEntry>, ChainError> {
        self.db.get_entry_by_height(height)
    }

    pub fn get_hash(&self, height: u32) -> Result<Option<Hash256>, ChainError> {
        self.db.get_hash(height)
    }

    pub fn get_height(&self, hash: &Hash256) -> Result<Option<u32>, ChainError> {
        self.db.get_height(hash)
    }

    pub fn has_entry(&self, hash: &Hash256) -> Result<bool, ChainError> {
        self.db.has_entry(hash)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        self.db.get_block(hash)
    }

    pub fn has_coins(&self, tx: &Transaction) -> Result<bool, ChainError> {
        self.db.has_coins(&tx.txid())
    }

    fn maybe_sync(&self) {
        let tip = {
            let state = self.state.read();
            if state.synced {
                return;
            }
            match &state.tip {
                Some(tip) => tip.clone(),
                None => return,
            }
        };

        if self.options.checkpoints && tip.height < self.params.last_checkpoint {
            return;
        }
        if i64::from(tip.time) < self.clock.now() - self.params.block.max_tip_age {
            return;
        }

        self.state.write().synced = true;
        info!(height = tip.height, "chain is fully synced");
        self.events.emit(ChainEvent::Full);
    }

    /// Fraction of the time since genesis that the tip covers.
    pub fn get_progress(&self) -> Result<f64, ChainError> {
        let tip = self.tip()?;
        let start = i64::from(self.params.genesis.time);
        let current = i64::from(tip.time) - start;
        let end = self.clock.now() - start - 40 * 60;
        if end <= 0 {
            return Ok(1.0);
        }
        Ok((current as f64 / end as f64).min(1.0))
    }

    /// Block hashes from `start` back to genesis, one by one for the first
    /// ten and then with exponentially growing gaps.
    pub fn get_locator(&self, start: Option<Hash256>) -> Result<Vec<Hash256>, ChainError> {
        let _lock = self.locker.lock();
        let tip = self.tip()?;
        let start = start.unwrap_or(tip.hash);

        let mut hashes = Vec::new();
        let entry = match self.db.get_entry(&start)? {
            Some(entry) => entry,
            None => {
                hashes.push(start);
                tip
            }
        };

        let mut main = self.db.is_main_chain(&entry)?;
        let mut height = entry.height;
        let mut step = 1u32;
        hashes.push(entry.hash);

        while height > 0 {
            height = height.saturating_sub(step);
            if hashes.len() > 10 {
                step = step.saturating_mul(2);
            }

            let hash = if main {
                self.db
                    .get_hash(height)?
                    .ok_or(ChainError::Corrupt("missing main chain hash"))?
            } else {
                let ancestor = self
                    .db
                    .get_ancestor(&entry, height)?
                    .ok_or(ChainError::Corrupt("missing ancestor entry"))?;
                main = self.db.is_main_chain(&ancestor)?;
                ancestor.hash
            };
            hashes.push(hash);
        }

        Ok(hashes)
    }

    /// Seconds of work at the current difficulty separating two entries.
    pub fn get_proof_time(&self, to: &ChainEntry, from: &ChainEntry) -> Result<i64, ChainError> {
        let tip = self.tip()?;
        let (work, sign) = if to.chain_trust > from.chain_trust {
            (to.chain_trust - from.chain_trust, 1i64)
        } else {
            (from.chain_trust - to.chain_trust, -1i64)
        };
        let proof = tip.proof();
        if proof.is_zero() {
            return Ok(0);
        }
        let spacing = U256::from(self.params.pow.target_spacing.max(0) as u64);
        let work = work.saturating_mul(spacing) / proof;
        if work.bits() > 63 {
            return Ok(sign * i64::MAX);
        }
        Ok(sign * work.low_u64() as i64)
    }

    /// Compact target required for the block after `prev`.
    pub fn get_target(
        &self,
        prev: Option<&ChainEntry>,
        proof_of_stake: bool,
    ) -> Result<u32, ChainError> {
        let (limit, bits) = if proof_of_stake {
            (&self.params.pos.limit, self.params.pos.bits)
        } else {
            (&self.params.pow.limit, self.params.pow.bits)
        };

        let Some(prev) = prev else {
            return Ok(bits);
        };

        let last = self.get_last_entry(prev, proof_of_stake)?;
        if last.prev_block == ZERO_HASH {
            return Ok(bits);
        }
        let parent = self
            .db
            .get_previous(&last)?
            .ok_or(ChainError::Corrupt("missing previous entry"))?;
        let prev_last = self.get_last_entry(&parent, proof_of_stake)?;
        if prev_last.prev_block == ZERO_HASH {
            return Ok(bits);
        }

        let spacing = self.params.target_spacing(prev.height);
        let mut actual = i64::from(last.time) - i64::from(prev_last.time);
        if self.params.is_protocol_v1_retargeting_fixed(prev.height) && actual < 0 {
            actual = spacing;
        }

        next_target(last.bits, actual, spacing, self.params.pow.target_timespan, limit)
            .map_err(|_| ChainError::Corrupt("invalid compact target in entry"))
    }

    /// Most recent main chain hash in `locator`, or genesis.
    pub fn find_locator(&self, locator: &[Hash256]) -> Result<Hash256, ChainError> {
        for hash in locator {
            if self.db.is_main_hash(hash)? {
                return Ok(*hash);
            }
        }
        Ok(self.params.genesis.hash)
    }

    pub fn is_active(&self, prev: &ChainEntry, deployment: &Deployment) -> Result<bool, ChainError> {
        Ok(self.get_state(prev, deployment)? == ThresholdState::Active)
    }

    /// Version bits state of `deployment` for the block after `prev`.
    pub fn get_state(
        &self,
        prev: &ChainEntry,
        deployment: &Deployment,
    ) -> Result<ThresholdState, ChainError> {
        let bit = deployment.bit;
        let Some(start_time) = deployment.start_time else {
            return Ok(ThresholdState::Active);
        };
        let window = deployment.window.unwrap_or(self.params.miner_window);
        let threshold = deployment
            .threshold
            .unwrap_or(self.params.activation_threshold);
        if window == 0 {
            return Ok(ThresholdState::Defined);
        }

        // Align to the last entry of the previous window.
        let mut prev = prev.clone();
        let offset = (prev.height + 1) % window;
        if offset != 0 {
            let Some(height) = prev.height.checked_sub(offset) else {
                return Ok(ThresholdState::Defined);
            };
            match self.db.get_ancestor(&prev, height)? {
                Some(ancestor) => prev = ancestor,
                None => return Ok(ThresholdState::Defined),
            }
        }

        let mut state = ThresholdState::Defined;
        let mut compute = Vec::new();
        let mut cursor = Some(prev);
        while let Some(entry) = cursor {
            if let Some(cached) = self.db.get_state(bit, &entry.hash)? {
                state = cached;
                break;
            }

            let time = self.get_median_time(&entry, None)?;
            if time < start_time {
                state = ThresholdState::Defined;
                self.db.set_state(bit, &entry.hash, state)?;
                break;
            }

            cursor = match entry.height.checked_sub(window) {
                Some(height) => self.db.get_ancestor(&entry, height)?,
                None => None,
            };
            compute.push(entry);
        }

        while let Some(entry) = compute.pop() {
            state = match state {
                ThresholdState::Defined => {
                    let time = self.get_median_time(&entry, None)?;
                    if time >= deployment.timeout {
                        ThresholdState::Failed
                    } else if time >= start_time {
                        ThresholdState::Started
                    } else {
                        ThresholdState::Defined
                    }
                }
                ThresholdState::Started => {
                    let time = self.get_median_time(&entry, None)?;
                    if time >= deployment.timeout {
                        ThresholdState::Failed
                    } else if self.count_signals(&entry, bit, window)? >= threshold {
                        ThresholdState::LockedIn
                    } else {
                        ThresholdState::Started
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                ThresholdState::Failed | ThresholdState::Active => state,
            };
            self.db.set_state(bit, &entry.hash, state)?;
        }

        Ok(state)
    }

    /// Entries signalling `bit` among the `window` entries ending at `entry`.
    fn count_signals(&self, entry: &ChainEntry, bit: u8, window: u32) -> Result<u32, ChainError> {
        let mut count = 0;
        let mut cursor = Some(entry.clone());
        for _ in 0..window {
            let Some(block) = cursor else {
                break;
            };
            if block.has_bit(bit) {
                count += 1;
            }
            cursor = self.db.get_previous(&block)?;
        }
        Ok(count)
    }

    /// Version for a new block on `prev`, signalling every deployment that
    /// is started or locked in.
    pub fn compute_block_version(&self, prev: &ChainEntry) -> Result<u32, ChainError> {
        let mut version = 0u32;
        for deployment in &self.params.deployments {
            let state = self.get_state(prev, deployment)?;
            if matches!(state, ThresholdState::LockedIn | ThresholdState::Started) {
                version |= deployment.mask();
            }
        }
        Ok(version | VERSION_TOP_BITS)
    }

    fn get_deployment_state(&self) -> Result<DeploymentState, ChainError> {
        let tip = self.tip()?;
        let current = self.deployment_state();
        let Some(prev) = self.db.get_previous(&tip)? else {
            return Ok(current);
        };
        if self.options.spv {
            return Ok(current);
        }
        Ok(self.get_deployments(tip.time, &prev))
    }

    /// Lock time finality of `tx` in the block after `prev`.
    pub fn verify_final(
        &self,
        prev: &ChainEntry,
        tx: &Transaction,
        lock_flags: u32,
    ) -> Result<bool, ChainError> {
        let height = prev.height + 1;
        if tx.lock_time < LOCKTIME_THRESHOLD {
            return Ok(tx.is_final(height, None));
        }
        let time = if lock_flags & LOCKTIME_MEDIAN_TIME_PAST != 0 {
            self.get_median_time(prev, None)?
        } else {
            self.clock.now()
        };
        Ok(tx.is_final(height, Some(time)))
    }

    /// Minimum height and time that satisfy the relative lock times of
    /// `tx`, `-1` where no lock applies.
    pub fn get_locks(
        &self,
        prev: &ChainEntry,
        tx: &Transaction,
        view: &CoinView,
        lock_flags: u32,
    ) -> Result<(i64, i64), ChainError> {
        if lock_flags & LOCKTIME_VERIFY_SEQUENCE == 0 {
            return Ok((-1, -1));
        }
        if tx.is_coinbase() || tx.version < 2 {
            return Ok((-1, -1));
        }

        let mut min_height = -1i64;
        let mut min_time = -1i64;
        for input in &tx.vin {
            let sequence = input.sequence;
            if sequence & SEQUENCE_DISABLE_FLAG != 0 {
                continue;
            }

            let height = match view.get_height(&input.prevout) {
                Some(height) => i64::from(height),
                None => i64::from(self.height()) + 1,
            };
            let value = i64::from(sequence & SEQUENCE_MASK);

            if sequence & SEQUENCE_TYPE_FLAG == 0 {
                min_height = min_height.max(height + value - 1);
                continue;
            }

            let ancestor_height = (height - 1).max(0) as u32;
            let ancestor = self
                .db
                .get_ancestor(prev, ancestor_height)?
                .ok_or(ChainError::Corrupt("missing ancestor for sequence lock"))?;
            let time = self.get_median_time(&ancestor, None)?
                + (value << SEQUENCE_GRANULARITY)
                - 1;
            min_time = min_time.max(time);
        }

        Ok((min_height, min_time))
    }

    pub fn verify_locks(
        &self,
        prev: &ChainEntry,
        tx: &Transaction,
        view: &CoinView,
        lock_flags: u32,
    ) -> Result<bool, ChainError> {
        let (height, time) = self.get_locks(prev, tx, view, lock_flags)?;

        if height != -1 && height >= i64::from(prev.height) + 1 {
            return Ok(false);
        }

        if time != -1 {
            let mtp = self.get_median_time(prev, None)?;
            if time >= mtp {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

/// A body-less block standing in for one that was never downloaded.
fn header_block(entry: &ChainEntry) -> Block {
    Block {
        header: entry.header(),
        transactions: Vec::new(),
    }
}
