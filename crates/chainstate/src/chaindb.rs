//! Entry, block and coin storage on top of a key-value store.

use std::num::NonZeroUsize;
use std::sync::Arc;

use ldoged_consensus::{ChainParams, Hash256, ThresholdState, ZERO_HASH};
use ldoged_primitives::{Block, OutPoint, Transaction};
use ldoged_storage::{Column, KeyValueStore, WriteBatch};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use primitive_types::U256;
use tracing::{debug, info};

use crate::coins::{BlockUndo, Coin, CoinView};
use crate::entry::ChainEntry;
use crate::error::ChainError;
use crate::options::ChainOptions;

const META_TIP_KEY: &[u8] = b"tip";
const META_PRUNED_KEY: &[u8] = b"pruned";

/// Where `ChainDb::reset` should rewind to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetTarget {
    Hash(Hash256),
    Height(u32),
}

impl From<Hash256> for ResetTarget {
    fn from(hash: Hash256) -> Self {
        ResetTarget::Hash(hash)
    }
}

impl From<u32> for ResetTarget {
    fn from(height: u32) -> Self {
        ResetTarget::Height(height)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct DbState {
    tip: Hash256,
    pruned: bool,
    open: bool,
}

pub struct ChainDb<S> {
    store: S,
    params: Arc<ChainParams>,
    spv: bool,
    prune: bool,
    keep_blocks: u32,
    entries: Mutex<LruCache<Hash256, ChainEntry>>,
    state: RwLock<DbState>,
}

fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

fn state_key(bit: u8, hash: &Hash256) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = bit;
    key[1..].copy_from_slice(hash);
    key
}

fn hash_from_value(bytes: &[u8]) -> Result<Hash256, ChainError> {
    bytes
        .try_into()
        .map_err(|_| ChainError::Corrupt("stored hash has wrong length"))
}

impl<S: KeyValueStore> ChainDb<S> {
    pub fn new(store: S, params: Arc<ChainParams>, options: &ChainOptions) -> Self {
        let capacity = NonZeroUsize::new(options.entry_cache.max(1)).unwrap_or(NonZeroUsize::MIN);
        let keep_blocks = options.keep_blocks.unwrap_or(params.block.keep_blocks);
        Self {
            store,
            params,
            spv: options.spv,
            prune: options.prune,
            keep_blocks,
            entries: Mutex::new(LruCache::new(capacity)),
            state: RwLock::new(DbState::default()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Loads the stored tip, writing the genesis block first on an empty store.
    pub fn open(&self) -> Result<ChainEntry, ChainError> {
        if self.state.read().open {
            return Err(ChainError::AlreadyOpen);
        }

        let tip = match self.store.get(Column::Meta, META_TIP_KEY)? {
            Some(bytes) => {
                let tip = hash_from_value(&bytes)?;
                let pruned = self.store.get(Column::Meta, META_PRUNED_KEY)?.is_some();
                {
                    let mut state = self.state.write();
                    state.tip = tip;
                    state.pruned = pruned;
                    state.open = true;
                }
                let genesis = self.get_hash(0)?;
                if genesis != Some(self.params.genesis.hash) {
                    self.state.write().open = false;
                    return Err(ChainError::Corrupt("genesis block does not match network"));
                }
                self.get_entry(&tip)?
                    .ok_or(ChainError::Corrupt("missing tip entry"))?
            }
            None => {
                self.state.write().open = true;
                self.save_genesis()?
            }
        };

        info!(height = tip.height, hash = %tip.display_hash(), "chain database loaded");
        Ok(tip)
    }

    pub fn close(&self) {
        let mut state = self.state.write();
        state.open = false;
        self.entries.lock().clear();
    }

    fn save_genesis(&self) -> Result<ChainEntry, ChainError> {
        let block = Block::genesis(&self.params);
        let mut entry = ChainEntry::from_block(&block, None);
        entry.set_stake_modifier(U256::zero(), true);
        self.save(&entry, &block, Some(&CoinView::new()))?;
        debug!(hash = %entry.display_hash(), "wrote genesis block");
        Ok(entry)
    }

    fn ensure_open(&self) -> Result<(), ChainError> {
        if self.state.read().open {
            Ok(())
        } else {
            Err(ChainError::NotOpen)
        }
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.state.read().tip
    }

    pub fn is_pruned(&self) -> bool {
        self.state.read().pruned
    }

    pub fn get_tip(&self) -> Result<ChainEntry, ChainError> {
        let tip = self.tip_hash();
        self.get_entry(&tip)?
            .ok_or(ChainError::Corrupt("missing tip entry"))
    }

    pub fn get_entry(&self, hash: &Hash256) -> Result<Option<ChainEntry>, ChainError> {
        if *hash == ZERO_HASH {
            return Ok(None);
        }
        if let Some(entry) = self.entries.lock().get(hash) {
            return Ok(Some(entry.clone()));
        }
        let Some(bytes) = self.store.get(Column::Entry, hash)? else {
            return Ok(None);
        };
        let entry = ChainEntry::decode(&bytes)?;
        self.entries.lock().put(*hash, entry.clone());
        Ok(Some(entry))
    }

    pub fn has_entry(&self, hash: &Hash256) -> Result<bool, ChainError> {
        if self.entries.lock().contains(hash) {
            return Ok(true);
        }
        Ok(self.store.get(Column::Entry, hash)?.is_some())
    }

    /// Main chain hash at `height`.
    pub fn get_hash(&self, height: u32) -> Result<Option<Hash256>, ChainError> {
        match self.store.get(Column::HeightIndex, &height_key(height))? {
            Some(bytes) => Ok(Some(hash_from_value(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_height(&self, hash: &Hash256) -> Result<Option<u32>, ChainError> {
        Ok(self.get_entry(hash)?.map(|entry| entry.height))
    }

    pub fn get_entry_by_height(&self, height: u32) -> Result<Option<ChainEntry>, ChainError> {
        match self.get_hash(height)? {
            Some(hash) => self.get_entry(&hash),
            None => Ok(None),
        }
    }

    pub fn get_previous(&self, entry: &ChainEntry) -> Result<Option<ChainEntry>, ChainError> {
        if entry.is_genesis() {
            return Ok(None);
        }
        self.get_entry(&entry.prev_block)
    }

    /// Successor of a main chain entry.
    pub fn get_next(&self, entry: &ChainEntry) -> Result<Option<ChainEntry>, ChainError> {
        match self.store.get(Column::NextHash, &entry.hash)? {
            Some(bytes) => self.get_entry(&hash_from_value(&bytes)?),
            None => Ok(None),
        }
    }

    pub fn is_main_chain(&self, entry: &ChainEntry) -> Result<bool, ChainError> {
        if entry.hash == self.tip_hash() {
            return Ok(true);
        }
        Ok(self.get_hash(entry.height)? == Some(entry.hash))
    }

    pub fn is_main_hash(&self, hash: &Hash256) -> Result<bool, ChainError> {
        match self.get_entry(hash)? {
            Some(entry) => self.is_main_chain(&entry),
            None => Ok(false),
        }
    }

    pub fn get_ancestor(
        &self,
        entry: &ChainEntry,
        height: u32,
    ) -> Result<Option<ChainEntry>, ChainError> {
        if height > entry.height {
            return Ok(None);
        }
        if self.is_main_chain(entry)? {
            return self.get_entry_by_height(height);
        }
        let mut current = entry.clone();
        while current.height > height {
            current = self
                .get_previous(&current)?
                .ok_or(ChainError::Corrupt("missing ancestor entry"))?;
        }
        Ok(Some(current))
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        match self.store.get(Column::Block, hash)? {
            Some(bytes) => Ok(Some(Block::consensus_decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.store.get(Column::Block, hash)?.is_some())
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        match self.store.get(Column::Coin, &outpoint.to_key())? {
            Some(bytes) => Ok(Some(Coin::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// True when any output of `txid` is still unspent.
    pub fn has_coins(&self, txid: &Hash256) -> Result<bool, ChainError> {
        Ok(!self.store.scan_prefix(Column::Coin, txid)?.is_empty())
    }

    pub fn get_undo(&self, hash: &Hash256) -> Result<BlockUndo, ChainError> {
        match self.store.get(Column::Undo, hash)? {
            Some(bytes) => Ok(BlockUndo::decode(&bytes)?),
            None => Ok(BlockUndo::default()),
        }
    }

    pub fn get_state(&self, bit: u8, hash: &Hash256) -> Result<Option<ThresholdState>, ChainError> {
        match self.store.get(Column::StateCache, &state_key(bit, hash))? {
            Some(bytes) => {
                let value = bytes
                    .first()
                    .copied()
                    .ok_or(ChainError::Corrupt("empty deployment state"))?;
                ThresholdState::from_u8(value)
                    .map(Some)
                    .ok_or(ChainError::Corrupt("unknown deployment state"))
            }
            None => Ok(None),
        }
    }

    pub fn set_state(
        &self,
        bit: u8,
        hash: &Hash256,
        state: ThresholdState,
    ) -> Result<(), ChainError> {
        self.store
            .put(Column::StateCache, &state_key(bit, hash), &[state.as_u8()])?;
        Ok(())
    }

    /// Stores `entry` and `block`. With a `view` the entry also becomes the
    /// new main chain tip and the view's coin changes are applied.
    pub fn save(
        &self,
        entry: &ChainEntry,
        block: &Block,
        view: Option<&CoinView>,
    ) -> Result<(), ChainError> {
        self.ensure_open()?;
        let mut batch = WriteBatch::new();
        batch.put(Column::Entry, entry.hash.to_vec(), entry.encode());
        if !self.spv {
            batch.put(Column::Block, entry.hash.to_vec(), block.consensus_encode());
        }
        if let Some(view) = view {
            self.connect_into(&mut batch, entry, view)?;
        }
        self.store.write_batch(&batch)?;
        self.entries.lock().put(entry.hash, entry.clone());
        if view.is_some() {
            self.state.write().tip = entry.hash;
        }
        Ok(())
    }

    /// Makes an already stored alternate entry part of the main chain again.
    pub fn reconnect(
        &self,
        entry: &ChainEntry,
        _block: &Block,
        view: &CoinView,
    ) -> Result<(), ChainError> {
        self.ensure_open()?;
        let mut batch = WriteBatch::new();
        self.connect_into(&mut batch, entry, view)?;
        self.store.write_batch(&batch)?;
        self.state.write().tip = entry.hash;
        Ok(())
    }

    fn connect_into(
        &self,
        batch: &mut WriteBatch,
        entry: &ChainEntry,
        view: &CoinView,
    ) -> Result<(), ChainError> {
        batch.put(Column::HeightIndex, height_key(entry.height).to_vec(), entry.hash.to_vec());
        if !entry.is_genesis() {
            batch.put(Column::NextHash, entry.prev_block.to_vec(), entry.hash.to_vec());
        }
        batch.put(Column::Meta, META_TIP_KEY.to_vec(), entry.hash.to_vec());

        if self.spv {
            return Ok(());
        }

        write_coins(batch, view);
        if !view.undo().is_empty() {
            batch.put(Column::Undo, entry.hash.to_vec(), view.undo().encode());
        }

        if self.prune || self.is_pruned() {
            self.prune_behind(batch, entry.height)?;
        }
        Ok(())
    }

    fn prune_behind(&self, batch: &mut WriteBatch, height: u32) -> Result<(), ChainError> {
        let Some(target) = height.checked_sub(self.keep_blocks) else {
            return Ok(());
        };
        if target <= self.params.block.prune_after_height {
            return Ok(());
        }
        if let Some(hash) = self.get_hash(target)? {
            batch.delete(Column::Block, hash.to_vec());
            batch.delete(Column::Undo, hash.to_vec());
        }
        Ok(())
    }

    /// Removes the tip from the main chain and returns the coin changes
    /// that were reverted.
    pub fn disconnect(&self, entry: &ChainEntry, block: &Block) -> Result<CoinView, ChainError> {
        self.ensure_open()?;
        let view = self.undo_view(entry, block)?;
        let mut batch = WriteBatch::new();
        batch.delete(Column::HeightIndex, height_key(entry.height).to_vec());
        batch.delete(Column::NextHash, entry.prev_block.to_vec());
        batch.put(Column::Meta, META_TIP_KEY.to_vec(), entry.prev_block.to_vec());
        if !self.spv {
            write_coins(&mut batch, &view);
            batch.delete(Column::Undo, entry.hash.to_vec());
        }
        self.store.write_batch(&batch)?;
        self.state.write().tip = entry.prev_block;
        Ok(view)
    }

    /// Reverts the coin changes of `block` using its undo record.
    fn undo_view(&self, entry: &ChainEntry, block: &Block) -> Result<CoinView, ChainError> {
        let mut view = CoinView::new();
        if self.spv {
            return Ok(view);
        }
        let mut undo = self.get_undo(&entry.hash)?;
        for (index, tx) in block.transactions.iter().enumerate().rev() {
            let txid = tx.txid();
            for output in 0..tx.vout.len() {
                if let Some(coin) = Coin::from_tx(tx, output, entry.height) {
                    view.remove_coin(OutPoint::new(txid, output as u32), coin);
                }
            }
            if index == 0 {
                continue;
            }
            for input in tx.vin.iter().rev() {
                let (outpoint, coin) = undo
                    .spent
                    .pop()
                    .ok_or(ChainError::Corrupt("block undo input mismatch"))?;
                if outpoint != input.prevout {
                    return Err(ChainError::Corrupt("block undo outpoint mismatch"));
                }
                view.add_coin(outpoint, coin);
            }
        }
        if !undo.spent.is_empty() {
            return Err(ChainError::Corrupt("block undo has leftover coins"));
        }
        Ok(view)
    }

    /// Rewinds the main chain to `target`, deleting every entry above it and
    /// every alternate chain.
    pub fn reset(&self, target: ResetTarget) -> Result<ChainEntry, ChainError> {
        self.ensure_open()?;
        let entry = match target {
            ResetTarget::Hash(hash) => self.get_entry(&hash)?,
            ResetTarget::Height(height) => self.get_entry_by_height(height)?,
        }
        .ok_or(ChainError::NotFound)?;

        if !self.is_main_chain(&entry)? {
            return Err(ChainError::AlternateChain);
        }
        if self.is_pruned() {
            return Err(ChainError::Pruned);
        }

        self.remove_alternates()?;

        let mut tip = self.get_tip()?;
        while tip.hash != entry.hash {
            let mut batch = WriteBatch::new();
            if !self.spv {
                let block = self
                    .get_block(&tip.hash)?
                    .ok_or(ChainError::Corrupt("missing block during reset"))?;
                let view = self.undo_view(&tip, &block)?;
                write_coins(&mut batch, &view);
            }
            batch.delete(Column::Entry, tip.hash.to_vec());
            batch.delete(Column::Block, tip.hash.to_vec());
            batch.delete(Column::Undo, tip.hash.to_vec());
            batch.delete(Column::HeightIndex, height_key(tip.height).to_vec());
            batch.delete(Column::NextHash, tip.prev_block.to_vec());
            batch.put(Column::Meta, META_TIP_KEY.to_vec(), tip.prev_block.to_vec());
            self.store.write_batch(&batch)?;

            self.entries.lock().pop(&tip.hash);
            self.state.write().tip = tip.prev_block;
            tip = self
                .get_previous(&tip)?
                .ok_or(ChainError::Corrupt("missing previous entry during reset"))?;
        }

        self.clear_state_cache()?;
        info!(height = entry.height, hash = %entry.display_hash(), "chain database reset");
        Ok(entry)
    }

    fn remove_alternates(&self) -> Result<(), ChainError> {
        let mut alternates = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::Entry, &[])? {
            let entry = ChainEntry::decode(&value)?;
            if !self.is_main_chain(&entry)? {
                alternates.push(key);
            }
        }
        if alternates.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        let mut cache = self.entries.lock();
        for key in &alternates {
            if let Ok(hash) = hash_from_value(key) {
                cache.pop(&hash);
            }
            batch.delete(Column::Entry, key.clone());
            batch.delete(Column::Block, key.clone());
        }
        drop(cache);
        self.store.write_batch(&batch)?;
        debug!(count = alternates.len(), "removed alternate chain entries");
        Ok(())
    }

    fn clear_state_cache(&self) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.store.scan_prefix(Column::StateCache, &[])? {
            batch.delete(Column::StateCache, key);
        }
        if !batch.is_empty() {
            self.store.write_batch(&batch)?;
        }
        Ok(())
    }

    /// Deletes full blocks older than the keep window. Returns `false` when
    /// there is nothing to prune yet.
    pub fn prune(&self) -> Result<bool, ChainError> {
        self.ensure_open()?;
        if self.spv || self.is_pruned() {
            return Ok(false);
        }
        let tip = self.get_tip()?;
        let start = self.params.block.prune_after_height + 1;
        let Some(end) = tip.height.checked_sub(self.keep_blocks) else {
            return Ok(false);
        };
        if end <= start {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        for height in start..=end {
            if let Some(hash) = self.get_hash(height)? {
                batch.delete(Column::Block, hash.to_vec());
                batch.delete(Column::Undo, hash.to_vec());
            }
        }
        batch.put(Column::Meta, META_PRUNED_KEY.to_vec(), vec![1]);
        self.store.write_batch(&batch)?;
        self.state.write().pruned = true;
        info!(start, end, "pruned block data");
        Ok(true)
    }

    /// Walks the main chain from `start`, handing each block's matching
    /// transactions to `iter`.
    pub fn scan(
        &self,
        start: &ChainEntry,
        filter: &mut dyn FnMut(&Transaction) -> bool,
        iter: &mut dyn FnMut(&ChainEntry, Vec<Transaction>) -> Result<(), ChainError>,
    ) -> Result<(), ChainError> {
        self.ensure_open()?;
        if self.is_pruned() {
            return Err(ChainError::Pruned);
        }
        if !self.is_main_chain(start)? {
            return Err(ChainError::AlternateChain);
        }
        let mut current = Some(start.clone());
        while let Some(entry) = current {
            let block = self
                .get_block(&entry.hash)?
                .ok_or(ChainError::Corrupt("missing block during scan"))?;
            let matched: Vec<Transaction> = block
                .transactions
                .into_iter()
                .filter(|tx| filter(tx))
                .collect();
            iter(&entry, matched)?;
            current = self.get_next(&entry)?;
        }
        Ok(())
    }
}

fn write_coins(batch: &mut WriteBatch, view: &CoinView) {
    for (outpoint, coin) in view.changes() {
        let key = outpoint.to_key().to_vec();
        match coin {
            Some(coin) => batch.put(Column::Coin, key, coin.encode()),
            None => batch.delete(Column::Coin, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldoged_consensus::{chain_params, Network};
    use ldoged_storage::MemoryStore;

    fn open_db() -> ChainDb<MemoryStore> {
        let params = Arc::new(chain_params(Network::Mainnet));
        let db = ChainDb::new(MemoryStore::new(), params, &ChainOptions::default());
        db.open().expect("open");
        db
    }

    #[test]
    fn open_writes_genesis() {
        let db = open_db();
        let tip = db.get_tip().expect("tip");
        assert!(tip.is_genesis());
        assert!(tip.generated_stake_modifier());
        assert_eq!(tip.hash, db.params().genesis.hash);
        assert_eq!(db.get_hash(0).expect("hash"), Some(tip.hash));
        assert!(db.is_main_chain(&tip).expect("main"));
        assert!(db.get_block(&tip.hash).expect("block").is_some());
        assert!(matches!(db.open(), Err(ChainError::AlreadyOpen)));
    }

    #[test]
    fn reopen_loads_existing_tip() {
        let params = Arc::new(chain_params(Network::Mainnet));
        let store = Arc::new(MemoryStore::new());
        let first = ChainDb::new(Arc::clone(&store), Arc::clone(&params), &ChainOptions::default());
        let genesis = first.open().expect("open");
        first.close();
        let second = ChainDb::new(store, params, &ChainOptions::default());
        assert_eq!(second.open().expect("reopen"), genesis);
    }

    #[test]
    fn state_cache_round_trips() {
        let db = open_db();
        let hash = db.tip_hash();
        assert_eq!(db.get_state(0, &hash).expect("state"), None);
        db.set_state(0, &hash, ThresholdState::LockedIn).expect("set");
        assert_eq!(
            db.get_state(0, &hash).expect("state"),
            Some(ThresholdState::LockedIn)
        );
    }

    #[test]
    fn closed_database_rejects_writes() {
        let db = open_db();
        let tip = db.get_tip().expect("tip");
        let block = db.get_block(&tip.hash).expect("block").expect("genesis");
        db.close();
        assert!(matches!(
            db.save(&tip, &block, None),
            Err(ChainError::NotOpen)
        ));
    }
}
