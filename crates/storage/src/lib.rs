//! Column-oriented key-value storage behind the chain database.

use std::sync::Arc;

use thiserror::Error;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Backend(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// Block hash to serialized chain entry.
    Entry,
    /// Big-endian height to main chain block hash.
    HeightIndex,
    /// Main chain block hash to the hash of its successor.
    NextHash,
    /// Block hash to raw block.
    Block,
    /// Outpoint to unspent coin.
    Coin,
    /// Block hash to the coins its transactions spent.
    Undo,
    /// Deployment bit and block hash to cached threshold state.
    StateCache,
    Meta,
}

pub const ALL_COLUMNS: [Column; 8] = [
    Column::Entry,
    Column::HeightIndex,
    Column::NextHash,
    Column::Block,
    Column::Coin,
    Column::Undo,
    Column::StateCache,
    Column::Meta,
];

impl Column {
    pub fn as_str(self) -> &'static str {
        match self {
            Column::Entry => "entry",
            Column::HeightIndex => "height_index",
            Column::NextHash => "next_hash",
            Column::Block => "block",
            Column::Coin => "coin",
            Column::Undo => "undo",
            Column::StateCache => "state_cache",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Vec<u8>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }
}

pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    /// Visits entries in key order without collecting them.
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    /// Applies every operation of `batch` atomically.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}
