use std::collections::HashMap;
use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp, ALL_COLUMNS};

/// Persistent store with one fjall partition per column.
pub struct FjallStore {
    keyspace: Keyspace,
    partitions: HashMap<Column, PartitionHandle>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_config(Config::new(path), PartitionCreateOptions::default())
    }

    pub fn open_with_config(
        config: Config,
        partition_options: PartitionCreateOptions,
    ) -> Result<Self, StoreError> {
        let keyspace = config.open().map_err(map_err)?;
        let mut partitions = HashMap::new();
        for column in ALL_COLUMNS {
            let handle = keyspace
                .open_partition(column.as_str(), partition_options.clone())
                .map_err(map_err)?;
            partitions.insert(column, handle);
        }
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    /// Flushes the journal to disk.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(map_err)
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(&column)
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let partition = self.partition(column)?;
        let value = partition.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.insert(key, value).map_err(map_err)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.remove(key).map_err(map_err)
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut results = Vec::new();
        self.for_each_prefix(column, prefix, &mut |key, value| {
            results.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let partition = self.partition(column)?;
        for entry in partition.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut fjall_batch = self.keyspace.batch();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    let partition = self.partition(*column)?;
                    fjall_batch.insert(partition, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    let partition = self.partition(*column)?;
                    fjall_batch.remove(partition, key.as_slice());
                }
            }
        }
        fjall_batch.commit().map_err(map_err)
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_and_prefix_scan() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FjallStore::open(dir.path()).expect("open");
        let mut batch = WriteBatch::new();
        batch.put(Column::Entry, vec![1u8; 32], vec![7u8; 4]);
        batch.put(Column::HeightIndex, 5u32.to_be_bytes().to_vec(), vec![1u8; 32]);
        batch.put(Column::HeightIndex, 6u32.to_be_bytes().to_vec(), vec![2u8; 32]);
        store.write_batch(&batch).expect("commit");
        store.delete(Column::HeightIndex, &5u32.to_be_bytes()).expect("delete");
        store.persist().expect("persist");

        assert_eq!(
            store.get(Column::Entry, &[1u8; 32]).expect("get"),
            Some(vec![7u8; 4])
        );
        let heights = store.scan_prefix(Column::HeightIndex, &[]).expect("scan");
        assert_eq!(heights, vec![(6u32.to_be_bytes().to_vec(), vec![2u8; 32])]);
    }
}
