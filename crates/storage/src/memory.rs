use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Ordered in-memory store. Batches are applied under a single write lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Column, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held in `column`.
    pub fn len(&self, column: Column) -> usize {
        self.tables.read().get(&column).map_or(0, BTreeMap::len)
    }
}

fn prefixed<'t>(table: &'t Table, prefix: &'t [u8]) -> impl Iterator<Item = (&'t Vec<u8>, &'t Vec<u8>)> {
    table
        .range(prefix.to_vec()..)
        .take_while(move |(key, _)| key.starts_with(prefix))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .tables
            .read()
            .get(&column)
            .and_then(|table| table.get(key).cloned()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tables
            .write()
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        if let Some(table) = self.tables.write().get_mut(&column) {
            table.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let tables = self.tables.read();
        let Some(table) = tables.get(&column) else {
            return Ok(Vec::new());
        };
        Ok(prefixed(table, prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        // Snapshot first so visitors may call back into the store.
        let entries = self.scan_prefix(column, prefix)?;
        for (key, value) in &entries {
            visitor(key, value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    tables
                        .entry(*column)
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    if let Some(table) = tables.get_mut(column) {
                        table.remove(key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store.put(Column::Coin, b"ab2", b"2").expect("put");
        store.put(Column::Coin, b"ab1", b"1").expect("put");
        store.put(Column::Coin, b"ac0", b"x").expect("put");
        store.put(Column::Undo, b"ab0", b"y").expect("put");
        let found = store.scan_prefix(Column::Coin, b"ab").expect("scan");
        assert_eq!(
            found,
            vec![
                (b"ab1".to_vec(), b"1".to_vec()),
                (b"ab2".to_vec(), b"2".to_vec())
            ]
        );
    }

    #[test]
    fn batch_applies_puts_and_deletes() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"old", b"1").expect("put");
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"new".to_vec(), b"2".to_vec());
        batch.delete(Column::Meta, b"old".to_vec());
        store.write_batch(&batch).expect("batch");
        assert_eq!(store.get(Column::Meta, b"old").expect("get"), None);
        assert_eq!(store.get(Column::Meta, b"new").expect("get"), Some(b"2".to_vec()));
        assert_eq!(store.len(Column::Meta), 1);
    }

    #[test]
    fn visitor_errors_stop_iteration() {
        let store = MemoryStore::new();
        for key in [b"k1", b"k2", b"k3"] {
            store.put(Column::Entry, key, b"v").expect("put");
        }
        let mut seen = 0;
        let result = store.for_each_prefix(Column::Entry, b"k", &mut |key, _| {
            seen += 1;
            if key == b"k2" {
                return Err(StoreError::Backend("stop".to_string()));
            }
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(seen, 2);
    }
}
