//! Blocks waiting for an unknown parent.

use std::collections::HashMap;
use std::sync::Arc;

use ldoged_consensus::Hash256;
use ldoged_primitives::Block;

use crate::validation::ValidationFlags;

#[derive(Clone, Debug)]
pub struct Orphan {
    pub block: Arc<Block>,
    pub flags: ValidationFlags,
    /// Peer that relayed the block, echoed back in bad orphan events.
    pub peer: Option<u64>,
    pub time: i64,
}

/// Orphans keyed by hash with a single slot per missing parent.
#[derive(Debug)]
pub struct OrphanPool {
    by_hash: HashMap<Hash256, Orphan>,
    by_prev: HashMap<Hash256, Hash256>,
    max_orphans: usize,
    ttl: i64,
}

impl OrphanPool {
    pub fn new(max_orphans: usize, ttl: i64) -> Self {
        Self {
            by_hash: HashMap::new(),
            by_prev: HashMap::new(),
            max_orphans,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn has(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&Orphan> {
        self.by_hash.get(hash)
    }

    /// Whether an orphan is waiting on `prev`.
    pub fn has_next(&self, prev: &Hash256) -> bool {
        self.by_prev.contains_key(prev)
    }

    /// Buffers `orphan`. Returns the hash of an orphan it displaced because
    /// both build on the same missing parent.
    pub fn insert(&mut self, orphan: Orphan, now: i64) -> Option<Hash256> {
        let prev = orphan.block.header.prev_block;
        let replaced = self
            .by_prev
            .get(&prev)
            .copied()
            .and_then(|hash| self.remove(&hash))
            .map(|orphan| orphan.block.hash());

        self.limit(now);

        let hash = orphan.block.hash();
        self.by_prev.insert(prev, hash);
        self.by_hash.insert(hash, orphan);
        replaced
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<Orphan> {
        let orphan = self.by_hash.remove(hash)?;
        self.by_prev.remove(&orphan.block.header.prev_block);
        Some(orphan)
    }

    /// Takes the orphan building on `prev`.
    pub fn resolve(&mut self, prev: &Hash256) -> Option<Orphan> {
        let hash = self.by_prev.get(prev).copied()?;
        self.remove(&hash)
    }

    /// Drops every orphan and returns how many there were.
    pub fn purge(&mut self) -> usize {
        let count = self.by_hash.len();
        self.by_hash.clear();
        self.by_prev.clear();
        count
    }

    /// Expires stale orphans, then evicts the oldest one when the pool is
    /// still at capacity.
    pub fn limit(&mut self, now: i64) -> usize {
        let expired: Vec<Hash256> = self
            .by_hash
            .iter()
            .filter(|(_, orphan)| now >= orphan.time + self.ttl)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            self.remove(hash);
        }

        let mut removed = expired.len();
        if self.by_hash.len() >= self.max_orphans {
            let oldest = self
                .by_hash
                .iter()
                .min_by_key(|(_, orphan)| orphan.time)
                .map(|(hash, _)| *hash);
            if let Some(hash) = oldest {
                self.remove(&hash);
                removed += 1;
            }
        }
        removed
    }

    /// First missing ancestor of an orphan chain ending in `hash`.
    pub fn root(&self, hash: &Hash256) -> Option<Hash256> {
        let mut root = None;
        let mut cursor = *hash;
        while let Some(orphan) = self.by_hash.get(&cursor) {
            root = Some(cursor);
            cursor = orphan.block.header.prev_block;
        }
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldoged_primitives::block::BlockHeader;

    fn orphan(prev: u8, nonce: u32, time: i64) -> Orphan {
        let block = Block {
            header: BlockHeader {
                version: 7,
                prev_block: [prev; 32],
                merkle_root: [0; 32],
                time: 1_500_000_000,
                bits: 0x1e0f_ffff,
                nonce,
            },
            transactions: Vec::new(),
        };
        Orphan {
            block: Arc::new(block),
            flags: ValidationFlags::default(),
            peer: None,
            time,
        }
    }

    #[test]
    fn same_parent_replaces_previous_orphan() {
        let mut pool = OrphanPool::new(20, 3600);
        let first = orphan(1, 1, 0);
        let first_hash = first.block.hash();
        assert_eq!(pool.insert(first, 0), None);

        let second = orphan(1, 2, 5);
        let second_hash = second.block.hash();
        assert_eq!(pool.insert(second, 5), Some(first_hash));
        assert_eq!(pool.len(), 1);
        assert!(pool.has(&second_hash));
        assert_eq!(
            pool.resolve(&[1; 32]).map(|orphan| orphan.block.hash()),
            Some(second_hash)
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn expired_and_oldest_orphans_are_evicted() {
        let mut pool = OrphanPool::new(2, 100);
        pool.insert(orphan(1, 0, 0), 0);
        pool.insert(orphan(2, 0, 50), 50);
        // The first orphan expires, the second is kept.
        pool.insert(orphan(3, 0, 120), 120);
        assert_eq!(pool.len(), 2);
        assert!(!pool.has_next(&[1; 32]));

        // At capacity the oldest survivor goes.
        pool.insert(orphan(4, 0, 130), 130);
        assert_eq!(pool.len(), 2);
        assert!(!pool.has_next(&[2; 32]));
        assert!(pool.has_next(&[3; 32]) && pool.has_next(&[4; 32]));
    }

    #[test]
    fn root_follows_orphan_parents() {
        let mut pool = OrphanPool::new(20, 3600);
        let child = orphan(1, 0, 0);
        let child_hash = child.block.hash();
        pool.insert(child, 0);

        let mut grandchild = orphan(0, 1, 0);
        Arc::make_mut(&mut grandchild.block).header.prev_block = child_hash;
        let grandchild_hash = grandchild.block.hash();
        pool.insert(grandchild, 0);

        assert_eq!(pool.root(&grandchild_hash), Some(child_hash));
        assert_eq!(pool.root(&[9; 32]), None);
        assert_eq!(pool.purge(), 2);
    }
}
