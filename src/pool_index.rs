//! Hash → (section, index-within-section) lookup (§3 DATA MODEL — pool index).
//!
//! Gives O(1) lookup for connecting an incoming hash or block to existing
//! structure, without needing to walk sections.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::hash::BlockHash;
use crate::section::SectionId;

/// Where a known hash lives: which section, and at what offset from the
/// bottom (offset 0 == the section's bottom node).
#[derive(Clone, Copy, Debug)]
pub struct PoolEntry {
    pub section: SectionId,
    pub offset: usize,
}

#[derive(Default)]
pub struct PoolIndex {
    inner: RwLock<HashMap<BlockHash, PoolEntry>>,
}

impl PoolIndex {
    pub fn new() -> PoolIndex {
        PoolIndex::default()
    }

    pub fn get(&self, hash: &BlockHash) -> Option<PoolEntry> {
        self.inner.read().get(hash).copied()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.inner.read().contains_key(hash)
    }

    pub fn insert(&self, hash: BlockHash, entry: PoolEntry) {
        self.inner.write().insert(hash, entry);
    }

    pub fn remove(&self, hash: &BlockHash) {
        self.inner.write().remove(hash);
    }

    /// Re-point every hash of `section` whose recorded offset is `>= from`
    /// to `to`, decrementing the offset by `shift`. Used when a section is
    /// split: the nodes that moved into the new upper section need their
    /// index entries rewritten in one pass under `chain_lock`.
    pub fn rehome(&self, section: SectionId, from: usize, to: SectionId, shift: usize) {
        let mut inner = self.inner.write();
        for entry in inner.values_mut() {
            if entry.section == section && entry.offset >= from {
                entry.section = to;
                entry.offset -= shift;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
