//! A single block's place in the pool (§3 DATA MODEL — Node).

use parking_lot::Mutex;

use crate::hash::{Block, BlockHash, TotalDifficulty};
use crate::peer::PeerId;

struct NodeInner {
    block: Option<Block>,
    hash_by: Option<PeerId>,
    block_by: Option<PeerId>,
    td: Option<TotalDifficulty>,
}

/// Record of a single block's hash, optionally its body and advertised TD.
/// Mutated under a per-node lock; created when a hash is first learned,
/// destroyed along with its enclosing section.
pub struct Node {
    pub hash: BlockHash,
    inner: Mutex<NodeInner>,
}

impl Node {
    pub fn new(hash: BlockHash, hash_by: PeerId) -> Node {
        Node {
            hash,
            inner: Mutex::new(NodeInner {
                block: None,
                hash_by: Some(hash_by),
                block_by: None,
                td: None,
            }),
        }
    }

    pub fn has_block(&self) -> bool {
        self.inner.lock().block.is_some()
    }

    pub fn block(&self) -> Option<Block> {
        self.inner.lock().block.clone()
    }

    pub fn hash_by(&self) -> Option<PeerId> {
        self.inner.lock().hash_by.clone()
    }

    pub fn block_by(&self) -> Option<PeerId> {
        self.inner.lock().block_by.clone()
    }

    pub fn td(&self) -> Option<TotalDifficulty> {
        self.inner.lock().td
    }

    pub fn set_td(&self, td: TotalDifficulty) {
        self.inner.lock().td = Some(td);
    }

    /// Attach a verified block to this node. Idempotent: a duplicate arrival
    /// for a node that already has a block is a no-op and returns `false` so
    /// callers can tell a fresh attach from a repeat (§8 Idempotence).
    pub fn set_block(&self, block: Block, by: PeerId) -> bool {
        let mut inner = self.inner.lock();
        if inner.block.is_some() {
            return false;
        }
        inner.td = Some(block.total_difficulty);
        inner.block = Some(block);
        inner.block_by = Some(by);
        true
    }
}
