//! A bounded reusable pool of hash-slices (§5): amortises allocation for the
//! `BlockBatchSize`-sized request batches issued every block-request round.

use crossbeam_queue::ArrayQueue;

use crate::hash::BlockHash;

pub struct SlicePool {
    capacity_hint: usize,
    free: ArrayQueue<Vec<BlockHash>>,
}

impl SlicePool {
    pub fn new(pool_capacity: usize, slice_capacity: usize) -> SlicePool {
        SlicePool {
            capacity_hint: slice_capacity,
            free: ArrayQueue::new(pool_capacity.max(1)),
        }
    }

    /// Take a cleared, pre-sized buffer from the pool, or allocate a fresh
    /// one when the pool is empty.
    pub fn take(&self) -> Vec<BlockHash> {
        match self.free.pop() {
            Some(mut v) => {
                v.clear();
                v
            }
            None => Vec::with_capacity(self.capacity_hint),
        }
    }

    /// Return a buffer for reuse. Silently dropped if the pool is at
    /// capacity — this is an optimisation, not a correctness requirement.
    pub fn give_back(&self, buf: Vec<BlockHash>) {
        let _ = self.free.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_buffers() {
        let pool = SlicePool::new(2, 64);
        let mut buf = pool.take();
        buf.push(BlockHash::ZERO);
        pool.give_back(buf);
        let buf2 = pool.take();
        assert!(buf2.is_empty());
        assert!(buf2.capacity() >= 1);
    }

    #[test]
    fn drops_excess_beyond_capacity() {
        let pool = SlicePool::new(1, 8);
        pool.give_back(Vec::new());
        pool.give_back(Vec::new());
        assert!(pool.free.pop().is_some());
        assert!(pool.free.pop().is_none());
    }
}
