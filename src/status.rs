//! Status counters (§4.8 / §9): a small lock-protected record, kept off the
//! hot path, read by tests/metrics and logged periodically.

use parking_lot::Mutex;

/// Read-only snapshot of cumulative and current-session counters.
#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    /// Ancestor hashes seen across all `add_block_hashes` calls.
    pub hashes_seen: u64,
    /// Blocks currently buffered in the pool (not yet inserted).
    pub blocks_in_pool: u64,
    /// Blocks inserted into the blockchain this session.
    pub blocks_in_chain: u64,
    /// Longest single contiguous insert this session.
    pub longest_chain_inserted: u64,
    /// Number of times `split_section` has fired.
    pub forks_detected: u64,
    /// Peers currently registered, excluding the best peer.
    pub regular_peer_count: u32,
    /// 1 if a best peer is currently elected, 0 otherwise.
    pub best_peer_count: u32,
    /// Peers currently serving out a blacklist suspension.
    pub blacklisted_peer_count: u32,
}

/// Mutable counters behind a single coarse lock, mirroring the host node's
/// `ServerStateInfo` (§4.8): not performance-critical, so a plain mutex is
/// enough.
#[derive(Default)]
pub struct Status {
    inner: Mutex<PoolStats>,
}

impl Status {
    pub fn new() -> Status {
        Status::default()
    }

    pub fn snapshot(&self) -> PoolStats {
        self.inner.lock().clone()
    }

    pub fn add_hashes_seen(&self, n: u64) {
        self.inner.lock().hashes_seen += n;
    }

    pub fn set_blocks_in_pool(&self, n: u64) {
        self.inner.lock().blocks_in_pool = n;
    }

    pub fn record_chain_insert(&self, count: u64) {
        let mut s = self.inner.lock();
        s.blocks_in_chain += count;
        if count > s.longest_chain_inserted {
            s.longest_chain_inserted = count;
        }
    }

    pub fn record_fork(&self) {
        self.inner.lock().forks_detected += 1;
    }

    pub fn set_peer_counts(&self, regular: u32, best: u32, blacklisted: u32) {
        let mut s = self.inner.lock();
        s.regular_peer_count = regular;
        s.best_peer_count = best;
        s.blacklisted_peer_count = blacklisted;
    }
}
