//! The five abstract interfaces the pool uses to talk to the rest of the
//! node (§6). Everything outside these traits — the wire codec, peer
//! discovery, block execution/persistence, PoW solving, event bus wiring —
//! is out of scope and lives on the other side of them.

use crate::error::Error;
use crate::hash::{Block, BlockHash, TotalDifficulty};

/// Query/insert surface onto the host node's blockchain. `insert_chain` is
/// the only path into the persistent chain.
pub trait BlockChain: Send + Sync {
    /// Whether `hash` is already part of the persisted chain.
    fn has_block(&self, hash: &BlockHash) -> bool;

    /// Insert a contiguous, bottom-to-top ordered run of blocks. On error the
    /// whole section is marked invalid and removed along with its descendants.
    /// On success returns the total difficulty of the new chain head, used
    /// for the TD-integrity check in `add_section_to_blockchain`.
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<TotalDifficulty, Error>;
}

/// Proof-of-work verification, called at most once per `(node, block)` pair.
pub trait PowVerifier: Send + Sync {
    fn verify(&self, block: &Block) -> bool;
}

/// Per-peer request callbacks, registered on `add_peer`. These are expected
/// to be cheap to call (they typically just enqueue a wire message) but may
/// take locks of their own, hence the "dispatch from your own task" rule in
/// §9 — never call these while holding `peers.lock` or `peer.lock`.
pub trait PeerRequestor: Send + Sync {
    /// Ask for up to `block_hashes_batch_size` ancestor hashes starting at
    /// `hash`, newest to oldest.
    fn request_block_hashes(&self, hash: BlockHash) -> Result<(), Error>;

    /// Ask for the block bodies corresponding to the given hashes.
    fn request_blocks(&self, hashes: Vec<BlockHash>) -> Result<(), Error>;

    /// Notify the wire layer of an error on this peer. `err.is_fatal()` true
    /// means the wire layer should disconnect.
    fn peer_error(&self, err: &Error);
}

/// A new chain head, as broadcast by the blockchain's event bus.
#[derive(Clone, Debug)]
pub struct ChainHeadEvent {
    pub hash: BlockHash,
    pub total_difficulty: TotalDifficulty,
}
