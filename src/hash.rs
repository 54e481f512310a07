//! Hash and total-difficulty primitives shared by every module in the pool.

use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

/// A block hash. The pool treats this as an opaque 32-byte identifier; it
/// never hashes block contents itself, that's the wire codec's job.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Monotone cumulative proof-of-work metric. Used both for peer ranking and
/// for verifying the announced head chain (§ GLOSSARY).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Serialize, Deserialize)]
pub struct TotalDifficulty(pub u128);

impl TotalDifficulty {
    pub fn zero() -> TotalDifficulty {
        TotalDifficulty(0)
    }
}

impl Add for TotalDifficulty {
    type Output = TotalDifficulty;
    fn add(self, rhs: TotalDifficulty) -> TotalDifficulty {
        TotalDifficulty(self.0 + rhs.0)
    }
}

impl fmt::Display for TotalDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The minimal block shape the pool needs to reason about. The real wire
/// format/body is opaque to the pool; it only ever needs the header fields
/// below plus verbatim `data` to hand back to `BlockChain::insert_chain`.
#[derive(Clone, Debug)]
pub struct Block {
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub total_difficulty: TotalDifficulty,
    /// Opaque serialized body, passed through to the blockchain untouched.
    pub data: Vec<u8>,
}
