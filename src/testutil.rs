//! In-memory fixtures for driving the whole pool without a real network
//! (§4.9), in the spirit of the teacher's hand-rolled `chain_test_helper`
//! fixture chain rather than a mocking framework.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind};
use crate::hash::{Block, BlockHash, TotalDifficulty};
use crate::traits::{BlockChain, PowVerifier};

/// An in-memory chain: a plain `Vec<Block>` behind a lock, genesis-seeded.
pub struct FixtureChain {
    blocks: Mutex<Vec<Block>>,
}

impl FixtureChain {
    pub fn new(genesis: Block) -> Arc<FixtureChain> {
        Arc::new(FixtureChain {
            blocks: Mutex::new(vec![genesis]),
        })
    }

    pub fn head_td(&self) -> TotalDifficulty {
        self.blocks.lock().last().map(|b| b.total_difficulty).unwrap_or_else(TotalDifficulty::zero)
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn snapshot(&self) -> Vec<Block> {
        self.blocks.lock().clone()
    }
}

impl BlockChain for FixtureChain {
    fn has_block(&self, hash: &BlockHash) -> bool {
        self.blocks.lock().iter().any(|b| &b.hash == hash)
    }

    fn insert_chain(&self, new_blocks: Vec<Block>) -> Result<TotalDifficulty, Error> {
        let mut blocks = self.blocks.lock();
        let mut expected_parent = blocks.last().map(|b| b.hash);
        for block in &new_blocks {
            if let Some(parent) = expected_parent {
                if block.parent_hash != parent {
                    return Err(ErrorKind::InvalidBlock(format!(
                        "block {:?} does not attach to chain head {:?}",
                        block.hash, parent
                    ))
                    .into());
                }
            }
            expected_parent = Some(block.hash);
        }
        let td = new_blocks.last().map(|b| b.total_difficulty);
        blocks.extend(new_blocks);
        Ok(td.unwrap_or_else(|| blocks.last().unwrap().total_difficulty))
    }
}

/// Always-accepting PoW verifier, for tests that don't care about PoW.
pub struct AcceptAllPow;

impl PowVerifier for AcceptAllPow {
    fn verify(&self, _block: &Block) -> bool {
        true
    }
}

/// Recording `PeerRequestor`: pushes every call onto a channel the test
/// drives, instead of touching a real wire connection.
#[derive(Clone, Debug)]
pub enum RecordedRequest {
    Hashes(BlockHash),
    Blocks(Vec<BlockHash>),
    Error(String),
}

pub struct RecordingRequestor {
    tx: mpsc::UnboundedSender<RecordedRequest>,
}

impl RecordingRequestor {
    pub fn new() -> (Arc<RecordingRequestor>, mpsc::UnboundedReceiver<RecordedRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingRequestor { tx }), rx)
    }
}

impl crate::traits::PeerRequestor for RecordingRequestor {
    fn request_block_hashes(&self, hash: BlockHash) -> Result<(), Error> {
        let _ = self.tx.send(RecordedRequest::Hashes(hash));
        Ok(())
    }

    fn request_blocks(&self, hashes: Vec<BlockHash>) -> Result<(), Error> {
        let _ = self.tx.send(RecordedRequest::Blocks(hashes));
        Ok(())
    }

    fn peer_error(&self, err: &Error) {
        let _ = self.tx.send(RecordedRequest::Error(err.to_string()));
    }
}

/// Builds a block hash from a small integer, for readable test fixtures.
pub fn hash(n: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[31] = n;
    BlockHash(bytes)
}

pub fn block(hash: BlockHash, parent: BlockHash, td: u128, data: &[u8]) -> Block {
    Block {
        hash,
        parent_hash: parent,
        total_difficulty: TotalDifficulty(td),
        data: data.to_vec(),
    }
}
