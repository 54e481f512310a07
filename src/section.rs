//! A contiguous bottom-to-top slice of the pool, owned by one worker task
//! (§3 DATA MODEL — Section, §4.2 Section worker).
//!
//! Sections are identified by a stable, never-reused [`SectionId`] handed
//! out by a [`SectionArena`], rather than by raw pointer or `Rc` — a worker
//! can hold an id across `.await` points and look it up again safely even
//! if the section has since been unlinked (the lookup simply returns
//! `None`), matching the arena-over-pointers guidance in the design notes.

use std::collections::HashMap;
use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::blockpool::PoolShared;
use crate::cancel::{CancelSignal, CancelWait};
use crate::hash::BlockHash;
use crate::node::Node;
use crate::peer::PeerId;
use crate::peers::Peers;

/// Stable identity for a section. Never reused once removed, so a worker
/// that looked one up before an `.await` can look it up again afterwards
/// without risking an ABA collision against an unrelated later section.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct SectionId(u64);

/// Commands sent to a section worker to switch it on or off under a given
/// peer (§4.2 "control signal with peer p (or nil)").
#[derive(Clone, Debug)]
pub enum ControlMsg {
    Activate(PeerId),
    Deactivate,
}

/// Mutable section state, behind the single `section.lock` called out in
/// §5's locking discipline.
struct SectionState {
    /// Bottom-to-top: `nodes[0]` is the bottom, `nodes[len-1]` is the top.
    nodes: Vec<Arc<Node>>,
    parent: Option<SectionId>,
    child: Option<SectionId>,
    peer: Option<PeerId>,
    parent_hash: Option<BlockHash>,
    /// Count of nodes (from the bottom) not yet pushed into the blockchain.
    pool_root_index: usize,
    blocks_requests_complete: bool,
    block_hashes_requests_complete: bool,
    initialised: bool,
    pool_root: bool,
    invalid: bool,
    blocks_requests: u32,
    idle: u32,
    same: u32,
    missing: usize,
    last_missing: usize,
    depth: u32,
    /// Offsets (from the bottom) of nodes still missing a block body, in the
    /// order they should be re-scanned. Stands in for the original's
    /// per-node `missingC` channel: because every access already goes
    /// through `section.lock`, a plain scan under that lock gives the same
    /// round semantics without needing a node-at-a-time channel handoff.
    missing_offsets: Vec<usize>,
}

/// A bottom-to-top contiguous slice of the candidate chain, owned by one
/// worker task.
pub struct Section {
    pub id: SectionId,
    state: Mutex<SectionState>,
    control_tx: mpsc::Sender<ControlMsg>,
    pool_root_tx: mpsc::Sender<PeerId>,
    fork_tx: mpsc::Sender<oneshot::Receiver<()>>,
    /// Fired for an explicit, single-section suicide (no descendants).
    pub suicide: CancelSignal,
    pub created_at: Instant,
}

/// The receiving halves of a section's channels, handed to its worker task
/// on spawn.
pub struct SectionChannels {
    pub control_rx: mpsc::Receiver<ControlMsg>,
    pub pool_root_rx: mpsc::Receiver<PeerId>,
    pub fork_rx: mpsc::Receiver<oneshot::Receiver<()>>,
}

impl Section {
    /// Build a new, non-empty section from `nodes` (bottom-to-top).
    pub fn new(id: SectionId, nodes: Vec<Arc<Node>>) -> (Arc<Section>, SectionChannels) {
        assert!(!nodes.is_empty(), "a section must own at least one node");
        let len = nodes.len();
        let (control_tx, control_rx) = mpsc::channel(16);
        let (pool_root_tx, pool_root_rx) = mpsc::channel(4);
        let (fork_tx, fork_rx) = mpsc::channel(4);
        let section = Arc::new(Section {
            id,
            state: Mutex::new(SectionState {
                nodes,
                parent: None,
                child: None,
                peer: None,
                parent_hash: None,
                pool_root_index: len,
                blocks_requests_complete: false,
                block_hashes_requests_complete: false,
                initialised: false,
                pool_root: false,
                invalid: false,
                blocks_requests: 0,
                idle: 0,
                same: 0,
                missing: 0,
                last_missing: 0,
                depth: 0,
                missing_offsets: Vec::new(),
            }),
            control_tx,
            pool_root_tx,
            fork_tx,
            suicide: CancelSignal::new(),
            created_at: Instant::now(),
        });
        (
            section,
            SectionChannels {
                control_rx,
                pool_root_rx,
                fork_rx,
            },
        )
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bottom_hash(&self) -> BlockHash {
        self.state.lock().nodes[0].hash
    }

    pub fn top_hash(&self) -> BlockHash {
        let state = self.state.lock();
        state.nodes[state.nodes.len() - 1].hash
    }

    pub fn bottom(&self) -> Arc<Node> {
        self.state.lock().nodes[0].clone()
    }

    pub fn top(&self) -> Arc<Node> {
        let state = self.state.lock();
        state.nodes[state.nodes.len() - 1].clone()
    }

    pub fn node_at(&self, offset: usize) -> Option<Arc<Node>> {
        self.state.lock().nodes.get(offset).cloned()
    }

    pub fn nodes_snapshot(&self) -> Vec<Arc<Node>> {
        self.state.lock().nodes.clone()
    }

    pub fn parent(&self) -> Option<SectionId> {
        self.state.lock().parent
    }

    pub fn set_parent(&self, parent: Option<SectionId>) {
        self.state.lock().parent = parent;
    }

    pub fn child(&self) -> Option<SectionId> {
        self.state.lock().child
    }

    pub fn set_child(&self, child: Option<SectionId>) {
        self.state.lock().child = child;
    }

    pub fn peer(&self) -> Option<PeerId> {
        self.state.lock().peer.clone()
    }

    pub fn activate(&self, peer: PeerId) {
        self.state.lock().peer = Some(peer);
    }

    pub fn deactivate(&self) {
        self.state.lock().peer = None;
    }

    pub fn is_pool_root(&self) -> bool {
        self.state.lock().pool_root
    }

    pub fn is_invalid(&self) -> bool {
        self.state.lock().invalid
    }

    pub fn mark_invalid(&self) {
        self.state.lock().invalid = true;
    }

    pub fn mark_pool_root(&self) {
        let mut state = self.state.lock();
        state.pool_root = true;
        state.block_hashes_requests_complete = true;
    }

    /// Record that this section's bottom is now linked directly to an
    /// existing parent section in the pool, so the hash-request timer
    /// stops: `pool_root` status will arrive later via that parent's own
    /// completion, propagated through `pool_root_tx` (§4.2, §4.3).
    pub fn mark_block_hashes_complete(&self) {
        self.state.lock().block_hashes_requests_complete = true;
    }

    pub fn parent_hash(&self) -> Option<BlockHash> {
        self.state.lock().parent_hash
    }

    /// Capture the bottom block's claimed parent hash, if not already known.
    /// Returns `true` the first time it's set (triggers a hash request).
    pub fn set_parent_hash_once(&self, hash: BlockHash) -> bool {
        let mut state = self.state.lock();
        if state.parent_hash.is_some() {
            false
        } else {
            state.parent_hash = Some(hash);
            true
        }
    }

    pub fn blocks_requests_complete(&self) -> bool {
        self.state.lock().blocks_requests_complete
    }

    pub fn block_hashes_requests_complete(&self) -> bool {
        self.state.lock().block_hashes_requests_complete
    }

    pub fn pool_root_index(&self) -> usize {
        self.state.lock().pool_root_index
    }

    /// Pull `count` nodes off the bottom once they've been inserted into the
    /// blockchain, decreasing `pool_root_index`.
    pub fn consume_bottom(&self, count: usize) {
        let mut state = self.state.lock();
        state.pool_root_index = state.pool_root_index.saturating_sub(count);
    }

    pub fn control_sender(&self) -> mpsc::Sender<ControlMsg> {
        self.control_tx.clone()
    }

    pub fn pool_root_sender(&self) -> mpsc::Sender<PeerId> {
        self.pool_root_tx.clone()
    }

    pub fn fork_sender(&self) -> mpsc::Sender<oneshot::Receiver<()>> {
        self.fork_tx.clone()
    }

    /// Rescan for nodes missing a block, refreshing `missing`, `last_missing`
    /// and `depth`; called once on first activation and again after a split
    /// forces re-initialisation.
    fn recompute_missing(&self) {
        let mut state = self.state.lock();
        let len = state.nodes.len();
        let mut offsets = Vec::new();
        for (offset, node) in state.nodes.iter().enumerate() {
            if !node.has_block() {
                offsets.push(offset);
            }
        }
        state.missing = offsets.len();
        state.last_missing = offsets.len();
        state.depth = len as u32;
        state.missing_offsets = offsets;
        state.initialised = true;
        state.same = 0;
    }

    /// Scan the current missing-node list, flushing request batches of up to
    /// `batch_size` hashes at a time via `flush`. Nodes that are still
    /// missing after the scan are carried over to the next round. Batch
    /// buffers are drawn from and returned to `peers`'s reusable slice pool
    /// rather than freshly allocated (§5).
    fn scan_missing(&self, batch_size: usize, peers: &Peers, mut flush: impl FnMut(Vec<BlockHash>)) -> RoundResult {
        let mut state = self.state.lock();
        let offsets = std::mem::take(&mut state.missing_offsets);
        let mut still_missing = Vec::new();
        let mut batch = peers.take_slice();
        let mut completed_root_step = false;

        for offset in offsets {
            let node = state.nodes[offset].clone();
            if node.has_block() {
                if state.pool_root && offset == state.pool_root_index {
                    completed_root_step = true;
                }
            } else {
                batch.push(node.hash);
                still_missing.push(offset);
                if batch.len() >= batch_size {
                    flush(std::mem::replace(&mut batch, peers.take_slice()));
                }
            }
        }
        if batch.is_empty() {
            peers.give_back_slice(batch);
        } else {
            flush(batch);
        }

        let prev_missing = state.missing;
        state.missing = still_missing.len();
        let same_as_before = state.missing == state.last_missing;
        if same_as_before {
            state.same += 1;
        } else {
            state.same = 0;
        }
        // Only treat the section as idle once two consecutive rounds have
        // found the same missing count, per §4.2; a single unlucky round
        // (e.g. a batch still in flight) shouldn't count against it.
        let should_bump_idle = state.same >= 2;
        state.last_missing = prev_missing;
        state.missing_offsets = still_missing;

        RoundResult {
            missing: state.missing,
            should_bump_idle,
            completed_root_step,
        }
    }

    pub fn record_request_round(&self) -> u32 {
        let mut state = self.state.lock();
        state.blocks_requests += 1;
        state.blocks_requests
    }

    pub fn blocks_requests_count(&self) -> usize {
        self.state.lock().blocks_requests as usize
    }

    pub fn mark_blocks_complete(&self) {
        self.state.lock().blocks_requests_complete = true;
    }

    pub fn bump_idle(&self, max_idle: u32) -> bool {
        let mut state = self.state.lock();
        state.idle += 1;
        state.idle >= max_idle
    }

    pub fn reset_idle(&self) {
        self.state.lock().idle = 0;
    }

    /// Split this section at `offset` (a non-bottom node): the nodes
    /// `[offset, len)` move to a newly created upper section whose child is
    /// this section's previous child; this section keeps `[0, offset)`.
    /// Returns the nodes moved out, for the caller to hand to
    /// [`Section::new`].
    pub fn split_off(&self, offset: usize) -> (Vec<Arc<Node>>, usize) {
        let mut state = self.state.lock();
        assert!(offset > 0 && offset < state.nodes.len());
        let upper = state.nodes.split_off(offset);
        let shift = state.pool_root_index.min(offset);
        state.pool_root_index = state.pool_root_index.saturating_sub(offset.min(state.pool_root_index));
        (upper, shift)
    }
}

struct RoundResult {
    missing: usize,
    should_bump_idle: bool,
    completed_root_step: bool,
}

/// Owns every live section, keyed by a monotonically increasing id that is
/// never reused, so lookups after a removal simply miss rather than risk
/// aliasing a different, later section.
pub struct SectionArena {
    next_id: AtomicU64,
    sections: RwLock<HashMap<SectionId, Arc<Section>>>,
}

impl SectionArena {
    pub fn new() -> SectionArena {
        SectionArena {
            next_id: AtomicU64::new(1),
            sections: RwLock::new(HashMap::new()),
        }
    }

    pub fn alloc_id(&self) -> SectionId {
        SectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, section: Arc<Section>) {
        self.sections.write().insert(section.id, section);
    }

    pub fn get(&self, id: SectionId) -> Option<Arc<Section>> {
        self.sections.read().get(&id).cloned()
    }

    pub fn remove(&self, id: SectionId) -> Option<Arc<Section>> {
        self.sections.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SectionArena {
    fn default() -> SectionArena {
        SectionArena::new()
    }
}

async fn wait_cancel(signal: &mut Option<CancelWait>) {
    match signal {
        Some(s) => s.fired().await,
        None => pending().await,
    }
}

/// Drives one section for its whole lifetime: requests, merges arriving
/// blocks, pushes completed prefixes into the blockchain, and tears itself
/// down on timeout, idleness or invalidity (§4.2).
pub async fn run_section_worker(pool: Arc<PoolShared>, id: SectionId, mut channels: SectionChannels) {
    let section = match pool.arena.get(id) {
        Some(s) => s,
        None => return,
    };

    let mut quit = pool.quit.subscribe();
    let mut suicide_wait = section.suicide.subscribe();
    let mut active_peer: Option<PeerId> = None;
    let mut active_switch: Option<CancelWait> = None;
    let mut active_idle: Option<CancelWait> = None;

    section.recompute_missing();

    let blocks_deadline = tokio::time::sleep(pool.config.blocks_timeout());
    tokio::pin!(blocks_deadline);

    let block_timer = tokio::time::sleep(pool.config.blocks_request_interval());
    tokio::pin!(block_timer);
    let mut block_timer_armed = true;

    let hash_timer = tokio::time::sleep(Instant::now().elapsed());
    tokio::pin!(hash_timer);
    let mut hash_timer_armed = !section.is_pool_root();
    if hash_timer_armed {
        hash_timer
            .as_mut()
            .reset(tokio::time::Instant::now() + pool.config.block_hashes_request_interval());
    }

    trace!("section {:?} worker started with {} nodes", id, section.len());

    loop {
        tokio::select! {
            _ = quit.fired() => {
                debug!("section {:?} worker exiting on global quit", id);
                break;
            }
            _ = suicide_wait.fired() => {
                debug!("section {:?} suicide (single)", id);
                pool.remove_section_only(id);
                break;
            }
            () = &mut blocks_deadline => {
                warn!("section {:?} exceeded blocks_timeout, demolishing chain", id);
                pool.remove_chain(id).await;
                break;
            }
            _ = wait_cancel(&mut active_switch) => {
                active_switch = None;
            }
            _ = wait_cancel(&mut active_idle) => {
                section.deactivate();
                active_peer = None;
                active_switch = None;
                active_idle = None;
                block_timer_armed = false;
                hash_timer_armed = false;
            }
            Some(msg) = channels.control_rx.recv() => {
                match msg {
                    ControlMsg::Activate(p) => {
                        section.activate(p.clone());
                        active_switch = pool.peers.switch_wait(&p);
                        active_idle = pool.peers.idle_wait(&p);
                        active_peer = Some(p);
                        if !section.blocks_requests_complete() {
                            block_timer_armed = true;
                            block_timer.as_mut().reset(tokio::time::Instant::now());
                        }
                        if !section.is_pool_root() && !section.block_hashes_requests_complete() {
                            hash_timer_armed = true;
                            hash_timer.as_mut().reset(tokio::time::Instant::now());
                        }
                    }
                    ControlMsg::Deactivate => {
                        section.deactivate();
                        active_peer = None;
                        active_switch = None;
                        active_idle = None;
                    }
                }
            }
            Some(p) = channels.pool_root_rx.recv() => {
                section.mark_pool_root();
                hash_timer_armed = false;
                section.activate(p.clone());
                active_peer = Some(p);
                pool.try_insert_section(id).await;
            }
            Some(waiter) = channels.fork_rx.recv() => {
                let _ = waiter.await;
                section.recompute_missing();
            }
            () = &mut block_timer, if block_timer_armed => {
                let peer = active_peer.clone();
                let result = pool.run_block_request_round(&section, peer).await;
                if result.missing == 0 {
                    section.mark_blocks_complete();
                    block_timer_armed = false;
                } else {
                    section.record_request_round();
                    if result.should_bump_idle {
                        if section.bump_idle(pool.config.blocks_request_max_idle_rounds) {
                            warn!("section {:?} idle too long, demolishing chain", id);
                            pool.remove_chain(id).await;
                            break;
                        }
                    } else {
                        section.reset_idle();
                    }
                    block_timer.as_mut().reset(tokio::time::Instant::now() + pool.config.blocks_request_interval());
                }
                // `completed_root_step` covers the common case (already
                // pool_root before this round). `drive_hash_request` may
                // also have just flipped `pool_root` *during* this same
                // round (the bottom's parent resolved the instant its
                // block arrived) — catch that coincident case too.
                if result.completed_root_step || (result.missing == 0 && section.is_pool_root()) {
                    pool.try_insert_section(id).await;
                }
            }
            () = &mut hash_timer, if hash_timer_armed => {
                pool.drive_hash_request(&section, active_peer.clone()).await;
                hash_timer.as_mut().reset(tokio::time::Instant::now() + pool.config.block_hashes_request_interval());
            }
        }
    }
}

pub(crate) struct BlockRoundOutcome {
    pub missing: usize,
    pub should_bump_idle: bool,
    pub completed_root_step: bool,
}

impl Section {
    pub(crate) fn run_round(
        &self,
        batch_size: usize,
        peers: &Peers,
        flush: impl FnMut(Vec<BlockHash>),
    ) -> BlockRoundOutcome {
        let r = self.scan_missing(batch_size, peers, flush);
        BlockRoundOutcome {
            missing: r.missing,
            should_bump_idle: r.should_bump_idle,
            completed_root_step: r.completed_root_step,
        }
    }
}
