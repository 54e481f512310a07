//! The top-level coordinator (§4.1, §4.3, §4.4, §4.6): owns the pool index,
//! the section arena, the peer registry, and the public entry points that
//! the wire layer calls into.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::time::Instant as TokioInstant;

use crate::cancel::CancelSignal;
use crate::config::BlockPoolConfig;
use crate::error::{Error, ErrorKind};
use crate::hash::{Block, BlockHash, TotalDifficulty};
use crate::node::Node;
use crate::peer::{run_peer_driver, Peer, PeerId};
use crate::peers::{dispatch_peer_error, log_promotion, run_fanout_worker, Peers};
use crate::pool_index::{PoolEntry, PoolIndex};
use crate::section::{run_section_worker, BlockRoundOutcome, Section, SectionArena, SectionId};
use crate::status::{PoolStats, Status};
use crate::traits::{BlockChain, ChainHeadEvent, PeerRequestor, PowVerifier};

/// Outcome of resolving a peer's head block's parent (§4.5 "waiting for hash batch").
pub(crate) enum HeadResolution {
    /// The head block was a singleton extension of the chain; already inserted.
    Inserted,
    /// A head section now exists (new or pre-existing ancestor chain).
    Attached(SectionId),
    /// Neither chain nor pool knows the parent; caller must request hashes.
    NeedHashes,
}

/// Chain-linkage bookkeeping plus the domain objects every subsystem needs,
/// bundled so section workers and the peer driver can share one `Arc`.
pub struct PoolShared {
    pub config: BlockPoolConfig,
    pub chain: Arc<dyn BlockChain>,
    pub pow: Arc<dyn PowVerifier>,
    pub peers: Arc<Peers>,
    pub index: PoolIndex,
    pub arena: SectionArena,
    pub stats: Status,
    pub quit: CancelSignal,
    own_td: Mutex<TotalDifficulty>,
    /// `chain_lock` of §5: protects section parent/child linkage and splits.
    chain_lock: RwLock<()>,
    outstanding: AtomicUsize,
    idle_notify: Notify,
    /// When we first noticed we'd caught up with the best peer's advertised
    /// td; cleared as soon as that stops being true. Drives `IdleTooLong`.
    idle_since: Mutex<Option<std::time::Instant>>,
}

impl PoolShared {
    fn bump_outstanding(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn drop_outstanding(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle_notify.notify_waiters();
        }
    }

    /// Spawn `fut` tracked by the outstanding-task counter so `BlockPool::wait`
    /// can block until every spawned task has wound down (§5).
    fn spawn_tracked(self: &Arc<Self>, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        self.bump_outstanding();
        let shared = self.clone();
        tokio::spawn(async move {
            fut.await;
            shared.drop_outstanding();
        });
    }

    pub fn own_td(&self) -> TotalDifficulty {
        *self.own_td.lock()
    }

    fn node_at(&self, hash: &BlockHash) -> Option<Arc<Node>> {
        let entry = self.index.get(hash)?;
        let section = self.arena.get(entry.section)?;
        section.node_at(entry.offset)
    }

    pub(crate) fn index_block_if_present(&self, hash: &BlockHash) -> Option<Block> {
        self.node_at(hash).and_then(|n| n.block())
    }

    pub(crate) async fn flag_peer(self: &Arc<Self>, peer: &Arc<Peer>, kind: ErrorKind) {
        let fatal = kind.is_fatal();
        let was_best = self.peers.best_id().as_ref() == Some(&peer.id);
        dispatch_peer_error(&self.peers, peer, Error::from(kind));
        if fatal && was_best {
            self.re_elect_best().await;
        }
    }

    /// After the best peer is removed, promote whoever now has the highest
    /// advertised td among the remainder, or clear `best` if none remain
    /// (§4.1 `remove_peer`, §4.6).
    async fn re_elect_best(self: &Arc<Self>) {
        match self.peers.highest_td() {
            Some(next) => self.promote(next).await,
            None => self.peers.set_best(None),
        }
    }

    /// §7 / §4.6: once we've caught up with the best peer's advertised td,
    /// if it stays silent (never advertises a higher td) past
    /// `idle_best_peer_timeout`, flag it `IdleTooLong`. Called periodically
    /// off the status-log tick rather than its own timer, since that's
    /// already the cadence at which `own_td` vs. the best peer's td is worth
    /// re-checking.
    async fn check_idle_best_peer(self: &Arc<Self>) {
        let Some(best) = self.peers.best() else {
            *self.idle_since.lock() = None;
            return;
        };
        if self.own_td() < best.td() {
            *self.idle_since.lock() = None;
            return;
        }
        let since = *self.idle_since.lock().get_or_insert_with(std::time::Instant::now);
        if since.elapsed() >= self.config.idle_best_peer_timeout() {
            *self.idle_since.lock() = None;
            warn!("best peer {:?} idle past timeout while caught up", best.id);
            self.flag_peer(&best, ErrorKind::IdleTooLong).await;
        }
    }

    pub(crate) async fn insert_singleton(self: &Arc<Self>, block: Block, by: PeerId) {
        let hash = block.hash;
        let td = block.total_difficulty;
        match self.chain.insert_chain(vec![block]) {
            Ok(new_td) => {
                self.stats.record_chain_insert(1);
                debug!("inserted singleton head block {:?} from {:?}, td now {}", hash, by, new_td);
                *self.own_td.lock() = new_td;
                let _ = td;
            }
            Err(e) => {
                warn!("insert_chain rejected singleton head block {:?}: {}", hash, e);
            }
        }
    }

    /// §4.5 "waiting for hash batch": resolve where `block`'s parent lives.
    pub(crate) async fn attach_or_create_head_section(
        self: &Arc<Self>,
        block: &Block,
        peer: &Arc<Peer>,
    ) -> HeadResolution {
        if self.chain.has_block(&block.parent_hash) {
            self.insert_singleton(block.clone(), peer.id.clone()).await;
            return HeadResolution::Inserted;
        }

        if let Some(entry) = self.index.get(&block.parent_hash) {
            let _chain_guard = self.chain_lock.write();
            let node = Arc::new(Node::new(block.hash, peer.id.clone()));
            node.set_block(block.clone(), peer.id.clone());
            let id = self.new_section(vec![node], Some(entry.section), None);
            return HeadResolution::Attached(id);
        }

        HeadResolution::NeedHashes
    }

    /// Allocate a fresh section, link it to `parent`/`child` under
    /// `chain_lock`, index its nodes and spawn its worker.
    fn new_section(
        self: &Arc<Self>,
        nodes: Vec<Arc<Node>>,
        parent: Option<SectionId>,
        child: Option<SectionId>,
    ) -> SectionId {
        let id = self.arena.alloc_id();
        for (offset, node) in nodes.iter().enumerate() {
            self.index.insert(node.hash, PoolEntry { section: id, offset });
        }
        let (section, channels) = Section::new(id, nodes);
        section.set_parent(parent);
        section.set_child(child);
        if let Some(p) = parent {
            if let Some(parent_section) = self.arena.get(p) {
                parent_section.set_child(Some(id));
            }
        }
        if let Some(c) = child {
            if let Some(child_section) = self.arena.get(c) {
                child_section.set_parent(Some(id));
            }
        }
        self.arena.insert(section);

        let shared = self.clone();
        self.spawn_tracked(async move {
            run_section_worker(shared, id, channels).await;
        });
        id
    }

    /// Split `parent` at `offset` (a non-bottom node): the upper half moves
    /// into a newly allocated section (§4.3). Pauses the old worker over
    /// `fork_tx` before mutating, per the design note on half-mutated state.
    pub(crate) async fn split_section(self: &Arc<Self>, parent_id: SectionId, offset: usize) -> Option<SectionId> {
        let parent = self.arena.get(parent_id)?;
        let (waiter_tx, waiter_rx) = tokio::sync::oneshot::channel();
        let _ = parent.fork_sender().send(waiter_rx).await;

        let _chain_guard = self.chain_lock.write();
        let (upper_nodes, shift) = parent.split_off(offset);
        let child = parent.child();
        let new_id = self.arena.alloc_id();

        self.index.rehome(parent_id, offset, new_id, shift.max(offset));
        for (i, node) in upper_nodes.iter().enumerate() {
            self.index.insert(node.hash, PoolEntry { section: new_id, offset: i });
        }

        let (section, channels) = Section::new(new_id, upper_nodes);
        section.set_parent(Some(parent_id));
        section.set_child(child);
        if let Some(c) = child {
            if let Some(child_section) = self.arena.get(c) {
                child_section.set_parent(Some(new_id));
            }
        }
        parent.set_child(Some(new_id));
        self.arena.insert(section);
        self.stats.record_fork();

        drop(waiter_tx);

        let shared = self.clone();
        self.spawn_tracked(async move {
            run_section_worker(shared, new_id, channels).await;
        });
        Some(new_id)
    }

    /// Re-activate `start` and every ancestor section under `peer`, stopping
    /// (not including) `stop_before`, in bottom-up order (§4.4).
    pub(crate) async fn activate_chain(&self, start: SectionId, peer: PeerId, stop_before: Option<SectionId>) {
        let mut chain = Vec::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            if Some(id) == stop_before {
                break;
            }
            let Some(section) = self.arena.get(id) else { break };
            chain.push(section.clone());
            cur = section.parent();
        }
        for section in chain.into_iter().rev() {
            let _ = section
                .control_sender()
                .send(crate::section::ControlMsg::Activate(peer.clone()))
                .await;
            if let Some(p) = self.peers.get(&peer) {
                p.record_activated_section(section.top_hash());
            }
        }
    }

    /// A completed section (`missing == 0`, `pool_root`) is pushed into the
    /// blockchain; on success its child (if any) is told to become pool-root
    /// in turn, recursively walking forward (§4.2 node 2, §5 ordering).
    pub(crate) async fn try_insert_section(self: &Arc<Self>, id: SectionId) {
        let Some(section) = self.arena.get(id) else { return };
        if !section.is_pool_root() || !section.blocks_requests_complete() {
            return;
        }

        let nodes = section.nodes_snapshot();
        let mut blocks = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match node.block() {
                Some(b) => blocks.push(b),
                None => return,
            }
        }
        let claimed_td = nodes.last().and_then(|n| n.td());

        match self.chain.insert_chain(blocks) {
            Ok(new_td) => {
                self.stats.record_chain_insert(nodes.len() as u64);
                *self.own_td.lock() = new_td;
                if let Some(claimed) = claimed_td {
                    if claimed != new_td {
                        self.penalise_td_offender(&nodes).await;
                    }
                }
                for node in &nodes {
                    self.index.remove(&node.hash);
                }
                let child = section.child();
                self.arena.remove(id);
                if let Some(child_id) = child {
                    if let Some(child_section) = self.arena.get(child_id) {
                        child_section.set_parent(None);
                        let peer = section.peer();
                        if let Some(p) = peer {
                            let _ = child_section.pool_root_sender().send(p).await;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("insert_chain rejected section {:?}: {}", id, e);
                section.mark_invalid();
                self.remove_chain(id).await;
            }
        }
    }

    async fn penalise_td_offender(self: &Arc<Self>, nodes: &[Arc<Node>]) {
        let bottom = &nodes[0];
        let offender_id = match self.config.td_mismatch_penalises {
            crate::error::TdOffender::Announcer => bottom.hash_by(),
            crate::error::TdOffender::Provider => bottom.block_by(),
        };
        if let Some(id) = offender_id {
            if let Some(peer) = self.peers.get(&id) {
                self.flag_peer(&peer, ErrorKind::IncorrectTD).await;
            }
        }
    }

    /// Remove `id` and every descendant reached through `child` pointers
    /// (§4.2 suicide-timer / invalid-block path).
    pub(crate) async fn remove_chain(self: &Arc<Self>, id: SectionId) {
        let mut cur = Some(id);
        let mut to_remove = Vec::new();
        while let Some(cid) = cur {
            let Some(section) = self.arena.get(cid) else { break };
            cur = section.child();
            to_remove.push(section);
        }
        for section in to_remove {
            for node in section.nodes_snapshot() {
                self.index.remove(&node.hash);
            }
            self.arena.remove(section.id);
        }
    }

    /// Remove a single section only, leaving its child orphaned with no
    /// parent (§4.2 explicit suicide).
    pub(crate) fn remove_section_only(&self, id: SectionId) {
        let Some(section) = self.arena.get(id) else { return };
        for node in section.nodes_snapshot() {
            self.index.remove(&node.hash);
        }
        if let Some(child) = section.child() {
            if let Some(child_section) = self.arena.get(child) {
                child_section.set_parent(None);
            }
        }
        if let Some(parent) = section.parent() {
            if let Some(parent_section) = self.arena.get(parent) {
                parent_section.set_child(None);
            }
        }
        self.arena.remove(id);
    }

    /// One block-request round for `section` (§4.2 node-iteration cycle):
    /// scan missing nodes, flush batches through the peer fan-out, and fold
    /// in the "bottom arrived, capture parent_hash" and "pool-root completed"
    /// side effects.
    pub(crate) async fn run_block_request_round(
        self: &Arc<Self>,
        section: &Arc<Section>,
        peer: Option<PeerId>,
    ) -> BlockRoundOutcome {
        let batch_size = self.config.block_batch_size as usize;
        let mut batches: Vec<Vec<BlockHash>> = Vec::new();
        let outcome = section.run_round(batch_size, &self.peers, |batch| batches.push(batch));

        let attempts = section.blocks_requests_count();
        for batch in batches {
            self.peers.request_blocks(batch, attempts).await;
        }

        if section.bottom().has_block() && !section.is_pool_root() {
            if let Some(block) = section.bottom().block() {
                if section.set_parent_hash_once(block.parent_hash) {
                    self.drive_hash_request(section, peer).await;
                }
            }
        }

        outcome
    }

    /// Hash-request timer fire (§4.2): try to link this section directly to
    /// an existing parent in the pool, else ask the peer for more ancestors.
    ///
    /// Until the bottom node's own block body has arrived, `parent_hash` is
    /// still unknown and the only option is to ask the peer for more
    /// ancestor hashes toward `bottom_hash`. Once `parent_hash` is known
    /// (captured in `run_block_request_round`), that's the hash to check
    /// against the chain and pool — the bottom node's own hash is by
    /// construction never already in either.
    pub(crate) async fn drive_hash_request(self: &Arc<Self>, section: &Arc<Section>, peer: Option<PeerId>) {
        if section.is_pool_root() || section.block_hashes_requests_complete() {
            return;
        }
        let bottom_hash = section.bottom_hash();
        if let Some(parent_hash) = section.parent_hash() {
            if self.chain.has_block(&parent_hash) {
                section.mark_pool_root();
                return;
            }
            if let Some(entry) = self.index.get(&parent_hash) {
                let linked = {
                    let _chain_guard = self.chain_lock.write();
                    if let Some(parent_section) = self.arena.get(entry.section) {
                        parent_section.set_child(Some(section.id));
                        section.set_parent(Some(entry.section));
                        true
                    } else {
                        false
                    }
                };
                if linked {
                    section.mark_block_hashes_complete();
                    if let Some(p) = peer.as_ref().and_then(|id| self.peers.get(id)) {
                        self.activate_chain(entry.section, p.id.clone(), None).await;
                    }
                }
                return;
            }
        }
        let Some(peer_id) = peer else { return };
        let Some(p) = self.peers.get(&peer_id) else { return };
        if let Err(e) = p.requestor.request_block_hashes(bottom_hash) {
            warn!("peer {:?}: request_block_hashes failed: {}", peer_id, e);
        }
    }

    /// §4.1 `add_peer`. Re-calling for an already-known peer id updates its
    /// advertised td and head hash in place rather than replacing it, so its
    /// `sections`/`head_section` bookkeeping and (if any) running driver
    /// survive the update.
    pub async fn add_peer(
        self: &Arc<Self>,
        td: TotalDifficulty,
        head_hash: BlockHash,
        id: PeerId,
        requestor: Arc<dyn PeerRequestor>,
    ) -> (Option<PeerId>, bool) {
        if self.peers.suspension_remaining(&id).is_some() {
            return (self.peers.best_id(), true);
        }

        let (peer, already_best) = match self.peers.get(&id) {
            Some(existing) => {
                existing.set_td(td);
                existing.set_current_block_hash(head_hash);
                let already_best = self.peers.best_id().as_ref() == Some(&id);
                (existing, already_best)
            }
            None => {
                let fresh = Peer::new(id.clone(), td, head_hash, requestor);
                self.peers.insert(fresh.clone());
                (fresh, false)
            }
        };

        if already_best || td <= self.own_td() {
            return (self.peers.best_id(), false);
        }

        let should_promote = match self.peers.best() {
            Some(current_best) => td > current_best.td(),
            None => true,
        };
        if should_promote {
            self.promote(peer).await;
        }
        (self.peers.best_id(), false)
    }

    /// Promote `peer` to best: signal the outgoing best to pause and then
    /// idle, replay its previously-activated ancestor chains, and (re)launch
    /// its head-section driver if one isn't already running (§4.1, §4.6).
    async fn promote(self: &Arc<Self>, peer: Arc<Peer>) {
        let old = self.peers.best();
        if let Some(ref old_peer) = old {
            old_peer.switch.fire();
        }
        log_promotion(old.as_ref().map(|p| &p.id), &peer.id, peer.td());
        self.peers.set_best(Some(peer.id.clone()));

        for top_hash in peer.sections_snapshot() {
            if let Some(entry) = self.index.get(&top_hash) {
                self.activate_chain(entry.section, peer.id.clone(), None).await;
            }
        }

        if let Some(channels) = peer.take_driver_channels() {
            let shared = self.clone();
            let peer_for_driver = peer.clone();
            self.spawn_tracked(async move {
                run_peer_driver(shared, peer_for_driver, channels).await;
            });
        }

        if let Some(old_peer) = old {
            old_peer.idle.fire();
        }
    }

    /// §4.1 `remove_peer`.
    pub async fn remove_peer(self: &Arc<Self>, id: &PeerId) {
        let was_best = self.peers.best_id().as_deref() == Some(id.as_str());
        if let Some(peer) = self.peers.remove(id) {
            peer.switch.fire();
            peer.idle.fire();
        }
        if was_best {
            self.re_elect_best().await;
        }
    }

    /// §4.4 `add_block_hashes`. `next_hash` is consumed synchronously, newest
    /// to oldest, per the borrowed-reference contract (§9).
    pub async fn add_block_hashes(self: &Arc<Self>, mut next_hash: impl FnMut() -> Option<BlockHash>, id: PeerId) {
        if self.peers.best_id().as_ref() != Some(&id) {
            return;
        }
        let Some(peer) = self.peers.get(&id) else { return };

        let mut nodes: Vec<Arc<Node>> = Vec::new();
        let mut parent: Option<SectionId> = None;
        let mut parent_offset: Option<usize> = None;
        let mut child: Option<SectionId> = None;
        let mut count = 0u64;
        let mut building_head = false;

        if let Some(first) = next_hash() {
            count += 1;
            if Some(first) == peer.parent_hash() && peer.head_section().is_none() {
                if self.chain.has_block(&peer.current_block_hash()) {
                    self.stats.add_hashes_seen(count);
                    return;
                }
                building_head = true;
            }
            self.absorb_hash(first, &id, &mut nodes, &mut parent, &mut parent_offset, &mut child);
        }

        loop {
            let Some(hash) = next_hash() else { break };
            count += 1;
            let stop = self.absorb_hash(hash, &id, &mut nodes, &mut parent, &mut parent_offset, &mut child);
            if stop {
                break;
            }
        }
        self.stats.add_hashes_seen(count);

        // If the stream connected to the middle of `parent` rather than its
        // top, the nodes above the attach point are a separate fork: split
        // them off before linking the newly-discovered nodes underneath.
        if let (Some(parent_id), Some(offset)) = (parent, parent_offset) {
            if let Some(parent_section) = self.arena.get(parent_id) {
                if offset + 1 < parent_section.len() {
                    self.split_section(parent_id, offset + 1).await;
                }
            }
        }

        let new_section_id = {
            let _chain_guard = self.chain_lock.write();
            self.link_sections(nodes, parent, child)
        };

        if let Some(parent_id) = parent {
            if self.peers.best_id().as_ref() == Some(&id) {
                self.activate_chain(parent_id, id.clone(), None).await;
            }
        }

        if let Some(new_id) = new_section_id {
            if let Some(section) = self.arena.get(new_id) {
                let bottom = section.bottom_hash();
                if let Err(e) = peer.requestor.request_block_hashes(bottom) {
                    warn!("peer {:?}: request_block_hashes failed: {}", id, e);
                }
                let _ = section
                    .control_sender()
                    .send(crate::section::ControlMsg::Activate(id.clone()))
                    .await;
            }
            if building_head {
                peer.deliver_head_section(new_id).await;
            }
        }
    }

    /// Process one hash from `add_block_hashes`'s stream. Returns `true` if
    /// the scan should stop (connected to known structure).
    fn absorb_hash(
        &self,
        hash: BlockHash,
        id: &PeerId,
        nodes: &mut Vec<Arc<Node>>,
        parent: &mut Option<SectionId>,
        parent_offset: &mut Option<usize>,
        child: &mut Option<SectionId>,
    ) -> bool {
        if self.chain.has_block(&hash) {
            return true;
        }
        if let Some(entry) = self.index.get(&hash) {
            if entry.offset == 0 && nodes.is_empty() {
                *child = Some(entry.section);
                return false;
            }
            *parent = Some(entry.section);
            *parent_offset = Some(entry.offset);
            return true;
        }
        nodes.push(Arc::new(Node::new(hash, id.clone())));
        false
    }

    /// §4.3 `link_sections`: build a new section from freshly-discovered
    /// `nodes`, or if there are none, link `parent`/`child` directly.
    fn link_sections(self: &Arc<Self>, nodes: Vec<Arc<Node>>, parent: Option<SectionId>, child: Option<SectionId>) -> Option<SectionId> {
        if nodes.is_empty() {
            if let (Some(p), Some(c)) = (parent, child) {
                if let Some(parent_section) = self.arena.get(p) {
                    parent_section.set_child(Some(c));
                }
                if let Some(child_section) = self.arena.get(c) {
                    child_section.set_parent(Some(p));
                }
            }
            return None;
        }
        // nodes arrive newest-to-oldest; sections are stored bottom (oldest) to top.
        let mut ordered = nodes;
        ordered.reverse();
        Some(self.new_section(ordered, parent, child))
    }
}

pub struct BlockPool {
    shared: Arc<PoolShared>,
}

impl BlockPool {
    pub fn new(
        config: BlockPoolConfig,
        chain: Arc<dyn BlockChain>,
        pow: Arc<dyn PowVerifier>,
    ) -> BlockPool {
        let slice_capacity = config.block_batch_size as usize;
        let (peers, fanout_rx) = Peers::new(
            config.peer_suspension_interval(),
            config.hash_slice_pool_capacity,
            slice_capacity,
        );
        let repetition = config.blocks_request_repetition;

        let shared = Arc::new(PoolShared {
            config,
            chain,
            pow,
            peers: peers.clone(),
            index: PoolIndex::new(),
            arena: SectionArena::new(),
            stats: Status::new(),
            quit: CancelSignal::new(),
            own_td: Mutex::new(TotalDifficulty::zero()),
            chain_lock: RwLock::new(()),
            outstanding: AtomicUsize::new(0),
            idle_notify: Notify::new(),
            idle_since: Mutex::new(None),
        });

        shared.spawn_tracked(async move {
            run_fanout_worker(peers, repetition, fanout_rx).await;
        });

        BlockPool { shared }
    }

    /// Subscribe to chain-head events: whenever the blockchain's own td
    /// advances, the pool updates its bookkeeping. Catching up with the
    /// best peer doesn't clear it outright — `check_idle_best_peer` gives it
    /// `idle_best_peer_timeout` to advertise further progress before it's
    /// flagged `IdleTooLong` (§6 interface 1, §4.6, §7).
    pub fn start(&self, mut chain_head_rx: watch::Receiver<ChainHeadEvent>) {
        let shared = self.shared.clone();
        shared.spawn_tracked(async move {
            let mut quit = shared.quit.subscribe();
            loop {
                tokio::select! {
                    _ = quit.fired() => break,
                    changed = chain_head_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let event = chain_head_rx.borrow().clone();
                        *shared.own_td.lock() = event.total_difficulty;
                    }
                }
            }
        });

        let shared = self.shared.clone();
        shared.spawn_tracked(async move {
            let mut quit = shared.quit.subscribe();
            let mut tick = tokio::time::interval_at(
                TokioInstant::now() + shared.config.status_update_interval(),
                shared.config.status_update_interval(),
            );
            loop {
                tokio::select! {
                    _ = quit.fired() => break,
                    _ = tick.tick() => {
                        shared.stats.set_blocks_in_pool(shared.index.len() as u64);
                        let best = shared.peers.best_id().is_some() as u32;
                        shared.stats.set_peer_counts(
                            shared.peers.len() as u32,
                            best,
                            shared.peers.blacklisted_count(),
                        );
                        debug!("pool status: {:?}", shared.stats.snapshot());
                        shared.check_idle_best_peer().await;
                    }
                }
            }
        });
    }

    pub async fn add_peer(
        &self,
        td: TotalDifficulty,
        head_hash: BlockHash,
        id: PeerId,
        requestor: Arc<dyn PeerRequestor>,
    ) -> (Option<PeerId>, bool) {
        self.shared.add_peer(td, head_hash, id, requestor).await
    }

    pub async fn remove_peer(&self, id: &PeerId) {
        self.shared.remove_peer(id).await
    }

    pub async fn add_block_hashes(&self, next_hash: impl FnMut() -> Option<BlockHash>, id: PeerId) {
        self.shared.add_block_hashes(next_hash, id).await
    }

    /// §4.1 `add_block`.
    pub async fn add_block(&self, block: Block, id: PeerId) {
        let Some(peer) = self.shared.peers.get(&id) else { return };

        if block.hash == peer.current_block_hash() {
            peer.deliver_current_block(block).await;
            return;
        }

        let Some(node) = self.shared.node_at(&block.hash) else {
            self.shared.flag_peer(&peer, ErrorKind::UnrequestedBlock).await;
            return;
        };

        if !self.shared.pow.verify(&block) {
            self.shared.flag_peer(&peer, ErrorKind::InvalidPoW).await;
            return;
        }

        if node.set_block(block, id) {
            if let Some(entry) = self.shared.index.get(&node.hash) {
                self.shared.try_insert_section(entry.section).await;
            }
        }
    }

    pub async fn stop(&self) {
        self.shared.quit.fire();
    }

    pub async fn wait(&self, timeout: Duration) {
        let notified = self.shared.idle_notify.notified();
        if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats.snapshot()
    }
}
