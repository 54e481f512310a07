//! Remote peer state and the head-section driver task (§3 DATA MODEL — Peer,
//! §4.5 Peer head-section driver).

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::blockpool::PoolShared;
use crate::cancel::{CancelSignal, CancelWait};
use crate::error::ErrorKind;
use crate::hash::{Block, BlockHash, TotalDifficulty};
use crate::section::SectionId;
use crate::traits::PeerRequestor;

/// Opaque peer identity, as handed in by the wire layer on `add_peer`. Cheap
/// to clone and hash: every section and node keeps one around to record
/// provenance.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(id: impl Into<Arc<str>>) -> PeerId {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct PeerState {
    td: TotalDifficulty,
    current_block_hash: BlockHash,
    current_block: Option<Block>,
    parent_hash: Option<BlockHash>,
    head_section: Option<SectionId>,
    /// Top-hashes of sections this peer has activated, in chain order;
    /// replayed by `activate_chain` when the peer is re-promoted to best.
    sections: Vec<BlockHash>,
}

/// Remote counterparty state: advertised chain info, the callbacks used to
/// pull more of it, and the broadcast-cancel signals that drive its
/// section workers and head-section driver.
pub struct Peer {
    pub id: PeerId,
    pub requestor: Arc<dyn PeerRequestor>,
    state: Mutex<PeerState>,
    /// Fired when this peer is demoted from best: section workers and the
    /// driver abandon in-flight activation.
    pub switch: CancelSignal,
    /// Fired when this peer should go quiet (e.g. we caught up): sections
    /// stop actively requesting but retain their state.
    pub idle: CancelSignal,
    /// Fired if the peer fails to supply enough chain info in time.
    pub suicide: CancelSignal,
    current_block_tx: mpsc::Sender<Block>,
    head_section_tx: mpsc::Sender<SectionId>,
    driver_channels: Mutex<Option<PeerChannels>>,
}

pub struct PeerChannels {
    pub current_block_rx: mpsc::Receiver<Block>,
    pub head_section_rx: mpsc::Receiver<SectionId>,
}

impl Peer {
    /// Builds a registered-but-not-yet-driven peer. The driver's receiver
    /// halves are kept on the `Peer` itself (`take_driver_channels`) rather
    /// than handed back here, so a peer that is registered now and promoted
    /// to best later (e.g. via re-election after a removal) can still have
    /// its driver spawned exactly once, whenever that turns out to be.
    pub fn new(id: PeerId, td: TotalDifficulty, head_hash: BlockHash, requestor: Arc<dyn PeerRequestor>) -> Arc<Peer> {
        let (current_block_tx, current_block_rx) = mpsc::channel(4);
        let (head_section_tx, head_section_rx) = mpsc::channel(4);
        Arc::new(Peer {
            id,
            requestor,
            state: Mutex::new(PeerState {
                td,
                current_block_hash: head_hash,
                current_block: None,
                parent_hash: None,
                head_section: None,
                sections: Vec::new(),
            }),
            switch: CancelSignal::new(),
            idle: CancelSignal::new(),
            suicide: CancelSignal::new(),
            current_block_tx,
            head_section_tx,
            driver_channels: Mutex::new(Some(PeerChannels {
                current_block_rx,
                head_section_rx,
            })),
        })
    }

    /// Take the driver's channels, if they haven't already been claimed.
    /// Returns `None` if a driver for this peer is already running.
    pub fn take_driver_channels(&self) -> Option<PeerChannels> {
        self.driver_channels.lock().take()
    }

    pub fn td(&self) -> TotalDifficulty {
        self.state.lock().td
    }

    pub fn set_td(&self, td: TotalDifficulty) {
        self.state.lock().td = td;
    }

    pub fn current_block_hash(&self) -> BlockHash {
        self.state.lock().current_block_hash
    }

    pub fn set_current_block_hash(&self, hash: BlockHash) {
        let mut state = self.state.lock();
        state.current_block_hash = hash;
        state.current_block = None;
        state.parent_hash = None;
    }

    pub fn parent_hash(&self) -> Option<BlockHash> {
        self.state.lock().parent_hash
    }

    pub fn head_section(&self) -> Option<SectionId> {
        self.state.lock().head_section
    }

    pub fn sections_snapshot(&self) -> Vec<BlockHash> {
        self.state.lock().sections.clone()
    }

    pub fn record_activated_section(&self, top_hash: BlockHash) {
        let mut state = self.state.lock();
        if !state.sections.contains(&top_hash) {
            state.sections.push(top_hash);
        }
    }

    /// Deliver a freshly arrived head block to the driver task. Fire-and
    /// forget: if the driver has already exited (peer removed mid-flight)
    /// the send is simply dropped.
    pub async fn deliver_current_block(&self, block: Block) {
        {
            let mut state = self.state.lock();
            state.parent_hash = Some(block.parent_hash);
            state.current_block = Some(block.clone());
        }
        let _ = self.current_block_tx.send(block).await;
    }

    pub async fn deliver_head_section(&self, id: SectionId) {
        self.state.lock().head_section = Some(id);
        let _ = self.head_section_tx.send(id).await;
    }

    pub fn switch_wait(&self) -> CancelWait {
        self.switch.subscribe()
    }

    pub fn idle_wait(&self) -> CancelWait {
        self.idle.subscribe()
    }
}

/// Runs a newly best-promoted peer's head-section driver: ensures enough
/// chain info has arrived to build a head section, then idles, watching
/// for switch/quit/head-section-death (§4.5).
pub async fn run_peer_driver(pool: Arc<PoolShared>, peer: Arc<Peer>, mut channels: PeerChannels) {
    let mut quit = pool.quit.subscribe();
    let mut switch = peer.switch_wait();
    let mut suicide = peer.suicide.subscribe();

    debug!("peer {:?} driver started (waiting for head block)", peer.id);

    let head_hash = peer.current_block_hash();
    if pool.chain.has_block(&head_hash) {
        return;
    }

    if let Some(block) = pool.index_block_if_present(&head_hash) {
        peer.deliver_current_block(block).await;
    } else if let Err(e) = peer.requestor.request_blocks(vec![head_hash]) {
        warn!("peer {:?}: initial head block request failed: {}", peer.id, e);
    }

    let block_timer = tokio::time::sleep(pool.config.blocks_request_interval());
    tokio::pin!(block_timer);

    // §4.5 Suicide: no progress at all within `block_hashes_timeout` fires
    // `peer.suicide`, which the arm below turns into `InsufficientChainInfo`.
    let progress_deadline = tokio::time::sleep(pool.config.block_hashes_timeout());
    tokio::pin!(progress_deadline);

    let block: Block = loop {
        tokio::select! {
            _ = quit.fired() => return,
            _ = switch.fired() => return,
            _ = suicide.fired() => {
                pool.flag_peer(&peer, ErrorKind::InsufficientChainInfo).await;
                return;
            }
            () = &mut progress_deadline => {
                peer.suicide.fire();
            }
            Some(b) = channels.current_block_rx.recv() => break b,
            () = &mut block_timer => {
                if let Err(e) = peer.requestor.request_blocks(vec![peer.current_block_hash()]) {
                    warn!("peer {:?}: head block re-request failed: {}", peer.id, e);
                }
                block_timer.as_mut().reset(tokio::time::Instant::now() + pool.config.blocks_request_interval());
            }
        }
    };

    debug!("peer {:?} driver: have head block, resolving parent", peer.id);

    if pool.chain.has_block(&block.parent_hash) {
        pool.insert_singleton(block, peer.id.clone()).await;
        return;
    }

    match pool.attach_or_create_head_section(&block, &peer).await {
        crate::blockpool::HeadResolution::Inserted => return,
        crate::blockpool::HeadResolution::Attached(id) => peer.deliver_head_section(id).await,
        crate::blockpool::HeadResolution::NeedHashes => {
            if let Err(e) = peer.requestor.request_block_hashes(block.hash) {
                warn!("peer {:?}: hash request failed: {}", peer.id, e);
            }
        }
    }

    let hash_timer = tokio::time::sleep(pool.config.block_hashes_request_interval());
    tokio::pin!(hash_timer);

    // A head block arrived, which counts as progress: the deadline for
    // resolving its ancestry starts fresh here.
    let progress_deadline = tokio::time::sleep(pool.config.block_hashes_timeout());
    tokio::pin!(progress_deadline);

    let head_section = loop {
        tokio::select! {
            _ = quit.fired() => return,
            _ = switch.fired() => return,
            _ = suicide.fired() => {
                pool.flag_peer(&peer, ErrorKind::InsufficientChainInfo).await;
                return;
            }
            () = &mut progress_deadline => {
                peer.suicide.fire();
            }
            Some(id) = channels.head_section_rx.recv() => break id,
            () = &mut hash_timer => {
                if let Err(e) = peer.requestor.request_block_hashes(peer.current_block_hash()) {
                    warn!("peer {:?}: hash re-request failed: {}", peer.id, e);
                }
                hash_timer.as_mut().reset(tokio::time::Instant::now() + pool.config.block_hashes_request_interval());
            }
        }
    };

    debug!("peer {:?} driver: head section {:?} live, idling", peer.id, head_section);

    let mut section_dead = match pool.arena.get(head_section) {
        Some(s) => s.suicide.subscribe(),
        None => return,
    };

    loop {
        tokio::select! {
            _ = quit.fired() => return,
            _ = switch.fired() => return,
            _ = section_dead.fired() => return,
        }
    }
}
