//! Peer registry, best-peer election, blacklist suspension and block-request
//! fan-out (§4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::mpsc;

use crate::cancel::CancelWait;
use crate::error::Error;
use crate::hash::{BlockHash, TotalDifficulty};
use crate::peer::{Peer, PeerId};
use crate::slicepool::SlicePool;

struct PeersInner {
    by_id: HashMap<PeerId, Arc<Peer>>,
    best: Option<PeerId>,
    blacklist: HashMap<PeerId, Instant>,
}

/// Registry of currently-known peers plus best-peer bookkeeping. Held
/// behind a single `RwLock`, mirroring the `peers.lock` entry in the
/// locking-discipline table; `Peer` internals have their own finer lock.
pub struct Peers {
    inner: RwLock<PeersInner>,
    slices: SlicePool,
    suspension: Duration,
    fanout: mpsc::Sender<FanoutJob>,
}

pub(crate) struct FanoutJob {
    hashes: Vec<BlockHash>,
    attempts: usize,
}

impl Peers {
    pub fn new(suspension: Duration, slice_pool_capacity: usize, slice_capacity: usize) -> (Arc<Peers>, mpsc::Receiver<FanoutJob>) {
        let (fanout_tx, fanout_rx) = mpsc::channel(256);
        let peers = Arc::new(Peers {
            inner: RwLock::new(PeersInner {
                by_id: HashMap::new(),
                best: None,
                blacklist: HashMap::new(),
            }),
            slices: SlicePool::new(slice_pool_capacity, slice_capacity),
            suspension,
            fanout: fanout_tx,
        });
        (peers, fanout_rx)
    }

    /// `None` if `id` is not (or no longer) suspended; `Some(remaining)`
    /// otherwise.
    pub fn suspension_remaining(&self, id: &PeerId) -> Option<Duration> {
        let inner = self.inner.read();
        let expiry = inner.blacklist.get(id)?;
        let now = Instant::now();
        if *expiry > now {
            Some(*expiry - now)
        } else {
            None
        }
    }

    pub fn blacklist(&self, id: PeerId) {
        let expiry = Instant::now() + self.suspension;
        self.inner.write().blacklist.insert(id, expiry);
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn insert(&self, peer: Arc<Peer>) {
        self.inner.write().by_id.insert(peer.id.clone(), peer);
    }

    pub fn remove(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let mut inner = self.inner.write();
        let removed = inner.by_id.remove(id);
        if inner.best.as_ref() == Some(id) {
            inner.best = None;
        }
        removed
    }

    pub fn best_id(&self) -> Option<PeerId> {
        self.inner.read().best.clone()
    }

    pub fn best(&self) -> Option<Arc<Peer>> {
        let inner = self.inner.read();
        let id = inner.best.as_ref()?;
        inner.by_id.get(id).cloned()
    }

    pub fn set_best(&self, id: Option<PeerId>) {
        self.inner.write().best = id;
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn blacklisted_count(&self) -> u32 {
        let now = Instant::now();
        self.inner
            .read()
            .blacklist
            .values()
            .filter(|&&expiry| expiry > now)
            .count() as u32
    }

    /// Peer with the strictly highest self-advertised td, among all
    /// currently registered peers; `None` if the registry is empty.
    pub fn highest_td(&self) -> Option<Arc<Peer>> {
        self.inner
            .read()
            .by_id
            .values()
            .cloned()
            .max_by_key(|p| p.td())
    }

    pub fn switch_wait(&self, id: &PeerId) -> Option<CancelWait> {
        self.get(id).map(|p| p.switch_wait())
    }

    pub fn idle_wait(&self, id: &PeerId) -> Option<CancelWait> {
        self.get(id).map(|p| p.idle_wait())
    }

    /// Queue a fan-out round for `hashes` at retry count `attempts`; actual
    /// dispatch happens on a dedicated task (`run_fanout_worker`) so this
    /// never blocks on a peer callback while holding `peers.lock` (§9).
    pub async fn request_blocks(&self, hashes: Vec<BlockHash>, attempts: usize) {
        let _ = self.fanout.send(FanoutJob { hashes, attempts }).await;
    }

    pub fn take_slice(&self) -> Vec<BlockHash> {
        self.slices.take()
    }

    pub fn give_back_slice(&self, buf: Vec<BlockHash>) {
        self.slices.give_back(buf)
    }
}

/// Background task draining the fan-out queue: attempt 0 always goes to the
/// best peer; later attempts go to `min(repetition, peer_count)` distinct
/// peers chosen uniformly at random.
pub async fn run_fanout_worker(peers: Arc<Peers>, repetition: usize, mut jobs: mpsc::Receiver<FanoutJob>) {
    while let Some(job) = jobs.recv().await {
        let targets: Vec<Arc<Peer>> = if job.attempts == 0 {
            peers.best().into_iter().collect()
        } else {
            let mut candidates: Vec<Arc<Peer>> = peers.inner.read().by_id.values().cloned().collect();
            let mut rng = thread_rng();
            candidates.shuffle(&mut rng);
            candidates.truncate(repetition.min(candidates.len()));
            candidates
        };

        for peer in targets {
            if let Err(e) = peer.requestor.request_blocks(job.hashes.clone()) {
                warn!("peer {:?}: request_blocks fan-out failed: {}", peer.id, e);
            }
        }
        peers.give_back_slice(job.hashes);
    }
}

/// Flag a peer with a fatal or soft error: fatal kinds remove the peer and
/// blacklist its id (§7); soft kinds are just forwarded.
pub fn dispatch_peer_error(peers: &Peers, peer: &Peer, err: Error) {
    peer.requestor.peer_error(&err);
    if err.is_fatal() {
        warn!("peer {:?} fatal error: {}", peer.id, err);
        peers.remove(&peer.id);
        peers.blacklist(peer.id.clone());
    }
}

pub fn log_promotion(old: Option<&PeerId>, new: &PeerId, td: TotalDifficulty) {
    match old {
        Some(old_id) => info!("best peer switch: {:?} -> {:?} (td={})", old_id, new, td),
        None => info!("best peer elected: {:?} (td={})", new, td),
    }
}
