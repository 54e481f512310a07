//! Broadcast-cancel signal: "close to broadcast cancel" (§9), built on
//! `tokio::sync::watch` so every outstanding selector currently waiting on
//! it wakes up at once. Re-promotion / re-activation always builds a fresh
//! [`CancelSignal`] rather than reusing a fired one — reusing a fired
//! channel is a protocol error per the design notes.

use std::sync::Arc;

use tokio::sync::watch;

/// The firing side. Cloning shares the same underlying signal.
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> CancelSignal {
        let (tx, rx) = watch::channel(false);
        CancelSignal {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Broadcast cancel to every subscriber.
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Hand out an independent waiter. Each subscriber observes the fire
    /// exactly once it happens, regardless of when it subscribed.
    pub fn subscribe(&self) -> CancelWait {
        CancelWait {
            rx: self.rx.clone(),
        }
    }
}

impl Default for CancelSignal {
    fn default() -> CancelSignal {
        CancelSignal::new()
    }
}

/// A subscriber's view of a [`CancelSignal`]; awaited from inside
/// `tokio::select!` blocks.
#[derive(Clone)]
pub struct CancelWait {
    rx: watch::Receiver<bool>,
}

impl CancelWait {
    /// Resolves once the signal has fired (immediately if it already has).
    pub async fn fired(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        // Sender dropped without firing: treat as fired so selectors don't
        // spin forever on a signal whose owner is gone.
    }
}
