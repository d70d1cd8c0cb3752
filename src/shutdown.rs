//! Cooperative shutdown signal shared by the coordinator, gateway and
//! tracked-list watcher.
//!
//! Backed by a `tokio::sync::watch` channel so a late subscriber still
//! observes an already-triggered shutdown, which a broadcast channel would
//! miss. In-flight tasks finish their current atomic step; rate-limit and
//! backoff sleeps select against [`Shutdown::cancelled`] so they never stall
//! a stopping process.

use tokio::sync::watch;

/// Clonable shutdown handle. All clones observe the same trigger.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Signal shutdown to every clone.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered. Resolves immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender gone means the owning component is tearing down; treat it
        // the same as a trigger.
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
