//! Connectivity signal gating the upload synchronizer.
//!
//! A thin wrapper over a watch channel. The platform layer (or tests)
//! flips it; the synchronizer waits on it and aborts in-flight work when
//! it drops.

use tokio::sync::watch;

/// Shared online/offline signal.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    /// Create a signal with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self) {
        let _ = self.tx.send(true);
    }

    pub fn set_offline(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal reads online (immediately if it already
    /// does).
    pub async fn wait_until_online(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolve once the signal reads offline. Used to abort in-flight
    /// uploads when the link drops.
    pub async fn wait_until_offline(&self) {
        let mut rx = self.tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(false)
    }
}
