//! Broadcast-once completion signal.

use tokio::sync::watch;

/// A single-fulfillment signal awaited by many.
///
/// Firing is idempotent and sticky: waiters that subscribe after the fact
/// observe the satisfied flag immediately. Cloning shares the underlying
/// channel.
#[derive(Clone, Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A signal that is already satisfied.
    pub fn fired() -> Self {
        let signal = Self::new();
        signal.fire();
        signal
    }

    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender side lives in self, so this cannot error while awaited.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
