//! Best-effort wake-up signal for control loops.
//!
//! The notifier never blocks: `notify` stores at most one pending permit,
//! and a wake that arrives while nobody is waiting is either consumed by
//! the next wait or coalesced with others. Missed wakes are tolerated; the
//! loop's own timer catches up.

use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct WakeSignal {
    inner: Arc<Notify>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the waiting loop, or leave a permit for its next wait.
    pub fn notify(&self) {
        self.inner.notify_one();
    }

    /// Wait until notified.
    pub async fn notified(&self) {
        self.inner.notified().await;
    }
}
