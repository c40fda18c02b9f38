//! Single-fire session end signal.
//!
//! A subscribed session can end from two independent producers: an explicit
//! disconnect request and the adapter's link-loss callback. Both fire the same
//! gate; only the first call has any effect.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct SessionGate {
    fired: AtomicBool,
    notify: Notify,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the gate. Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        let first = !self.fired.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolve once the gate has fired, immediately if it already has.
    pub async fn wait(&self) {
        loop {
            // register before checking so a concurrent fire is not missed
            let notified = self.notify.notified();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}
