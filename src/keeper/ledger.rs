//! Per-id execution locks and failure marks.
//!
//! The ledger is shared by the order loop, the position loop and manual
//! calls. A key is held from the first attempt until the last receipt is
//! observed, so at most one submission per key is ever in flight.

use crate::chain::ActionKey;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct ExecutionLedger {
    in_flight: Mutex<HashSet<ActionKey>>,
    /// Keys rejected permanently, with the rejection reason.
    failed: Mutex<HashMap<ActionKey, String>>,
    idle: Notify,
}

impl ExecutionLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `key`. Returns `None` if it is already in flight.
    pub fn try_acquire(self: &Arc<Self>, key: ActionKey) -> Option<InFlightGuard> {
        if !lock(&self.in_flight).insert(key) {
            debug!(%key, "Execution already in flight");
            return None;
        }
        Some(InFlightGuard {
            ledger: Arc::clone(self),
            key,
        })
    }

    pub fn is_in_flight(&self, key: ActionKey) -> bool {
        lock(&self.in_flight).contains(&key)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn is_failed(&self, key: ActionKey) -> bool {
        lock(&self.failed).contains_key(&key)
    }

    pub fn mark_failed(&self, key: ActionKey, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%key, %reason, "Marked as failed, automatic retries disabled");
        lock(&self.failed).insert(key, reason);
    }

    pub fn clear_failed(&self, key: ActionKey) {
        lock(&self.failed).remove(&key);
    }

    pub fn failed_reason(&self, key: ActionKey) -> Option<String> {
        lock(&self.failed).get(&key).cloned()
    }

    pub fn failed_count(&self) -> usize {
        lock(&self.failed).len()
    }

    /// Wait until nothing is in flight.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a release in between is not missed.
            let notified = self.idle.notified();
            if lock(&self.in_flight).is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, key: ActionKey) {
        let now_idle = {
            let mut in_flight = lock(&self.in_flight);
            in_flight.remove(&key);
            in_flight.is_empty()
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }
}

/// Holds a key in flight; releases it on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    ledger: Arc<ExecutionLedger>,
    key: ActionKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ledger.release(self.key);
    }
}

/// The guarded sets hold plain data, so a poisoned lock is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
