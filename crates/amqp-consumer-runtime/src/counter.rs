//! Active-object tracking for an owning pool or container.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

#[cfg(test)]
#[path = "counter_tests.rs"]
mod tests;

/// Counts live consumer instances so a container shutdown can wait for
/// quiescence.
///
/// Slots are keyed by consumer id, which makes `release` idempotent: a
/// consumer released both by its shutdown callback and by a failed start
/// only vacates its slot once.
#[derive(Debug, Default)]
pub struct ActiveConsumerCounter {
    active: Mutex<HashSet<Uuid>>,
    notify: Notify,
}

impl ActiveConsumerCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: Uuid) {
        self.active.lock().expect("counter lock poisoned").insert(id);
    }

    /// Vacate a slot. Returns whether the id was present.
    pub fn release(&self, id: Uuid) -> bool {
        let mut active = self.active.lock().expect("counter lock poisoned");
        let removed = active.remove(&id);
        if removed && active.is_empty() {
            self.notify.notify_waiters();
        }
        removed
    }

    pub fn active(&self) -> usize {
        self.active.lock().expect("counter lock poisoned").len()
    }

    /// Wait until every slot is vacated, up to `timeout`. Returns `true`
    /// when the counter reached zero in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}
