//! Tracking of outstanding delivery tags awaiting settlement.

use std::sync::Mutex;

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;

/// Insertion-ordered set of delivery tags handed to the application but not
/// yet settled.
///
/// Tags are monotonically increasing per channel and unique while the
/// channel is open, so duplicates are impossible by protocol guarantee and
/// the most recently recorded tag is always the highest. The ledger is
/// cleared atomically with every settlement or rollback and on shutdown
/// receipt, since tags are meaningless once the channel is gone.
#[derive(Debug, Default)]
pub struct DeliveryTagLedger {
    tags: Mutex<Vec<u64>>,
}

impl DeliveryTagLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tag as outstanding. Must happen before the corresponding
    /// message is handed to the application.
    pub fn record(&self, delivery_tag: u64) {
        self.tags.lock().expect("ledger lock poisoned").push(delivery_tag);
    }

    /// The highest outstanding tag, if any. Cumulative acknowledgment of
    /// this tag settles every outstanding tag.
    pub fn highest(&self) -> Option<u64> {
        self.tags
            .lock()
            .expect("ledger lock poisoned")
            .last()
            .copied()
    }

    /// All outstanding tags in insertion order.
    pub fn snapshot(&self) -> Vec<u64> {
        self.tags.lock().expect("ledger lock poisoned").clone()
    }

    pub fn clear(&self) {
        self.tags.lock().expect("ledger lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.tags.lock().expect("ledger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.lock().expect("ledger lock poisoned").is_empty()
    }
}
