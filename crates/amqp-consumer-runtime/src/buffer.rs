//! Bounded FIFO hand-off between the broker-callback context and the
//! application context.

use crate::message::Delivery;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;

/// Bounded, FIFO delivery queue.
///
/// Capacity equals the prefetch count, which makes the application's
/// settlement pace the only backpressure signal the broker needs: once the
/// buffer is full, `put` blocks the callback context and the broker stops
/// being drained.
///
/// The buffer owns both endpoints of the underlying channel, so it can
/// never observe a disconnect while it is alive. The receiver sits behind
/// an async mutex so multiple consumer-side callers are tolerated, though
/// single-producer/single-consumer is the expected pattern.
#[derive(Debug)]
pub struct DeliveryBuffer {
    tx: mpsc::Sender<Delivery>,
    rx: Mutex<mpsc::Receiver<Delivery>>,
    capacity: usize,
}

impl DeliveryBuffer {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    /// Enqueue a delivery, blocking while the buffer is at capacity. Never
    /// drops a delivery.
    pub async fn put(&self, delivery: Delivery) {
        if self.tx.send(delivery).await.is_err() {
            // Unreachable while the buffer is alive; it owns the receiver.
            tracing::debug!("delivery buffer receiver dropped; delivery discarded");
        }
    }

    /// Dequeue the next delivery, blocking indefinitely until one arrives.
    pub async fn take(&self) -> Delivery {
        let mut rx = self.rx.lock().await;
        loop {
            if let Some(delivery) = rx.recv().await {
                return delivery;
            }
            // recv() only yields None once every sender is dropped, which
            // cannot happen while `self.tx` exists.
        }
    }

    /// Dequeue the next delivery, waiting at most `timeout`. Absence is not
    /// failure: expiry returns `None`.
    pub async fn poll(&self, timeout: Duration) -> Option<Delivery> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether at least one delivery is currently buffered.
    pub fn has_delivery(&self) -> bool {
        self.tx.capacity() < self.tx.max_capacity()
    }

    /// Number of deliveries currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_delivery()
    }
}
