//! The event sink registered with the broker channel.

use crate::buffer::DeliveryBuffer;
use crate::channel::ConsumerCallback;
use crate::consumer::ConsumerTagMap;
use crate::counter::ActiveConsumerCounter;
use crate::ledger::DeliveryTagLedger;
use crate::message::Delivery;
use crate::signal::{ShutdownCell, ShutdownSignal};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "callback_tests.rs"]
mod tests;

/// Translates broker callback events into shared consumer state.
///
/// This is the only writer into the [`DeliveryBuffer`] and the only
/// receiver of cancel/shutdown events. It runs entirely in the
/// broker-callback execution context.
pub(crate) struct CallbackHandler {
    buffer: Arc<DeliveryBuffer>,
    ledger: Arc<DeliveryTagLedger>,
    tags: Arc<ConsumerTagMap>,
    shutdown: Arc<ShutdownCell>,
    cancel_received: Arc<AtomicBool>,
    counter: Arc<ActiveConsumerCounter>,
    consumer_id: Uuid,
}

impl CallbackHandler {
    pub(crate) fn new(
        buffer: Arc<DeliveryBuffer>,
        ledger: Arc<DeliveryTagLedger>,
        tags: Arc<ConsumerTagMap>,
        shutdown: Arc<ShutdownCell>,
        cancel_received: Arc<AtomicBool>,
        counter: Arc<ActiveConsumerCounter>,
        consumer_id: Uuid,
    ) -> Self {
        Self {
            buffer,
            ledger,
            tags,
            shutdown,
            cancel_received,
            counter,
            consumer_id,
        }
    }
}

#[async_trait]
impl ConsumerCallback for CallbackHandler {
    async fn on_delivery(&self, delivery: Delivery) {
        trace!(
            delivery_tag = delivery.delivery_tag(),
            consumer_tag = %delivery.consumer_tag,
            "storing delivery"
        );
        // Blocks while the buffer is at capacity; this is the deliberate
        // backpressure path.
        self.buffer.put(delivery).await;
    }

    async fn on_cancel(&self, consumer_tag: &str) {
        warn!(consumer_tag, "cancel received from broker");
        self.tags.remove(consumer_tag);
        // Must surface as an error on the next retrieval, distinct from a
        // plain timeout.
        self.cancel_received.store(true, Ordering::SeqCst);
    }

    async fn on_cancel_ok(&self, consumer_tag: &str) {
        debug!(consumer_tag, "cancellation confirmed");
        self.tags.remove(consumer_tag);
    }

    async fn on_consume_ok(&self, consumer_tag: &str) {
        debug!(consumer_tag, "subscription confirmed");
    }

    async fn on_shutdown(&self, signal: ShutdownSignal) {
        debug!(%signal, "received shutdown signal");
        self.shutdown.set(signal);
        // Outstanding tags are invalid once the channel is gone.
        self.ledger.clear();
        self.counter.release(self.consumer_id);
    }
}
