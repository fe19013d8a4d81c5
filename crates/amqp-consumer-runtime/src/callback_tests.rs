//! Tests for the broker-event handler.

use super::*;
use crate::message::{DeliveryProperties, Envelope};
use bytes::Bytes;

struct Fixture {
    handler: CallbackHandler,
    buffer: Arc<DeliveryBuffer>,
    ledger: Arc<DeliveryTagLedger>,
    tags: Arc<ConsumerTagMap>,
    shutdown: Arc<ShutdownCell>,
    cancel_received: Arc<AtomicBool>,
    counter: Arc<ActiveConsumerCounter>,
    consumer_id: Uuid,
}

fn fixture() -> Fixture {
    let buffer = Arc::new(DeliveryBuffer::new(4));
    let ledger = Arc::new(DeliveryTagLedger::new());
    let tags = Arc::new(ConsumerTagMap::default());
    let shutdown = Arc::new(ShutdownCell::new());
    let cancel_received = Arc::new(AtomicBool::new(false));
    let counter = Arc::new(ActiveConsumerCounter::new());
    let consumer_id = Uuid::new_v4();
    counter.add(consumer_id);
    let handler = CallbackHandler::new(
        buffer.clone(),
        ledger.clone(),
        tags.clone(),
        shutdown.clone(),
        cancel_received.clone(),
        counter.clone(),
        consumer_id,
    );
    Fixture {
        handler,
        buffer,
        ledger,
        tags,
        shutdown,
        cancel_received,
        counter,
        consumer_id,
    }
}

fn delivery(tag: u64) -> Delivery {
    Delivery::new(
        "ctag-1",
        Envelope::new(tag, false, "", "orders"),
        DeliveryProperties::default(),
        Bytes::from_static(b"payload"),
    )
}

#[tokio::test]
async fn test_delivery_lands_in_buffer() {
    let fx = fixture();
    fx.handler.on_delivery(delivery(1)).await;
    fx.handler.on_delivery(delivery(2)).await;

    assert_eq!(fx.buffer.len(), 2);
    assert_eq!(fx.buffer.take().await.delivery_tag(), 1);
}

#[tokio::test]
async fn test_broker_cancel_flags_and_unmaps_tag() {
    let fx = fixture();
    fx.tags.insert("ctag-1", "orders");

    fx.handler.on_cancel("ctag-1").await;

    assert!(fx.cancel_received.load(Ordering::SeqCst));
    assert!(fx.tags.queue_for("ctag-1").is_none());
}

#[tokio::test]
async fn test_cancel_ok_unmaps_without_flagging() {
    let fx = fixture();
    fx.tags.insert("ctag-1", "orders");

    fx.handler.on_cancel_ok("ctag-1").await;

    assert!(!fx.cancel_received.load(Ordering::SeqCst));
    assert!(fx.tags.queue_for("ctag-1").is_none());
}

#[tokio::test]
async fn test_shutdown_captures_signal_and_releases_state() {
    let fx = fixture();
    fx.ledger.record(7);
    assert_eq!(fx.counter.active(), 1);

    fx.handler
        .on_shutdown(ShutdownSignal::new("connection reset", true))
        .await;

    let signal = fx.shutdown.get().expect("signal should be captured");
    assert_eq!(signal.reason(), "connection reset");
    assert!(fx.ledger.is_empty());
    assert_eq!(fx.counter.active(), 0);
    assert!(!fx.counter.release(fx.consumer_id));
}
