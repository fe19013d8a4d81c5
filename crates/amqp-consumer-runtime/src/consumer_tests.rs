//! Lifecycle, retrieval, and settlement tests for the queue consumer,
//! driven through the in-memory broker.

use super::*;
use crate::config::AcknowledgeMode;
use crate::memory::{InMemoryBroker, RecordedOp};
use crate::message::DefaultMaterializer;

struct FixedTagStrategy;

impl ConsumerTagStrategy for FixedTagStrategy {
    fn consumer_tag(&self, queue: &str) -> String {
        format!("{queue}-fixed")
    }
}

fn consumer_with_counter(
    broker: &Arc<InMemoryBroker>,
    counter: Arc<ActiveConsumerCounter>,
    config: ConsumerConfig,
) -> QueueConsumer {
    QueueConsumer::new(
        broker.clone(),
        Arc::new(DefaultMaterializer),
        counter,
        config,
    )
}

fn consumer(broker: &Arc<InMemoryBroker>, config: ConsumerConfig) -> QueueConsumer {
    consumer_with_counter(broker, Arc::new(ActiveConsumerCounter::new()), config)
}

// ----------------------------------------------------------------------
// Startup
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_start_declares_sets_prefetch_and_subscribes() {
    let broker = Arc::new(InMemoryBroker::new(["orders", "billing"]));
    let consumer = consumer(
        &broker,
        ConsumerConfig::new(["orders", "billing"]).with_prefetch_count(10),
    );

    consumer.start().await.expect("start should succeed");

    assert_eq!(consumer.state(), ConsumerState::Running);
    assert_eq!(consumer.consumer_tags().len(), 2);
    assert_eq!(broker.subscribed_queues(), vec!["billing", "orders"]);

    let ops = broker
        .last_channel()
        .expect("channel should be recorded")
        .ops();
    assert_eq!(ops[0], RecordedOp::DeclarePassive("orders".to_string()));
    assert_eq!(ops[1], RecordedOp::DeclarePassive("billing".to_string()));
    // The QoS window must be in place before the first subscribe.
    assert_eq!(ops[2], RecordedOp::Prefetch(10));
    assert!(matches!(ops[3], RecordedOp::Subscribe { .. }));
    assert!(matches!(ops[4], RecordedOp::Subscribe { .. }));
}

#[tokio::test]
async fn test_start_counts_active_consumer() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let counter = Arc::new(ActiveConsumerCounter::new());
    let consumer =
        consumer_with_counter(&broker, counter.clone(), ConsumerConfig::new(["orders"]));

    consumer.start().await.expect("start should succeed");
    assert_eq!(counter.active(), 1);
}

#[tokio::test]
async fn test_auto_ack_mode_skips_prefetch() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(
        &broker,
        ConsumerConfig::new(["orders"]).with_acknowledge_mode(AcknowledgeMode::None),
    );

    consumer.start().await.expect("start should succeed");

    let ops = broker
        .last_channel()
        .expect("channel should be recorded")
        .ops();
    assert!(!ops.iter().any(|op| matches!(op, RecordedOp::Prefetch(_))));
    assert!(ops
        .iter()
        .any(|op| matches!(op, RecordedOp::Subscribe { auto_ack: true, .. })));
}

#[tokio::test]
async fn test_authentication_failure_is_fatal() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    broker.set_fail_authentication(true);
    let counter = Arc::new(ActiveConsumerCounter::new());
    let consumer =
        consumer_with_counter(&broker, counter.clone(), ConsumerConfig::new(["orders"]));

    let error = consumer.start().await.expect_err("start should fail");
    assert!(matches!(error, ConsumerError::FatalStartup { .. }));
    assert!(error.is_fatal());
    assert_eq!(consumer.state(), ConsumerState::Failed);
    assert_eq!(counter.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_no_queues_available_exhausts_retries() {
    let broker = Arc::new(InMemoryBroker::new(Vec::<String>::new()));
    let counter = Arc::new(ActiveConsumerCounter::new());
    let consumer = consumer_with_counter(
        &broker,
        counter.clone(),
        ConsumerConfig::new(["orders", "billing"]),
    );

    let error = consumer.start().await.expect_err("start should fail");
    match error {
        ConsumerError::QueuesNotAvailable { queues, .. } => {
            assert_eq!(queues, vec!["orders", "billing"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(consumer.state(), ConsumerState::Failed);
    assert_eq!(counter.active(), 0);

    // Initial pass plus three retries, two declarations each.
    let declares = broker
        .last_channel()
        .expect("channel should be recorded")
        .ops()
        .iter()
        .filter(|op| matches!(op, RecordedOp::DeclarePassive(_)))
        .count();
    assert_eq!(declares, 8);
}

#[tokio::test(start_paused = true)]
async fn test_partial_availability_enters_degraded_mode() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(
        &broker,
        ConsumerConfig::new(["orders", "billing"]).with_declaration_retries(0),
    );

    consumer.start().await.expect("start should succeed");

    assert_eq!(consumer.state(), ConsumerState::Running);
    assert_eq!(consumer.missing_queues().await, vec!["billing"]);
    assert_eq!(broker.subscribed_queues(), vec!["orders"]);
}

#[tokio::test(start_paused = true)]
async fn test_missing_queue_picked_up_after_recheck_interval() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(
        &broker,
        ConsumerConfig::new(["orders", "billing"]).with_declaration_retries(0),
    );
    consumer.start().await.expect("start should succeed");

    broker.add_queue("billing");

    // Inside the interval nothing is probed.
    consumer
        .next_message_timeout(Duration::from_millis(10))
        .await
        .expect("retrieval should succeed");
    assert_eq!(consumer.missing_queues().await, vec!["billing"]);
    assert_eq!(broker.throwaway_count(), 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    consumer
        .next_message_timeout(Duration::from_millis(10))
        .await
        .expect("retrieval should succeed");

    assert!(consumer.missing_queues().await.is_empty());
    assert_eq!(broker.subscribed_queues(), vec!["billing", "orders"]);
    assert_eq!(consumer.consumer_tags().len(), 2);
    // The probe ran on a throwaway channel, not the main one.
    assert_eq!(broker.throwaway_count(), 1);
}

#[tokio::test]
async fn test_tag_strategy_names_subscriptions() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]))
        .with_tag_strategy(Arc::new(FixedTagStrategy));

    consumer.start().await.expect("start should succeed");
    assert_eq!(consumer.consumer_tags(), vec!["orders-fixed"]);
}

// ----------------------------------------------------------------------
// Retrieval
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_delivery_roundtrip_stamps_queue_and_tag() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]));
    consumer.start().await.expect("start should succeed");

    broker.deliver("orders", "hello").await;

    let message = consumer.next_message().await.expect("message expected");
    assert_eq!(&message.body[..], b"hello");
    assert_eq!(message.properties.delivery_tag, 1);
    assert_eq!(message.properties.consumer_queue.as_deref(), Some("orders"));
    assert!(message.properties.consumer_tag.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_retrieval_returns_none_when_idle() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]));
    consumer.start().await.expect("start should succeed");

    let result = consumer
        .next_message_timeout(Duration::from_millis(50))
        .await
        .expect("retrieval should succeed");
    assert!(result.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_wakes_blocked_retrieval() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = Arc::new(consumer(&broker, ConsumerConfig::new(["orders"])));
    consumer.start().await.expect("start should succeed");

    let retrieval = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.next_message().await })
    };
    tokio::task::yield_now().await;
    assert!(!retrieval.is_finished());

    broker.shutdown("connection reset").await;

    let result = tokio::time::timeout(Duration::from_secs(1), retrieval)
        .await
        .expect("retrieval should wake promptly")
        .expect("retrieval task should not panic");
    match result {
        Err(ConsumerError::Shutdown(signal)) => {
            assert_eq!(signal.reason(), "connection reset");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_wakes_blocked_retrieval() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = Arc::new(consumer(&broker, ConsumerConfig::new(["orders"])));
    consumer.start().await.expect("start should succeed");

    let retrieval = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.next_message().await })
    };
    tokio::task::yield_now().await;
    assert!(!retrieval.is_finished());

    consumer.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(1), retrieval)
        .await
        .expect("retrieval should wake promptly")
        .expect("retrieval task should not panic");
    match result {
        Err(ConsumerError::Shutdown(signal)) => {
            assert!(!signal.initiated_by_broker());
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_buffered_deliveries_drain_before_shutdown_error() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]).with_prefetch_count(5));
    consumer.start().await.expect("start should succeed");

    broker.deliver("orders", "survivor").await;
    broker.shutdown("connection reset").await;

    // The buffered delivery is still handed out.
    let message = consumer.next_message().await.expect("message expected");
    assert_eq!(&message.body[..], b"survivor");

    // Only then does the captured signal surface.
    let error = consumer.next_message().await.expect_err("shutdown expected");
    assert!(matches!(error, ConsumerError::Shutdown(_)));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_retrieval_fails_fast_after_shutdown() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]));
    consumer.start().await.expect("start should succeed");

    broker.shutdown("connection reset").await;

    let error = consumer
        .next_message_timeout(Duration::from_secs(3600))
        .await
        .expect_err("shutdown expected");
    assert!(matches!(error, ConsumerError::Shutdown(_)));
}

#[tokio::test(start_paused = true)]
async fn test_broker_cancel_surfaces_as_error_not_timeout() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]));
    consumer.start().await.expect("start should succeed");
    let tag = consumer.consumer_tags().remove(0);

    assert!(broker.cancel_consumer(&tag).await);

    let error = consumer
        .next_message_timeout(Duration::from_millis(10))
        .await
        .expect_err("cancel expected");
    assert!(matches!(error, ConsumerError::Cancelled));
    assert!(error.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_window_backpressures_broker() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]).with_prefetch_count(1));
    consumer.start().await.expect("start should succeed");

    broker.deliver("orders", "first").await;
    let blocked = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.deliver("orders", "second").await })
    };
    tokio::task::yield_now().await;
    // The buffer is full, so the broker-side push is stalled.
    assert!(!blocked.is_finished());

    consumer.next_message().await.expect("message expected");
    tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .expect("push should unblock after retrieval")
        .expect("push task should not panic");
}

#[tokio::test]
async fn test_settlement_before_start_fails() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]));

    assert!(matches!(
        consumer.commit_if_necessary(false).await,
        Err(ConsumerError::NotStarted)
    ));
    let cause = std::io::Error::other("handler blew up");
    assert!(matches!(
        consumer.rollback_on_error(&cause).await,
        Err(ConsumerError::NotStarted)
    ));
}

// ----------------------------------------------------------------------
// Settlement
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_commit_acks_cumulatively_and_resets() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]).with_prefetch_count(5));
    consumer.start().await.expect("start should succeed");

    broker.deliver("orders", "one").await;
    broker.deliver("orders", "two").await;
    consumer.next_message().await.expect("message expected");
    consumer.next_message().await.expect("message expected");

    let committed = consumer
        .commit_if_necessary(false)
        .await
        .expect("commit should succeed");
    assert!(committed);

    let ops = broker
        .last_channel()
        .expect("channel should be recorded")
        .ops();
    assert!(ops.contains(&RecordedOp::Ack {
        delivery_tag: 2,
        cumulative: true,
    }));
    assert!(!ops.contains(&RecordedOp::Ack {
        delivery_tag: 1,
        cumulative: true,
    }));

    // Nothing outstanding anymore.
    let committed = consumer
        .commit_if_necessary(false)
        .await
        .expect("commit should succeed");
    assert!(!committed);
}

#[tokio::test]
async fn test_rollback_rejects_and_requeues_by_default() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]));
    consumer.start().await.expect("start should succeed");

    broker.deliver("orders", "doomed").await;
    consumer.next_message().await.expect("message expected");

    let cause = std::io::Error::other("handler blew up");
    consumer
        .rollback_on_error(&cause)
        .await
        .expect("rollback should succeed");

    let ops = broker
        .last_channel()
        .expect("channel should be recorded")
        .ops();
    assert!(ops.contains(&RecordedOp::Reject {
        delivery_tag: 1,
        requeue: true,
    }));

    // Rollback consumed the outstanding tags.
    let committed = consumer
        .commit_if_necessary(false)
        .await
        .expect("commit should succeed");
    assert!(!committed);
}

// ----------------------------------------------------------------------
// Stop
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_stop_cancels_subscriptions_and_releases_channel() {
    let broker = Arc::new(InMemoryBroker::new(["orders", "billing"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders", "billing"]));
    consumer.start().await.expect("start should succeed");

    consumer.stop().await;

    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert!(consumer.is_cancelled());
    assert!(consumer.consumer_tags().is_empty());
    assert!(consumer.channel().is_none());
    assert!(broker.subscribed_queues().is_empty());

    let channel = broker.last_channel().expect("channel should be recorded");
    assert!(!channel.is_open());
    let cancels = channel
        .ops()
        .iter()
        .filter(|op| matches!(op, RecordedOp::Cancel(_)))
        .count();
    assert_eq!(cancels, 2);
    assert_eq!(channel.ops().last(), Some(&RecordedOp::Close));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]));
    consumer.start().await.expect("start should succeed");

    consumer.stop().await;
    consumer.stop().await;

    let channel = broker.last_channel().expect("channel should be recorded");
    let closes = channel
        .ops()
        .iter()
        .filter(|op| matches!(op, RecordedOp::Close))
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn test_transactional_stop_rolls_back_prefetched_deliveries() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(
        &broker,
        ConsumerConfig::new(["orders"]).with_transactional(true),
    );
    consumer.start().await.expect("start should succeed");

    consumer.stop().await;

    let ops = broker
        .last_channel()
        .expect("channel should be recorded")
        .ops();
    let rollback = ops
        .iter()
        .position(|op| matches!(op, RecordedOp::TxRollback))
        .expect("a rollback should be issued");
    let close = ops
        .iter()
        .position(|op| matches!(op, RecordedOp::Close))
        .expect("the channel should be closed");
    assert!(rollback < close);
}

#[tokio::test]
async fn test_stop_after_broker_cancel_skips_cancellation() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]));
    consumer.start().await.expect("start should succeed");
    let tag = consumer.consumer_tags().remove(0);

    broker.cancel_consumer(&tag).await;
    consumer.stop().await;

    let ops = broker
        .last_channel()
        .expect("channel should be recorded")
        .ops();
    // The subscription is already gone; no cancel goes out.
    assert!(!ops.iter().any(|op| matches!(op, RecordedOp::Cancel(_))));
    assert_eq!(ops.last(), Some(&RecordedOp::Close));
}

#[tokio::test]
async fn test_display_summarizes_consumer() {
    let broker = Arc::new(InMemoryBroker::new(["orders"]));
    let consumer = consumer(&broker, ConsumerConfig::new(["orders"]))
        .with_tag_strategy(Arc::new(FixedTagStrategy));
    consumer.start().await.expect("start should succeed");

    let rendered = consumer.to_string();
    assert!(rendered.contains("orders-fixed"));
    assert!(rendered.contains("acknowledge_mode=auto"));
}
