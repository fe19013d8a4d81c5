//! Collaborator traits: the abstract broker channel, the channel provider,
//! the callback sink registered with a subscription, and the external
//! transaction coordinator.
//!
//! Wire protocol, framing, and connection pooling live behind these traits;
//! the runtime only depends on the operations declared here.

use crate::error::ChannelError;
use crate::message::Delivery;
use crate::signal::ShutdownSignal;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Event sink registered with the broker channel for one subscription.
///
/// The broker-callback execution context is the only caller of these
/// methods; implementations translate the events into shared state read by
/// the consumer side.
#[async_trait]
pub trait ConsumerCallback: Send + Sync {
    /// An incoming delivery. May block (backpressure) until the application
    /// side keeps pace.
    async fn on_delivery(&self, delivery: Delivery);

    /// Broker-initiated cancellation of one subscription (e.g. queue
    /// deleted out from under the consumer).
    async fn on_cancel(&self, consumer_tag: &str);

    /// Acknowledgment of an application-initiated cancellation.
    async fn on_cancel_ok(&self, consumer_tag: &str);

    /// Confirmation that a subscription is live.
    async fn on_consume_ok(&self, consumer_tag: &str);

    /// The channel was torn down underneath the consumer.
    async fn on_shutdown(&self, signal: ShutdownSignal);
}

/// Operations the runtime needs from a broker channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Non-mutating existence check for a named queue.
    async fn declare_queue_passive(&self, queue: &str) -> Result<(), ChannelError>;

    /// Register a consumer on a queue. Returns the broker-assigned consumer
    /// tag, or `None` if the broker failed to assign one.
    async fn subscribe(
        &self,
        queue: &str,
        auto_ack: bool,
        consumer_tag: &str,
        exclusive: bool,
        args: &HashMap<String, Value>,
        callback: Arc<dyn ConsumerCallback>,
    ) -> Result<Option<String>, ChannelError>;

    /// Cancel one subscription by consumer tag.
    async fn cancel_subscription(&self, consumer_tag: &str) -> Result<(), ChannelError>;

    /// Set the prefetch/QoS window. Must be called before the first
    /// subscribe when the runtime is responsible for acks.
    async fn set_prefetch(&self, count: u32) -> Result<(), ChannelError>;

    /// Acknowledge a delivery tag; `cumulative` settles all lower
    /// outstanding tags as well.
    async fn acknowledge(&self, delivery_tag: u64, cumulative: bool) -> Result<(), ChannelError>;

    /// Reject a single delivery tag, optionally requeueing it.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError>;

    async fn tx_commit(&self) -> Result<(), ChannelError>;

    async fn tx_rollback(&self) -> Result<(), ChannelError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), ChannelError>;
}

/// Source of broker channels.
///
/// The main channel is exclusively owned by one consumer for its lifetime.
/// Throwaway channels exist so that a failed passive declaration cannot
/// disturb the main channel; they are created, used, and closed within a
/// single recheck cycle.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Acquire the consumer's main channel, transactional if requested.
    async fn create_channel(
        &self,
        transactional: bool,
    ) -> Result<Arc<dyn BrokerChannel>, ChannelError>;

    /// Acquire a short-lived channel for availability probes.
    async fn create_throwaway_channel(&self) -> Result<Arc<dyn BrokerChannel>, ChannelError>;

    /// Release a channel previously acquired from this provider. Best
    /// effort; errors are not propagated.
    async fn release(&self, channel: Arc<dyn BrokerChannel>) {
        if let Err(error) = channel.close().await {
            tracing::debug!(%error, "error releasing channel");
        }
    }
}

/// External transaction coordinator.
///
/// When the channel is transactional but the transaction is driven by an
/// outer coordinator, outstanding delivery tags are registered here for
/// deferred settlement instead of being acknowledged immediately.
#[async_trait]
pub trait TransactionCoordinator: Send + Sync {
    async fn register_delivery_tag(&self, delivery_tag: u64) -> Result<(), ChannelError>;
}
