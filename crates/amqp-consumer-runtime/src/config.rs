//! Consumer configuration surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// How deliveries are settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcknowledgeMode {
    /// The broker considers deliveries acknowledged as soon as they are
    /// pushed; the runtime tracks nothing.
    None,
    /// The application settles deliveries itself; the runtime tracks tags
    /// but never acks on its own.
    Manual,
    /// The runtime acknowledges after successful processing (cumulative ack
    /// on the highest outstanding tag).
    Auto,
}

impl AcknowledgeMode {
    pub fn is_auto_ack(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }

    /// Whether the runtime itself is responsible for issuing acks/rejects.
    pub fn is_ack_required(&self) -> bool {
        matches!(self, Self::Auto)
    }
}

impl fmt::Display for AcknowledgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Manual => write!(f, "manual"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Strategy for naming the consumer tag requested on subscribe.
pub trait ConsumerTagStrategy: Send + Sync {
    fn consumer_tag(&self, queue: &str) -> String;
}

/// Default strategy: queue name plus a random suffix, so multiple consumers
/// on the same queue stay distinguishable in broker tooling.
#[derive(Debug, Default)]
pub struct UuidTagStrategy;

impl ConsumerTagStrategy for UuidTagStrategy {
    fn consumer_tag(&self, queue: &str) -> String {
        format!("{}-{}", queue, uuid::Uuid::new_v4())
    }
}

/// Configuration for a [`QueueConsumer`](crate::consumer::QueueConsumer).
///
/// The consumer must not communicate with the broker until `start` is
/// called; construction is side-effect free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Queues to subscribe to, in subscription order.
    pub queues: Vec<String>,
    pub acknowledge_mode: AcknowledgeMode,
    /// Whether the channel participates in broker transactions.
    pub transactional: bool,
    /// Maximum unacknowledged deliveries in flight; also the capacity of
    /// the hand-off buffer.
    pub prefetch_count: u32,
    /// Whether deliveries rejected on rollback are requeued by default.
    pub default_requeue_rejected: bool,
    pub exclusive: bool,
    /// Extra subscription arguments (e.g. `x-priority`).
    pub consumer_args: HashMap<String, Value>,
    /// Passive-declaration attempts during startup.
    pub declaration_retries: u32,
    /// Pause between failed startup declaration attempts.
    pub failed_declaration_retry_interval: Duration,
    /// Minimum spacing between missing-queue recheck cycles.
    pub retry_declaration_interval: Duration,
}

impl ConsumerConfig {
    pub fn new(queues: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            acknowledge_mode: AcknowledgeMode::Auto,
            transactional: false,
            prefetch_count: 1,
            default_requeue_rejected: true,
            exclusive: false,
            consumer_args: HashMap::new(),
            declaration_retries: 3,
            failed_declaration_retry_interval: Duration::from_millis(5000),
            retry_declaration_interval: Duration::from_secs(60),
        }
    }

    pub fn with_acknowledge_mode(mut self, mode: AcknowledgeMode) -> Self {
        self.acknowledge_mode = mode;
        self
    }

    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_default_requeue_rejected(mut self, requeue: bool) -> Self {
        self.default_requeue_rejected = requeue;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_consumer_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.consumer_args.insert(key.into(), value);
        self
    }

    pub fn with_declaration_retries(mut self, retries: u32) -> Self {
        self.declaration_retries = retries;
        self
    }

    pub fn with_failed_declaration_retry_interval(mut self, interval: Duration) -> Self {
        self.failed_declaration_retry_interval = interval;
        self
    }

    pub fn with_retry_declaration_interval(mut self, interval: Duration) -> Self {
        self.retry_declaration_interval = interval;
        self
    }

    /// Buffer capacity derived from the prefetch count; a prefetch of zero
    /// (broker "unlimited") still needs a non-zero buffer.
    pub(crate) fn buffer_capacity(&self) -> usize {
        (self.prefetch_count as usize).max(1)
    }
}
