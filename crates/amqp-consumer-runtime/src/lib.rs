//! # AMQP Consumer Runtime
//!
//! Consumer-side runtime bridging an asynchronous message-broker callback
//! interface to a pull-based application API.
//!
//! This library provides:
//! - A bounded delivery buffer sized to the prefetch count (backpressure)
//! - Delivery-tag tracking with cumulative acknowledgment and per-tag
//!   rejection
//! - Transactional commit/rollback settlement, including deferred
//!   registration with an external transaction coordinator
//! - Startup declaration retry with degraded-mode operation and periodic
//!   re-check of missing queues
//! - Shutdown and cancel propagation from the broker-callback context to
//!   blocked retrieval calls
//!
//! ## Module Organization
//!
//! - [`error`] - Error types and requeue-decision markers
//! - [`signal`] - Shutdown-signal capture
//! - [`message`] - Delivery/message types and the materializer seam
//! - [`config`] - Consumer configuration
//! - [`channel`] - Broker collaborator traits
//! - [`buffer`] - Bounded delivery hand-off
//! - [`ledger`] - Outstanding delivery tags
//! - [`tracker`] - Missing-queue availability recheck
//! - [`settlement`] - Acknowledgment and rollback protocol
//! - [`counter`] - Active-consumer tracking for an owning container
//! - [`consumer`] - The consumer lifecycle and retrieval API
//! - [`memory`] - In-memory broker for testing and development

// Module declarations
pub mod buffer;
mod callback;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod counter;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod message;
pub mod settlement;
pub mod signal;
pub mod tracker;

// Re-export commonly used types at crate root for convenience
pub use buffer::DeliveryBuffer;
pub use channel::{BrokerChannel, ChannelProvider, ConsumerCallback, TransactionCoordinator};
pub use config::{AcknowledgeMode, ConsumerConfig, ConsumerTagStrategy, UuidTagStrategy};
pub use consumer::{ConsumerState, QueueConsumer};
pub use counter::ActiveConsumerCounter;
pub use error::{
    ChannelError, ConsumerError, MaterializeError, RejectAndDontRequeue, RejectedWhileStopping,
};
pub use ledger::DeliveryTagLedger;
pub use memory::{InMemoryBroker, InMemoryChannel, RecordedOp};
pub use message::{
    DefaultMaterializer, Delivery, DeliveryProperties, Envelope, Message, MessageMaterializer,
    MessageProperties,
};
pub use settlement::SettlementController;
pub use signal::{ShutdownCell, ShutdownSignal};
pub use tracker::QueueAvailabilityTracker;
