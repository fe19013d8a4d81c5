//! Error types for the consumer runtime.

use crate::signal::ShutdownSignal;
use std::error::Error as StdError;
use thiserror::Error;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

/// Errors surfaced to the owner of a consumer.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The broker tore down the channel. Captured by the callback context
    /// and raised at the next retrieval call.
    #[error("channel shut down: {0}")]
    Shutdown(ShutdownSignal),

    /// The broker revoked this consumer's subscription (e.g. the queue was
    /// deleted). Distinct from an empty-timeout result.
    #[error("consumer cancelled by the broker")]
    Cancelled,

    /// Non-retryable startup failure: authentication, illegal subscription
    /// arguments, or a channel that closed mid-declaration.
    #[error("fatal startup failure: {message}")]
    FatalStartup {
        message: String,
        #[source]
        source: Option<ChannelError>,
    },

    /// None of the configured queues could be declared after exhausting all
    /// retry attempts.
    #[error("queues not available: {queues:?}; either they do not exist or the broker will not allow their use")]
    QueuesNotAvailable {
        queues: Vec<String>,
        #[source]
        source: Option<ChannelError>,
    },

    /// A broker channel operation failed at runtime.
    #[error("channel operation failed: {0}")]
    Channel(#[from] ChannelError),

    /// A raw delivery could not be translated into an application message.
    #[error("failed to materialize delivery: {0}")]
    Materialize(#[from] MaterializeError),

    /// The channel is transactional and the transaction is externally
    /// driven, but no coordinator was configured to take over the
    /// outstanding tags.
    #[error("no transaction coordinator configured for externally transacted settlement")]
    MissingCoordinator,

    /// An operation that needs a live channel was invoked before `start`
    /// or after `stop`.
    #[error("consumer is not started")]
    NotStarted,
}

impl ConsumerError {
    /// Whether this error permanently ends the consumer's usefulness.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Shutdown(_) => true,
            Self::Cancelled => true,
            Self::FatalStartup { .. } => true,
            Self::QueuesNotAvailable { .. } => true,
            Self::Channel(_) => false,
            Self::Materialize(_) => false,
            // A configuration mistake, but one the owner can repair without
            // restarting the consumer.
            Self::MissingCoordinator => false,
            Self::NotStarted => false,
        }
    }
}

/// Errors reported by the broker-channel collaborator.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("queue not found: {queue}")]
    NotFound { queue: String },

    #[error("authentication failed: {message}")]
    AuthenticationFailure { message: String },

    #[error("illegal argument: {message}")]
    IllegalArgument { message: String },

    #[error("channel is already closed")]
    AlreadyClosed,

    #[error("broker i/o failure: {message}")]
    Io { message: String },
}

/// Errors from the message-materializer collaborator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct MaterializeError {
    pub message: String,
}

impl MaterializeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Marker failure: reject the outstanding deliveries and do not requeue
/// them, regardless of the default requeue policy. Honored anywhere in a
/// cause chain, not just at the top.
#[derive(Debug, Error)]
#[error("rejected without requeue: {message}")]
pub struct RejectAndDontRequeue {
    pub message: String,
}

impl RejectAndDontRequeue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Marker failure raised when a delivery is rejected because the consumer
/// is stopping; suppresses requeue like [`RejectAndDontRequeue`], but only
/// when it is the reported failure itself.
#[derive(Debug, Error)]
#[error("message rejected while consumer is stopping")]
pub struct RejectedWhileStopping;

/// Walk a cause chain looking for any [`RejectAndDontRequeue`] node.
pub(crate) fn chain_contains_dont_requeue(cause: &(dyn StdError + 'static)) -> bool {
    let mut next: Option<&(dyn StdError + 'static)> = Some(cause);
    while let Some(err) = next {
        if err.is::<RejectAndDontRequeue>() {
            return true;
        }
        next = err.source();
    }
    false
}
