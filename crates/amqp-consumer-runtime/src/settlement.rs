//! Settlement protocol: acknowledgment on the success path, rejection and
//! transaction rollback on the failure path.

use crate::channel::{BrokerChannel, TransactionCoordinator};
use crate::config::AcknowledgeMode;
use crate::error::{chain_contains_dont_requeue, ConsumerError, RejectedWhileStopping};
use crate::ledger::DeliveryTagLedger;
use std::error::Error as StdError;
use std::sync::Arc;
use tracing::{debug, error};

#[cfg(test)]
#[path = "settlement_tests.rs"]
mod tests;

/// Decide whether rejected deliveries should be requeued.
///
/// Starts from the configured default, suppressed when the failure itself
/// is a "rejected while stopping" condition or when any node of the cause
/// chain carries the no-requeue marker. The full chain is walked, so a
/// wrapped rejection still suppresses requeue.
pub fn should_requeue(default_requeue: bool, cause: &(dyn StdError + 'static)) -> bool {
    if !default_requeue {
        return false;
    }
    if cause.is::<RejectedWhileStopping>() {
        return false;
    }
    !chain_contains_dont_requeue(cause)
}

/// Consumes the [`DeliveryTagLedger`] to settle outstanding deliveries.
///
/// The ledger is cleared unconditionally when either path returns, success
/// or failure: tags must never survive a settlement cycle.
#[derive(Debug)]
pub struct SettlementController {
    acknowledge_mode: AcknowledgeMode,
    transactional: bool,
    default_requeue_rejected: bool,
    ledger: Arc<DeliveryTagLedger>,
}

impl SettlementController {
    pub fn new(
        acknowledge_mode: AcknowledgeMode,
        transactional: bool,
        default_requeue_rejected: bool,
        ledger: Arc<DeliveryTagLedger>,
    ) -> Self {
        Self {
            acknowledge_mode,
            transactional,
            default_requeue_rejected,
            ledger,
        }
    }

    /// Success path: commit or acknowledge as appropriate.
    ///
    /// Returns `false` when nothing was outstanding. When acknowledgment is
    /// required, either registers every tag with the external coordinator
    /// (transactional but not locally transacted; an absent coordinator is
    /// [`ConsumerError::MissingCoordinator`]) or issues one cumulative ack
    /// on the highest tag; acking the highest tag settles all lower unacked
    /// tags atomically, so tags are never acked individually.
    pub async fn commit(
        &self,
        channel: &dyn BrokerChannel,
        coordinator: Option<&dyn TransactionCoordinator>,
        locally_transacted: bool,
    ) -> Result<bool, ConsumerError> {
        if self.ledger.is_empty() {
            return Ok(false);
        }

        let result = self
            .commit_outstanding(channel, coordinator, locally_transacted)
            .await;
        self.ledger.clear();
        result.map(|_| true)
    }

    async fn commit_outstanding(
        &self,
        channel: &dyn BrokerChannel,
        coordinator: Option<&dyn TransactionCoordinator>,
        locally_transacted: bool,
    ) -> Result<(), ConsumerError> {
        if self.acknowledge_mode.is_ack_required() {
            if self.transactional && !locally_transacted {
                // The outer coordinator decides final ack/rollback timing;
                // hand the tags over instead of settling now. Without a
                // coordinator the tags would be silently discarded.
                let coordinator = coordinator.ok_or(ConsumerError::MissingCoordinator)?;
                for delivery_tag in self.ledger.snapshot() {
                    coordinator.register_delivery_tag(delivery_tag).await?;
                }
            } else if let Some(highest) = self.ledger.highest() {
                debug!(delivery_tag = highest, "acknowledging cumulatively");
                channel.acknowledge(highest, true).await?;
            }
        }

        if locally_transacted {
            // Manual acks still need the transaction committed.
            channel.tx_commit().await?;
        }

        Ok(())
    }

    /// Failure path: roll back and reject outstanding deliveries.
    ///
    /// A failure while rolling back overrides the original application
    /// failure in propagation, since it indicates the broker-side state has
    /// diverged from local expectations.
    pub async fn rollback(
        &self,
        channel: &dyn BrokerChannel,
        cause: &(dyn StdError + 'static),
    ) -> Result<(), ConsumerError> {
        let result = self.rollback_outstanding(channel, cause).await;
        self.ledger.clear();
        if let Err(rollback_error) = result {
            error!(
                application_error = %cause,
                "application error overridden by rollback error"
            );
            return Err(rollback_error);
        }
        Ok(())
    }

    async fn rollback_outstanding(
        &self,
        channel: &dyn BrokerChannel,
        cause: &(dyn StdError + 'static),
    ) -> Result<(), ConsumerError> {
        if self.transactional {
            debug!(%cause, "initiating transaction rollback on application error");
            channel.tx_rollback().await?;
        }

        if self.acknowledge_mode.is_ack_required() {
            let requeue = should_requeue(self.default_requeue_rejected, cause);
            debug!(requeue, "rejecting outstanding deliveries");
            // Cumulative settlement only exists for positive acks; rejects
            // go out one tag at a time.
            for delivery_tag in self.ledger.snapshot() {
                channel.reject(delivery_tag, requeue).await?;
            }
            if self.transactional {
                // The rejection itself is a transactional step.
                channel.tx_commit().await?;
            }
        }

        Ok(())
    }
}
