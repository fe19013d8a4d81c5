//! The pull-based queue consumer: lifecycle, retrieval, and settlement
//! entry points.

use crate::buffer::DeliveryBuffer;
use crate::callback::CallbackHandler;
use crate::channel::{BrokerChannel, ChannelProvider, ConsumerCallback, TransactionCoordinator};
use crate::config::{ConsumerConfig, ConsumerTagStrategy};
use crate::counter::ActiveConsumerCounter;
use crate::error::{ChannelError, ConsumerError};
use crate::ledger::DeliveryTagLedger;
use crate::message::{Delivery, Message, MessageMaterializer};
use crate::settlement::SettlementController;
use crate::signal::{ShutdownCell, ShutdownSignal};
use crate::tracker::QueueAvailabilityTracker;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Mapping from broker-assigned consumer tag to the queue it was issued
/// for. Written by the lifecycle (subscribe) and the callback context
/// (cancel/cancel-ok) under its own lock.
#[derive(Debug, Default)]
pub(crate) struct ConsumerTagMap {
    inner: RwLock<HashMap<String, String>>,
}

impl ConsumerTagMap {
    pub(crate) fn insert(&self, consumer_tag: &str, queue: &str) {
        self.inner
            .write()
            .expect("tag map lock poisoned")
            .insert(consumer_tag.to_string(), queue.to_string());
    }

    pub(crate) fn remove(&self, consumer_tag: &str) {
        self.inner
            .write()
            .expect("tag map lock poisoned")
            .remove(consumer_tag);
    }

    pub(crate) fn queue_for(&self, consumer_tag: &str) -> Option<String> {
        self.inner
            .read()
            .expect("tag map lock poisoned")
            .get(consumer_tag)
            .cloned()
    }

    pub(crate) fn tags(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("tag map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.read().expect("tag map lock poisoned").is_empty()
    }

    pub(crate) fn clear(&self) {
        self.inner.write().expect("tag map lock poisoned").clear();
    }
}

/// Lifecycle state of a [`QueueConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    NotStarted,
    Starting,
    Running,
    Failed,
    Stopped,
}

/// Outcome of one pass over the configured queues during startup.
enum StartupError {
    /// Non-retryable: illegal arguments or a channel that closed mid-pass.
    Fatal(ConsumerError),
    /// Some queues could not be declared; retryable.
    Declaration {
        failed: Vec<String>,
        source: ChannelError,
    },
}

/// Consumer encapsulating knowledge of the broker channel and having its
/// own lifecycle.
///
/// Bridges the broker's asynchronous callback interface to a pull-based
/// API: deliveries are buffered (bounded by the prefetch count), retrieved
/// with [`next_message`]/[`next_message_timeout`], and settled through
/// [`commit_if_necessary`]/[`rollback_on_error`].
///
/// The consumer must not communicate with the broker until [`start`] is
/// called.
///
/// [`start`]: QueueConsumer::start
/// [`next_message`]: QueueConsumer::next_message
/// [`next_message_timeout`]: QueueConsumer::next_message_timeout
/// [`commit_if_necessary`]: QueueConsumer::commit_if_necessary
/// [`rollback_on_error`]: QueueConsumer::rollback_on_error
pub struct QueueConsumer {
    config: ConsumerConfig,
    provider: Arc<dyn ChannelProvider>,
    materializer: Arc<dyn MessageMaterializer>,
    coordinator: Option<Arc<dyn TransactionCoordinator>>,
    tag_strategy: Option<Arc<dyn ConsumerTagStrategy>>,
    counter: Arc<ActiveConsumerCounter>,
    settlement: SettlementController,
    buffer: Arc<DeliveryBuffer>,
    ledger: Arc<DeliveryTagLedger>,
    tags: Arc<ConsumerTagMap>,
    tracker: QueueAvailabilityTracker,
    shutdown: Arc<ShutdownCell>,
    cancelled: AtomicBool,
    cancel_received: Arc<AtomicBool>,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    handler: RwLock<Option<Arc<CallbackHandler>>>,
    state: Mutex<ConsumerState>,
    id: Uuid,
}

impl QueueConsumer {
    pub fn new(
        provider: Arc<dyn ChannelProvider>,
        materializer: Arc<dyn MessageMaterializer>,
        counter: Arc<ActiveConsumerCounter>,
        config: ConsumerConfig,
    ) -> Self {
        let ledger = Arc::new(DeliveryTagLedger::new());
        let settlement = SettlementController::new(
            config.acknowledge_mode,
            config.transactional,
            config.default_requeue_rejected,
            ledger.clone(),
        );
        let buffer = Arc::new(DeliveryBuffer::new(config.buffer_capacity()));
        let tracker = QueueAvailabilityTracker::new(config.retry_declaration_interval);
        Self {
            config,
            provider,
            materializer,
            coordinator: None,
            tag_strategy: None,
            counter,
            settlement,
            buffer,
            ledger,
            tags: Arc::new(ConsumerTagMap::default()),
            tracker,
            shutdown: Arc::new(ShutdownCell::new()),
            cancelled: AtomicBool::new(false),
            cancel_received: Arc::new(AtomicBool::new(false)),
            channel: RwLock::new(None),
            handler: RwLock::new(None),
            state: Mutex::new(ConsumerState::NotStarted),
            id: Uuid::new_v4(),
        }
    }

    /// Use a custom strategy for naming consumer tags on subscribe.
    pub fn with_tag_strategy(mut self, strategy: Arc<dyn ConsumerTagStrategy>) -> Self {
        self.tag_strategy = Some(strategy);
        self
    }

    /// Register delivery tags with an external transaction coordinator
    /// instead of acking immediately when transacted externally.
    pub fn with_transaction_coordinator(
        mut self,
        coordinator: Arc<dyn TransactionCoordinator>,
    ) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    // ------------------------------------------------------------------
    // Status surface
    // ------------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// The main channel, once started.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel
            .read()
            .expect("channel lock poisoned")
            .clone()
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.tags.tags()
    }

    /// Whether at least one delivery is currently buffered.
    pub fn has_delivery(&self) -> bool {
        self.buffer.has_delivery()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Queues configured but not currently subscribed, pending recheck.
    pub async fn missing_queues(&self) -> Vec<String> {
        self.tracker.missing().await
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the consumer: acquire the channel, declare the configured
    /// queues (with bounded retry and degraded-mode fallback), set the
    /// prefetch window, and subscribe.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        debug!(consumer = %self, "starting consumer");
        self.set_state(ConsumerState::Starting);

        let channel = match self.provider.create_channel(self.config.transactional).await {
            Ok(channel) => channel,
            Err(ChannelError::AuthenticationFailure { message }) => {
                self.set_state(ConsumerState::Failed);
                return Err(ConsumerError::FatalStartup {
                    message: "authentication failure".to_string(),
                    source: Some(ChannelError::AuthenticationFailure { message }),
                });
            }
            Err(error) => {
                self.set_state(ConsumerState::Failed);
                return Err(error.into());
            }
        };
        *self.channel.write().expect("channel lock poisoned") = Some(channel.clone());

        let handler = Arc::new(CallbackHandler::new(
            self.buffer.clone(),
            self.ledger.clone(),
            self.tags.clone(),
            self.shutdown.clone(),
            self.cancel_received.clone(),
            self.counter.clone(),
            self.id,
        ));
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
        self.ledger.clear();
        self.counter.add(self.id);

        // A mirrored queue might be in the middle of being moved, so a
        // failed declaration is retried before giving up on the queue.
        let mut retries_left = self.config.declaration_retries;
        loop {
            match self.attempt_passive_declarations(channel.as_ref()).await {
                Ok(()) => {
                    if retries_left < self.config.declaration_retries {
                        info!("queue declaration succeeded after retrying");
                    }
                    break;
                }
                Err(StartupError::Fatal(error)) => {
                    self.counter.release(self.id);
                    self.set_state(ConsumerState::Failed);
                    return Err(error);
                }
                Err(StartupError::Declaration { failed, source }) => {
                    if retries_left > 0 && channel.is_open() {
                        warn!(
                            retries_left,
                            queues = ?failed,
                            "queue declaration failed; retrying"
                        );
                        retries_left -= 1;
                        tokio::time::sleep(self.config.failed_declaration_retry_interval).await;
                    } else if failed.len() < self.config.queues.len() {
                        warn!(
                            configured = ?self.config.queues,
                            unavailable = ?failed,
                            "not all queues are available; only listening on those that are"
                        );
                        self.tracker.mark_missing(failed).await;
                        break;
                    } else {
                        self.counter.release(self.id);
                        self.set_state(ConsumerState::Failed);
                        return Err(ConsumerError::QueuesNotAvailable {
                            queues: failed,
                            source: Some(source),
                        });
                    }
                }
            }
        }

        if !self.config.acknowledge_mode.is_auto_ack() {
            // Set the QoS window before the first subscribe; otherwise the
            // broker pushes a large default batch before the limit applies.
            if let Err(error) = channel.set_prefetch(self.config.prefetch_count).await {
                self.counter.release(self.id);
                self.set_state(ConsumerState::Failed);
                return Err(ConsumerError::FatalStartup {
                    message: "failed to set prefetch count".to_string(),
                    source: Some(error),
                });
            }
        }

        for queue in &self.config.queues {
            if !self.tracker.is_missing(queue).await {
                if let Err(error) = self.consume_from_queue(queue).await {
                    self.set_state(ConsumerState::Failed);
                    return Err(error);
                }
            }
        }

        self.set_state(ConsumerState::Running);
        Ok(())
    }

    /// One declaration pass over every configured queue, collecting the
    /// failures so a partial outcome can be distinguished from a total one.
    async fn attempt_passive_declarations(
        &self,
        channel: &dyn BrokerChannel,
    ) -> Result<(), StartupError> {
        let mut failed = Vec::new();
        let mut last_error = None;
        for queue in &self.config.queues {
            match channel.declare_queue_passive(queue).await {
                Ok(()) => {}
                Err(ChannelError::IllegalArgument { message }) => {
                    if let Err(error) = channel.close().await {
                        debug!(%error, "error closing channel after illegal argument");
                    }
                    return Err(StartupError::Fatal(ConsumerError::FatalStartup {
                        message: "illegal argument on queue declaration".to_string(),
                        source: Some(ChannelError::IllegalArgument { message }),
                    }));
                }
                Err(error) => {
                    warn!(queue, "failed to declare queue");
                    if !channel.is_open() {
                        // Further declarations on a dead channel cannot
                        // succeed.
                        return Err(StartupError::Fatal(ConsumerError::FatalStartup {
                            message: "channel closed during queue declaration".to_string(),
                            source: Some(error),
                        }));
                    }
                    failed.push(queue.clone());
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(source) => Err(StartupError::Declaration { failed, source }),
            None => Ok(()),
        }
    }

    async fn consume_from_queue(&self, queue: &str) -> Result<(), ConsumerError> {
        let channel = self.channel().ok_or(ConsumerError::NotStarted)?;
        let callback: Arc<dyn ConsumerCallback> = self
            .handler
            .read()
            .expect("handler lock poisoned")
            .clone()
            .ok_or(ConsumerError::NotStarted)?;
        let requested_tag = self
            .tag_strategy
            .as_ref()
            .map(|strategy| strategy.consumer_tag(queue))
            .unwrap_or_default();
        let assigned = channel
            .subscribe(
                queue,
                self.config.acknowledge_mode.is_auto_ack(),
                &requested_tag,
                self.config.exclusive,
                &self.config.consumer_args,
                callback,
            )
            .await?;
        match assigned {
            Some(consumer_tag) => {
                self.tags.insert(&consumer_tag, queue);
                debug!(queue, consumer_tag, "started consuming");
            }
            None => error!(queue, "no consumer tag received for queue"),
        }
        Ok(())
    }

    /// Stop the consumer: cancel subscriptions, release the channel, and
    /// discard outstanding tags. Idempotent; errors from an already-closed
    /// channel are logged, not propagated.
    ///
    /// A retrieval call blocked in [`next_message`](Self::next_message) wakes
    /// with [`ConsumerError::Shutdown`] once the buffer is drained.
    pub async fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Wake any blocked retrieval. If the broker already captured a
        // signal, that earlier one is kept.
        self.shutdown
            .set(ShutdownSignal::new("consumer stopped", false));
        let channel = self.channel.write().expect("channel lock poisoned").take();
        if let Some(channel) = channel {
            if !self.tags.is_empty() && !self.cancel_received.load(Ordering::SeqCst) {
                for consumer_tag in self.tags.tags() {
                    match channel.cancel_subscription(&consumer_tag).await {
                        Ok(()) => {}
                        Err(ChannelError::AlreadyClosed) => {
                            trace!("channel is already closed");
                            break;
                        }
                        Err(error) => {
                            debug!(%error, consumer_tag, "error cancelling subscription");
                        }
                    }
                }
                if self.config.transactional {
                    // Returns prefetched-but-unprocessed deliveries to the
                    // broker.
                    if let Err(error) = channel.tx_rollback().await {
                        debug!(%error, "error rolling back transaction during stop");
                    }
                }
            }
            debug!(consumer = %self, "releasing channel");
            self.provider.release(channel).await;
        }
        *self.handler.write().expect("handler lock poisoned") = None;
        self.tags.clear();
        // Outstanding tags are meaningless once the channel is released.
        self.ledger.clear();
        self.set_state(ConsumerState::Stopped);
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Wait indefinitely for the next message.
    ///
    /// A delivery that is already buffered is returned even after a channel
    /// shutdown; once the buffer is empty the captured [`ShutdownSignal`]
    /// is raised instead of waiting forever on a dead channel.
    ///
    /// [`ShutdownSignal`]: crate::signal::ShutdownSignal
    pub async fn next_message(&self) -> Result<Message, ConsumerError> {
        trace!(consumer = %self, "retrieving delivery");
        tokio::select! {
            biased;
            delivery = self.buffer.take() => self.handle_delivery(delivery),
            signal = self.shutdown.signalled() => Err(ConsumerError::Shutdown(signal)),
        }
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Fails immediately if a shutdown signal was already captured. When
    /// queues are pending recheck, the availability probe piggybacks on
    /// this call rather than needing a timer thread. A timeout with a
    /// broker-initiated cancel pending reports [`ConsumerError::Cancelled`]
    /// rather than an empty result; a plain timeout is `Ok(None)`.
    pub async fn next_message_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Message>, ConsumerError> {
        trace!(consumer = %self, "retrieving delivery");
        if let Some(signal) = self.shutdown.get() {
            return Err(ConsumerError::Shutdown(signal.clone()));
        }
        if self.tracker.has_missing().await {
            self.check_missing_queues().await?;
        }
        let delivery = tokio::select! {
            biased;
            delivery = self.buffer.poll(timeout) => delivery,
            signal = self.shutdown.signalled() => return Err(ConsumerError::Shutdown(signal)),
        };
        match delivery {
            Some(delivery) => Ok(Some(self.handle_delivery(delivery)?)),
            None => {
                if self.cancel_received.load(Ordering::SeqCst) {
                    Err(ConsumerError::Cancelled)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Materialize a dequeued delivery and record its tag.
    fn handle_delivery(&self, delivery: Delivery) -> Result<Message, ConsumerError> {
        let Delivery {
            consumer_tag,
            envelope,
            properties,
            body,
        } = delivery;
        let mut message = self
            .materializer
            .to_application_message(body, &properties, &envelope)?;
        message.properties.consumer_queue = self.tags.queue_for(&consumer_tag);
        message.properties.consumer_tag = Some(consumer_tag);
        debug!(%message, "received message");
        // Recorded before the caller ever sees the message, so a crash in
        // the application cannot leave an untracked delivery.
        self.ledger.record(envelope.delivery_tag);
        Ok(message)
    }

    /// Probe missing queues and bring newly-available ones live without
    /// disturbing existing subscriptions.
    async fn check_missing_queues(&self) -> Result<(), ConsumerError> {
        let newly_available = self.tracker.probe_missing(self.provider.as_ref()).await;
        for queue in newly_available {
            self.consume_from_queue(&queue).await?;
            self.tracker.mark_available(&queue).await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------

    /// Perform a commit or cumulative acknowledgment, as appropriate for
    /// the acknowledge mode and transaction ownership. Returns whether any
    /// delivery was outstanding.
    pub async fn commit_if_necessary(
        &self,
        locally_transacted: bool,
    ) -> Result<bool, ConsumerError> {
        let channel = self.channel().ok_or(ConsumerError::NotStarted)?;
        self.settlement
            .commit(
                channel.as_ref(),
                self.coordinator.as_deref(),
                locally_transacted,
            )
            .await
    }

    /// Roll back on an application-reported failure, rejecting outstanding
    /// deliveries with the requeue policy decided from the cause chain.
    pub async fn rollback_on_error(
        &self,
        cause: &(dyn StdError + 'static),
    ) -> Result<(), ConsumerError> {
        let channel = self.channel().ok_or(ConsumerError::NotStarted)?;
        self.settlement.rollback(channel.as_ref(), cause).await
    }
}

impl fmt::Display for QueueConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Consumer[tags={:?}, acknowledge_mode={}, buffered={}]",
            self.tags.tags(),
            self.config.acknowledge_mode,
            self.buffer.len()
        )
    }
}
