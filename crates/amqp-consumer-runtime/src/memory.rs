//! In-memory broker implementation for testing and development.
//!
//! Provides a scriptable [`ChannelProvider`]/[`BrokerChannel`] pair that
//! records every channel operation, so consumer behavior can be asserted
//! without a live broker:
//! - queues can be added and removed while a consumer is running,
//! - deliveries are injected directly into a subscription's callback,
//! - broker-initiated cancel and shutdown can be simulated,
//! - authentication failures can be forced.

use crate::channel::{BrokerChannel, ChannelProvider, ConsumerCallback};
use crate::error::ChannelError;
use crate::message::{Delivery, DeliveryProperties, Envelope};
use crate::signal::ShutdownSignal;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// A channel operation observed by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    DeclarePassive(String),
    Subscribe {
        queue: String,
        consumer_tag: String,
        auto_ack: bool,
    },
    Cancel(String),
    Prefetch(u32),
    Ack {
        delivery_tag: u64,
        cumulative: bool,
    },
    Reject {
        delivery_tag: u64,
        requeue: bool,
    },
    TxCommit,
    TxRollback,
    Close,
}

struct Subscription {
    queue: String,
    callback: Arc<dyn ConsumerCallback>,
}

/// Broker-wide state shared by every channel.
struct BrokerState {
    queues: RwLock<HashSet<String>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    next_consumer_tag: AtomicU64,
    next_delivery_tag: AtomicU64,
    fail_authentication: AtomicBool,
}

/// In-memory [`ChannelProvider`] implementation.
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
    main_channels: Mutex<Vec<Arc<InMemoryChannel>>>,
    throwaway_channels: Mutex<Vec<Arc<InMemoryChannel>>>,
}

impl InMemoryBroker {
    pub fn new(queues: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: RwLock::new(queues.into_iter().map(Into::into).collect()),
                subscriptions: Mutex::new(HashMap::new()),
                next_consumer_tag: AtomicU64::new(1),
                next_delivery_tag: AtomicU64::new(1),
                fail_authentication: AtomicBool::new(false),
            }),
            main_channels: Mutex::new(Vec::new()),
            throwaway_channels: Mutex::new(Vec::new()),
        }
    }

    pub fn add_queue(&self, queue: impl Into<String>) {
        self.state
            .queues
            .write()
            .expect("queue set lock poisoned")
            .insert(queue.into());
    }

    pub fn remove_queue(&self, queue: &str) {
        self.state
            .queues
            .write()
            .expect("queue set lock poisoned")
            .remove(queue);
    }

    /// Force subsequent channel acquisitions to fail authentication.
    pub fn set_fail_authentication(&self, fail: bool) {
        self.state.fail_authentication.store(fail, Ordering::SeqCst);
    }

    /// Push one delivery to whichever subscription is consuming `queue`.
    /// Blocks while the consumer's buffer is full, exactly like a broker
    /// socket under backpressure. Returns `false` when nothing is
    /// subscribed to the queue.
    pub async fn deliver(&self, queue: &str, body: impl Into<Bytes>) -> bool {
        let target = {
            let subscriptions = self
                .state
                .subscriptions
                .lock()
                .expect("subscription lock poisoned");
            subscriptions
                .iter()
                .find(|(_, subscription)| subscription.queue == queue)
                .map(|(tag, subscription)| (tag.clone(), subscription.callback.clone()))
        };
        let Some((consumer_tag, callback)) = target else {
            return false;
        };
        let delivery_tag = self.state.next_delivery_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery::new(
            &consumer_tag,
            Envelope::new(delivery_tag, false, "", queue),
            DeliveryProperties::default(),
            body.into(),
        );
        callback.on_delivery(delivery).await;
        true
    }

    /// Simulate a broker-initiated cancel of one subscription.
    pub async fn cancel_consumer(&self, consumer_tag: &str) -> bool {
        let callback = self
            .state
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .remove(consumer_tag)
            .map(|subscription| subscription.callback);
        match callback {
            Some(callback) => {
                callback.on_cancel(consumer_tag).await;
                true
            }
            None => false,
        }
    }

    /// Simulate the broker tearing down the connection: every subscription
    /// receives a shutdown signal and every channel is closed.
    pub async fn shutdown(&self, reason: &str) {
        let callbacks: Vec<Arc<dyn ConsumerCallback>> = {
            let mut subscriptions = self
                .state
                .subscriptions
                .lock()
                .expect("subscription lock poisoned");
            subscriptions
                .drain()
                .map(|(_, subscription)| subscription.callback)
                .collect()
        };
        for channel in self.channels() {
            channel.open.store(false, Ordering::SeqCst);
        }
        for callback in callbacks {
            callback
                .on_shutdown(ShutdownSignal::new(reason, true))
                .await;
        }
    }

    /// Every main channel handed out so far, oldest first.
    pub fn channels(&self) -> Vec<Arc<InMemoryChannel>> {
        self.main_channels
            .lock()
            .expect("channel list lock poisoned")
            .clone()
    }

    /// The most recently acquired main channel.
    pub fn last_channel(&self) -> Option<Arc<InMemoryChannel>> {
        self.main_channels
            .lock()
            .expect("channel list lock poisoned")
            .last()
            .cloned()
    }

    /// Number of throwaway channels handed out for availability probes.
    pub fn throwaway_count(&self) -> usize {
        self.throwaway_channels
            .lock()
            .expect("channel list lock poisoned")
            .len()
    }

    pub fn subscribed_queues(&self) -> Vec<String> {
        let subscriptions = self
            .state
            .subscriptions
            .lock()
            .expect("subscription lock poisoned");
        let mut queues: Vec<String> = subscriptions
            .values()
            .map(|subscription| subscription.queue.clone())
            .collect();
        queues.sort();
        queues
    }

    fn new_channel(&self, transactional: bool) -> Arc<InMemoryChannel> {
        Arc::new(InMemoryChannel {
            state: self.state.clone(),
            open: AtomicBool::new(true),
            transactional,
            ops: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChannelProvider for InMemoryBroker {
    async fn create_channel(
        &self,
        transactional: bool,
    ) -> Result<Arc<dyn BrokerChannel>, ChannelError> {
        if self.state.fail_authentication.load(Ordering::SeqCst) {
            return Err(ChannelError::AuthenticationFailure {
                message: "invalid credentials".to_string(),
            });
        }
        let channel = self.new_channel(transactional);
        self.main_channels
            .lock()
            .expect("channel list lock poisoned")
            .push(channel.clone());
        Ok(channel)
    }

    async fn create_throwaway_channel(&self) -> Result<Arc<dyn BrokerChannel>, ChannelError> {
        if self.state.fail_authentication.load(Ordering::SeqCst) {
            return Err(ChannelError::AuthenticationFailure {
                message: "invalid credentials".to_string(),
            });
        }
        let channel = self.new_channel(false);
        self.throwaway_channels
            .lock()
            .expect("channel list lock poisoned")
            .push(channel.clone());
        Ok(channel)
    }
}

/// In-memory [`BrokerChannel`] implementation recording every operation.
pub struct InMemoryChannel {
    state: Arc<BrokerState>,
    open: AtomicBool,
    transactional: bool,
    ops: Mutex<Vec<RecordedOp>>,
}

impl InMemoryChannel {
    /// Operations issued on this channel, in order.
    pub fn ops(&self) -> Vec<RecordedOp> {
        self.ops.lock().expect("op log lock poisoned").clone()
    }

    fn record(&self, op: RecordedOp) {
        self.ops.lock().expect("op log lock poisoned").push(op);
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChannelError::AlreadyClosed)
        }
    }

    fn queue_exists(&self, queue: &str) -> bool {
        self.state
            .queues
            .read()
            .expect("queue set lock poisoned")
            .contains(queue)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue_passive(&self, queue: &str) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.record(RecordedOp::DeclarePassive(queue.to_string()));
        if self.queue_exists(queue) {
            Ok(())
        } else {
            Err(ChannelError::NotFound {
                queue: queue.to_string(),
            })
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        auto_ack: bool,
        consumer_tag: &str,
        _exclusive: bool,
        _args: &HashMap<String, Value>,
        callback: Arc<dyn ConsumerCallback>,
    ) -> Result<Option<String>, ChannelError> {
        self.ensure_open()?;
        if !self.queue_exists(queue) {
            return Err(ChannelError::NotFound {
                queue: queue.to_string(),
            });
        }
        let assigned = if consumer_tag.is_empty() {
            format!(
                "ctag-{}",
                self.state.next_consumer_tag.fetch_add(1, Ordering::SeqCst)
            )
        } else {
            consumer_tag.to_string()
        };
        self.state
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .insert(
                assigned.clone(),
                Subscription {
                    queue: queue.to_string(),
                    callback: callback.clone(),
                },
            );
        self.record(RecordedOp::Subscribe {
            queue: queue.to_string(),
            consumer_tag: assigned.clone(),
            auto_ack,
        });
        callback.on_consume_ok(&assigned).await;
        Ok(Some(assigned))
    }

    async fn cancel_subscription(&self, consumer_tag: &str) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.record(RecordedOp::Cancel(consumer_tag.to_string()));
        let callback = self
            .state
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .remove(consumer_tag)
            .map(|subscription| subscription.callback);
        if let Some(callback) = callback {
            callback.on_cancel_ok(consumer_tag).await;
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u32) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.record(RecordedOp::Prefetch(count));
        Ok(())
    }

    async fn acknowledge(&self, delivery_tag: u64, cumulative: bool) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.record(RecordedOp::Ack {
            delivery_tag,
            cumulative,
        });
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.record(RecordedOp::Reject {
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), ChannelError> {
        self.ensure_open()?;
        if !self.transactional {
            return Err(ChannelError::Io {
                message: "channel is not transactional".to_string(),
            });
        }
        self.record(RecordedOp::TxCommit);
        Ok(())
    }

    async fn tx_rollback(&self) -> Result<(), ChannelError> {
        self.ensure_open()?;
        if !self.transactional {
            return Err(ChannelError::Io {
                message: "channel is not transactional".to_string(),
            });
        }
        self.record(RecordedOp::TxRollback);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.open.store(false, Ordering::SeqCst);
        self.record(RecordedOp::Close);
        Ok(())
    }
}
