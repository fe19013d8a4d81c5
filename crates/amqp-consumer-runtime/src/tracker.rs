//! Periodic re-check of queues that were not available at startup.

use crate::channel::ChannelProvider;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;

#[derive(Debug)]
struct RecheckState {
    missing: HashSet<String>,
    last_retry: Option<Instant>,
}

/// Tracks which configured queues have not yet been successfully subscribed
/// and drives the rate-limited availability probe for them.
///
/// Probes run on throwaway channels: on brokers of this family a failed
/// passive declaration closes the channel it was issued on, and losing the
/// main channel would kill every other queue's subscription.
///
/// The retry interval is enforced globally (one shared timestamp), so a
/// queue added to the missing set later inherits the remaining wait of the
/// oldest entry. This is deliberate rate limiting, not a per-queue timer.
#[derive(Debug)]
pub struct QueueAvailabilityTracker {
    state: Mutex<RecheckState>,
    interval: Duration,
}

impl QueueAvailabilityTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Mutex::new(RecheckState {
                missing: HashSet::new(),
                last_retry: None,
            }),
            interval,
        }
    }

    /// Record queues as missing and stamp the retry timestamp, so the first
    /// recheck happens a full interval after entering degraded mode.
    pub async fn mark_missing(&self, queues: impl IntoIterator<Item = String>) {
        let mut state = self.state.lock().await;
        state.missing.extend(queues);
        state.last_retry = Some(Instant::now());
    }

    /// Remove a queue from the missing set once it is live again.
    pub async fn mark_available(&self, queue: &str) {
        self.state.lock().await.missing.remove(queue);
    }

    pub async fn is_missing(&self, queue: &str) -> bool {
        self.state.lock().await.missing.contains(queue)
    }

    pub async fn has_missing(&self) -> bool {
        !self.state.lock().await.missing.is_empty()
    }

    pub async fn missing(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut queues: Vec<String> = state.missing.iter().cloned().collect();
        queues.sort();
        queues
    }

    /// Probe every missing queue if the retry interval has elapsed.
    ///
    /// Returns the queues that passed the passive existence check; the
    /// caller subscribes on the main channel and then calls
    /// [`mark_available`](Self::mark_available). The retry timestamp is
    /// updated regardless of outcome, enforcing the interval as a rate
    /// limit rather than a per-queue timer.
    pub async fn probe_missing(&self, provider: &dyn ChannelProvider) -> Vec<String> {
        let mut state = self.state.lock().await;
        let due = state
            .last_retry
            .map_or(true, |last| last.elapsed() >= self.interval);
        if !due || state.missing.is_empty() {
            return Vec::new();
        }

        let mut available = Vec::new();
        for queue in &state.missing {
            match provider.create_throwaway_channel().await {
                Ok(channel) => {
                    let exists = channel.declare_queue_passive(queue).await.is_ok();
                    if let Err(error) = channel.close().await {
                        debug!(%error, "error closing probe channel");
                    }
                    if exists {
                        info!(queue, "queue is now available");
                        available.push(queue.clone());
                    } else {
                        warn!(queue, "queue is still not available");
                    }
                }
                Err(error) => {
                    warn!(queue, %error, "could not open probe channel");
                }
            }
        }
        state.last_retry = Some(Instant::now());
        available
    }
}
