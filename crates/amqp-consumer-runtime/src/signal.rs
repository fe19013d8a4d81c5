//! Terminal shutdown-signal capture shared between the callback context and
//! blocking retrieval calls.

use std::fmt;
use std::sync::OnceLock;
use tokio::sync::Notify;

#[cfg(test)]
#[path = "signal_tests.rs"]
mod tests;

/// A captured terminal failure: the broker tore down the channel underneath
/// this consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    reason: String,
    initiated_by_broker: bool,
}

impl ShutdownSignal {
    pub fn new(reason: impl Into<String>, initiated_by_broker: bool) -> Self {
        Self {
            reason: reason.into(),
            initiated_by_broker,
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// False when the teardown was requested by the application side.
    pub fn initiated_by_broker(&self) -> bool {
        self.initiated_by_broker
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = if self.initiated_by_broker {
            "broker"
        } else {
            "application"
        };
        write!(f, "{} (initiated by {})", self.reason, origin)
    }
}

/// One-shot settable cell for the shutdown signal.
///
/// The callback context writes at most one signal (the first write wins);
/// every blocking retrieval can either check synchronously via [`get`] or
/// wait via [`signalled`]. Once set the cell is stable, so "already
/// signalled" short-circuits all subsequent waits.
///
/// [`get`]: ShutdownCell::get
/// [`signalled`]: ShutdownCell::signalled
#[derive(Debug, Default)]
pub struct ShutdownCell {
    cell: OnceLock<ShutdownSignal>,
    notify: Notify,
}

impl ShutdownCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture a signal. Returns false if a signal was already captured; the
    /// earlier capture is kept for diagnostics.
    pub fn set(&self, signal: ShutdownSignal) -> bool {
        let first = self.cell.set(signal).is_ok();
        self.notify.notify_waiters();
        first
    }

    pub fn get(&self) -> Option<&ShutdownSignal> {
        self.cell.get()
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Wait until a signal has been captured. Returns immediately if one is
    /// already present.
    pub async fn signalled(&self) -> ShutdownSignal {
        loop {
            if let Some(signal) = self.cell.get() {
                return signal.clone();
            }
            // Register interest before re-checking so a concurrent `set`
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(signal) = self.cell.get() {
                return signal.clone();
            }
            notified.await;
        }
    }
}
