use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal — daemon-wide cooperative shutdown
// ---------------------------------------------------------------------------

/// Broadcast-based shutdown coordinator.
///
/// Each long-lived loop calls `subscribe()` and `select!`s on the returned
/// receiver alongside its interval ticks. `trigger()` flips the atomic flag
/// once and wakes every subscriber.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Check whether shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown for all subscribers. Idempotent.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        } else {
            warn!("shutdown already triggered");
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StopToken — per-session kill switch
// ---------------------------------------------------------------------------

/// Why a running agent session is being cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Explicit `/stop` or UI kill.
    UserStop,
    /// The watchdog classified the session as stuck.
    Watchdog,
    /// The daemon itself is shutting down.
    Shutdown,
}

/// Cancellation handle scoped to one agent session.
///
/// The scheduler hands a clone to the runner; the watchdog, the inbound
/// notification handler, and the daemon's shutdown path hold others. The
/// first `stop()` wins; the reason is latched for the runner to report.
#[derive(Debug, Clone)]
pub struct StopToken {
    trigger: broadcast::Sender<StopReason>,
    reason: Arc<Mutex<Option<StopReason>>>,
}

impl StopToken {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Request the session stop. Later calls are no-ops.
    pub fn stop(&self, reason: StopReason) {
        let mut latched = self.reason.lock().expect("stop token lock poisoned");
        if latched.is_none() {
            *latched = Some(reason);
            let _ = self.trigger.send(reason);
        }
    }

    /// The latched reason, if a stop was requested.
    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock().expect("stop token lock poisoned")
    }

    pub fn is_stopped(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolve when a stop is requested. Returns immediately when one
    /// already was.
    pub async fn stopped(&self) -> StopReason {
        if let Some(reason) = self.reason() {
            return reason;
        }
        let mut rx = self.trigger.subscribe();
        match rx.recv().await {
            Ok(reason) => reason,
            // Sender can't outlive self; a lag still means a stop happened.
            Err(_) => self.reason().unwrap_or(StopReason::Shutdown),
        }
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn new_signal_is_not_shutting_down() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
    }

    #[test]
    fn double_trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn subscribers_wake_on_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
    }

    #[test]
    fn clone_shares_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[test]
    fn stop_token_latches_first_reason() {
        let token = StopToken::new();
        assert!(!token.is_stopped());

        token.stop(StopReason::Watchdog);
        token.stop(StopReason::UserStop);
        assert_eq!(token.reason(), Some(StopReason::Watchdog));
    }

    #[tokio::test]
    async fn stopped_resolves_for_late_subscribers() {
        let token = StopToken::new();
        token.stop(StopReason::UserStop);
        // Subscribing after the stop still resolves.
        let reason = tokio::time::timeout(Duration::from_millis(100), token.stopped())
            .await
            .unwrap();
        assert_eq!(reason, StopReason::UserStop);
    }

    #[tokio::test]
    async fn stopped_resolves_for_waiting_subscribers() {
        let token = StopToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.stop(StopReason::Shutdown);

        let reason = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Shutdown);
    }
}
