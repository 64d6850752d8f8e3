//! Circuit breaker for sustained failure rates.

use super::TriggerAction;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{info, warn};

/// Length of the counting window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

struct RateState {
    name: String,
    threshold: u64,
    failure_count: AtomicU64,
    trigger: TriggerAction,
}

/// Triggers whenever failures in the current window exceed
/// `max_failures_per_second × window`.
///
/// The counter resets at the end of every window. Every failure past the
/// threshold fires the trigger again.
pub struct FailureRateCircuitBreaker {
    state: Arc<RateState>,
    reset_task: JoinHandle<()>,
}

impl FailureRateCircuitBreaker {
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, max_failures_per_second: u32, trigger: TriggerAction) -> Self {
        Self::with_window(name, max_failures_per_second, DEFAULT_WINDOW, trigger)
    }

    pub fn with_window(
        name: impl Into<String>,
        max_failures_per_second: u32,
        window: Duration,
        trigger: TriggerAction,
    ) -> Self {
        let state = Arc::new(RateState {
            name: name.into(),
            threshold: u64::from(max_failures_per_second) * window.as_secs().max(1),
            failure_count: AtomicU64::new(0),
            trigger,
        });

        let reset_state = state.clone();
        let reset_task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + window, window);
            loop {
                ticks.tick().await;
                if reset_state.failure_count.swap(0, Ordering::SeqCst) > 0 {
                    info!(circuit_breaker = %reset_state.name, "The circuit breaker is now disarmed");
                }
            }
        });

        Self { state, reset_task }
    }

    /// Failures counted in the current window.
    pub fn failure_count(&self) -> u64 {
        self.state.failure_count.load(Ordering::SeqCst)
    }

    pub fn failure(&self, error: anyhow::Error) {
        let count = self.state.failure_count.fetch_add(1, Ordering::SeqCst) + 1;

        if count > self.state.threshold {
            warn!(
                circuit_breaker = %self.state.name,
                failures = count,
                threshold = self.state.threshold,
                "The circuit breaker threshold was exceeded and will now be triggered"
            );
            let state = self.state.clone();
            tokio::spawn(async move {
                (state.trigger)(&error);
            });
        } else if count == 1 {
            warn!(circuit_breaker = %self.state.name, error = %error, "The circuit breaker is now armed");
        }
    }
}

impl Drop for FailureRateCircuitBreaker {
    fn drop(&mut self) {
        self.reset_task.abort();
    }
}

#[cfg(test)]
#[path = "rate_tests.rs"]
mod tests;
