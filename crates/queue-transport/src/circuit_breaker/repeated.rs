//! Circuit breaker for runs of consecutive failures.

use super::TriggerAction;
use crate::config::CircuitBreakerSettings;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Thresholds of a [`RepeatedFailuresCircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatedFailuresConfig {
    /// Consecutive failures that arm the breaker
    pub failure_threshold: u32,
    /// Armed time after which the breaker triggers
    pub time_to_wait_before_triggering: Duration,
    /// Pause applied to the caller after each failure
    pub delay_after_failure: Duration,
}

impl Default for RepeatedFailuresConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for RepeatedFailuresConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            time_to_wait_before_triggering: settings.time_to_wait_before_triggering(),
            delay_after_failure: settings.delay_after_failure(),
        }
    }
}

/// The current failure run. The count and the timer change together so a
/// concurrent success can not strand an armed breaker without a timer.
#[derive(Default)]
struct FailureRun {
    failure_count: u64,
    timer: Option<JoinHandle<()>>,
}

struct BreakerState {
    name: String,
    config: RepeatedFailuresConfig,
    run: Mutex<FailureRun>,
    last_error: Mutex<Option<Arc<anyhow::Error>>>,
    trigger: TriggerAction,
}

impl BreakerState {
    fn threshold(&self) -> u64 {
        u64::from(self.config.failure_threshold)
    }

    fn run(&self) -> MutexGuard<'_, FailureRun> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn trigger_if_still_failing(&self) {
        if self.run().failure_count < self.threshold() {
            return;
        }
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(last_error) = last_error {
            error!(
                circuit_breaker = %self.name,
                error = %last_error,
                "The circuit breaker has been armed for too long and will now be triggered"
            );
            (self.trigger)(&last_error);
        }
    }
}

/// Triggers once failures persist for longer than the configured grace period.
///
/// Reaching the failure threshold arms the breaker and starts a timer. If no
/// [`success`](Self::success) disarms it before the timer fires, the trigger
/// action runs with the most recent error.
pub struct RepeatedFailuresCircuitBreaker {
    state: Arc<BreakerState>,
}

impl RepeatedFailuresCircuitBreaker {
    pub fn new(name: impl Into<String>, config: RepeatedFailuresConfig, trigger: TriggerAction) -> Self {
        Self {
            state: Arc::new(BreakerState {
                name: name.into(),
                config,
                run: Mutex::new(FailureRun::default()),
                last_error: Mutex::new(None),
                trigger,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Consecutive failures since the last success.
    pub fn failure_count(&self) -> u64 {
        self.state.run().failure_count
    }

    /// Check if the breaker is counting down to trigger.
    pub fn is_armed(&self) -> bool {
        self.failure_count() >= self.state.threshold()
    }

    /// Reset the failure run and disarm the breaker.
    pub fn success(&self) {
        let previous = std::mem::take(&mut *self.state.run());
        if previous.failure_count == 0 {
            return;
        }
        if let Some(timer) = previous.timer {
            timer.abort();
        }
        info!(circuit_breaker = %self.state.name, "The circuit breaker is now disarmed");
    }

    /// Record a failure, arming the breaker when the threshold is reached,
    /// then pause for the configured delay.
    pub async fn failure(&self, error: anyhow::Error) {
        *self
            .state
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(error));

        let armed = {
            let mut run = self.state.run();
            run.failure_count += 1;
            if run.failure_count >= self.state.threshold() && run.timer.is_none() {
                let state = self.state.clone();
                run.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(state.config.time_to_wait_before_triggering).await;
                    state.trigger_if_still_failing();
                }));
                true
            } else {
                false
            }
        };

        if armed {
            warn!(
                circuit_breaker = %self.state.name,
                wait_seconds = self.state.config.time_to_wait_before_triggering.as_secs(),
                "The circuit breaker is now armed"
            );
        }

        tokio::time::sleep(self.state.config.delay_after_failure).await;
    }
}

impl Drop for RepeatedFailuresCircuitBreaker {
    fn drop(&mut self) {
        if let Some(timer) = self.state.run().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
#[path = "repeated_tests.rs"]
mod tests;
