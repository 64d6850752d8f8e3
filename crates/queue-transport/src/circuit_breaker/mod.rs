//! Circuit breakers protecting the transport against cascading failure.
//!
//! Two variants are provided:
//!
//! - [`RepeatedFailuresCircuitBreaker`]: arms after a run of consecutive
//!   failures and triggers if no success resets it within a grace period.
//!   Guards peek, receive and store operations.
//! - [`FailureRateCircuitBreaker`]: counts failures in a fixed window and
//!   triggers on every failure past `max_failures_per_second × window`.
//!   Guards re-dispatch of delayed messages.
//!
//! Both only expose failure/success reporting; triggering invokes a
//! caller-supplied action, typically raising a critical error.

use crate::processing::CriticalError;
use std::sync::Arc;

mod rate;
mod repeated;

pub use rate::FailureRateCircuitBreaker;
pub use repeated::{RepeatedFailuresCircuitBreaker, RepeatedFailuresConfig};

/// Action invoked when a breaker triggers.
pub type TriggerAction = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Trigger that raises `description` through the host's critical error sink.
pub fn raise_critical_error(critical_error: Arc<dyn CriticalError>, description: String) -> TriggerAction {
    Arc::new(move |error: &anyhow::Error| critical_error.raise(&description, error))
}
