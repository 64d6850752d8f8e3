//! Transport settings.
//!
//! All fields carry serde defaults, so a partial file (or no file at all)
//! yields a usable configuration. Settings are layered by [`TransportSettings::load`]:
//!
//!  1. An optional file (YAML, TOML or JSON, chosen by extension)
//!  2. Environment variables prefixed `QUEUE_TRANSPORT__` (double-underscore
//!     separator), e.g. `QUEUE_TRANSPORT__PEEK_TIMEOUT_MS=500`

use crate::error::ConfigurationError;
use crate::transaction::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for transport settings
pub const ENV_PREFIX: &str = "QUEUE_TRANSPORT";

/// Consistency guarantee used when receiving messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// No transaction; a failed message is not redelivered.
    None,
    /// Native transaction around the receive only.
    ReceiveOnly,
    /// Native transaction shared by the receive and outgoing sends.
    SendsAtomicWithReceive,
    /// Ambient transaction spanning the receive and any enlisted resource.
    #[default]
    TransactionScope,
}

impl TransactionMode {
    pub fn is_transactional(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl std::fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::ReceiveOnly => "ReceiveOnly",
            Self::SendsAtomicWithReceive => "SendsAtomicWithReceive",
            Self::TransactionScope => "TransactionScope",
        };
        write!(f, "{}", name)
    }
}

/// Resolved transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub transaction_mode: TransactionMode,

    /// Queues are expected to be transactional
    pub use_transactional_queues: bool,

    /// Dead-letter default for messages without a time to be received
    pub use_dead_letter_queue: bool,

    /// Dead-letter default for messages carrying a time to be received
    pub use_dead_letter_queue_for_messages_with_ttbr: bool,

    pub use_journal_queue: bool,

    /// Maximum time for a message to reach its destination queue
    pub time_to_reach_queue_seconds: Option<u64>,

    pub peek_timeout_ms: u64,

    pub receive_timeout_ms: u64,

    /// Strip the native time to be received from transactional sends instead
    /// of failing them
    pub disable_native_ttbr_in_transactions: bool,

    /// Process messages even when their `TimeToBeReceived` header elapsed
    pub ignore_incoming_time_to_be_received_headers: bool,

    pub transaction_scope: TransactionScopeSettings,

    pub circuit_breaker: CircuitBreakerSettings,

    /// Maximum time `stop` waits for in-flight messages
    pub shutdown_timeout_seconds: u64,

    /// Enables delayed delivery through a timeout queue
    pub delayed_delivery: Option<DelayedDeliveryConfig>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            transaction_mode: TransactionMode::default(),
            use_transactional_queues: true,
            use_dead_letter_queue: true,
            use_dead_letter_queue_for_messages_with_ttbr: false,
            use_journal_queue: false,
            time_to_reach_queue_seconds: None,
            peek_timeout_ms: 1_000,
            receive_timeout_ms: 10,
            disable_native_ttbr_in_transactions: false,
            ignore_incoming_time_to_be_received_headers: false,
            transaction_scope: TransactionScopeSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            shutdown_timeout_seconds: 30,
            delayed_delivery: None,
        }
    }
}

impl TransportSettings {
    /// Load settings from an optional file layered with environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check settings for internal consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.peek_timeout_ms == 0 {
            return Err(invalid("peek_timeout_ms must be greater than zero"));
        }
        if self.transaction_mode.is_transactional() && !self.use_transactional_queues {
            return Err(invalid(&format!(
                "transaction mode {} requires transactional queues",
                self.transaction_mode
            )));
        }
        if self.transaction_scope.timeout_seconds == 0 {
            return Err(invalid("transaction_scope.timeout_seconds must be greater than zero"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be greater than zero"));
        }
        if let Some(delayed) = &self.delayed_delivery {
            delayed.validate()?;
        }
        Ok(())
    }

    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.peek_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn time_to_reach_queue(&self) -> Option<Duration> {
        self.time_to_reach_queue_seconds.map(Duration::from_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn delayed_delivery_enabled(&self) -> bool {
        self.delayed_delivery.is_some()
    }
}

/// Settings for the ambient transaction of the `TransactionScope` mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionScopeSettings {
    pub isolation_level: IsolationLevel,
    pub timeout_seconds: u64,
}

impl Default for TransactionScopeSettings {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::ReadCommitted,
            timeout_seconds: 60,
        }
    }
}

impl TransactionScopeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Timings of the peek and receive circuit breakers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that arm the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays armed before it triggers
    pub time_to_wait_before_triggering_seconds: u64,
    /// Pause after each failure
    pub delay_after_failure_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            time_to_wait_before_triggering_seconds: 30,
            delay_after_failure_ms: 1_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn time_to_wait_before_triggering(&self) -> Duration {
        Duration::from_secs(self.time_to_wait_before_triggering_seconds)
    }

    pub fn delay_after_failure(&self) -> Duration {
        Duration::from_millis(self.delay_after_failure_ms)
    }
}

/// Delayed delivery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedDeliveryConfig {
    /// Appended to the input queue name to form the timeout queue
    pub timeouts_queue_suffix: String,

    /// Failed attempts to store a delayed message before it moves to the error queue
    pub number_of_retries: u32,

    /// Failed attempts to dispatch a due message before it moves to the error queue
    pub max_dispatch_attempts: u32,

    /// Dispatch failures per second tolerated before the critical error triggers
    pub maximum_recovery_failures_per_second: u32,

    pub time_to_trigger_fetch_circuit_breaker_seconds: u64,

    pub time_to_trigger_store_circuit_breaker_seconds: u64,

    /// Upper bound between two polls of the store
    pub max_poll_interval_seconds: u64,

    /// Concurrency of the timeout queue pump
    pub max_concurrency: usize,
}

impl Default for DelayedDeliveryConfig {
    fn default() -> Self {
        Self {
            timeouts_queue_suffix: ".timeouts".to_string(),
            number_of_retries: 3,
            max_dispatch_attempts: 5,
            maximum_recovery_failures_per_second: 1,
            time_to_trigger_fetch_circuit_breaker_seconds: 30,
            time_to_trigger_store_circuit_breaker_seconds: 30,
            max_poll_interval_seconds: 60,
            max_concurrency: 1,
        }
    }
}

impl DelayedDeliveryConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.timeouts_queue_suffix.is_empty() {
            return Err(invalid("delayed_delivery.timeouts_queue_suffix must not be empty"));
        }
        if self.maximum_recovery_failures_per_second == 0 {
            return Err(invalid(
                "delayed_delivery.maximum_recovery_failures_per_second must be greater than zero",
            ));
        }
        if self.max_dispatch_attempts == 0 {
            return Err(invalid("delayed_delivery.max_dispatch_attempts must be greater than zero"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("delayed_delivery.max_concurrency must be greater than zero"));
        }
        Ok(())
    }

    pub fn time_to_trigger_fetch_circuit_breaker(&self) -> Duration {
        Duration::from_secs(self.time_to_trigger_fetch_circuit_breaker_seconds)
    }

    pub fn time_to_trigger_store_circuit_breaker(&self) -> Duration {
        Duration::from_secs(self.time_to_trigger_store_circuit_breaker_seconds)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs(self.max_poll_interval_seconds)
    }
}

fn invalid(message: &str) -> ConfigurationError {
    ConfigurationError::Invalid {
        message: message.to_string(),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
