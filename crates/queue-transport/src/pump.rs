//! # Message Pump
//!
//! Peeks the input queue and runs the receive strategy for each available
//! message, with at most `max_concurrency` receives in flight.
//!
//! Peek and receive failures feed two [`RepeatedFailuresCircuitBreaker`]s.
//! When either stays armed past its grace period the host's critical error
//! callback is invoked; the pump itself keeps running.

use crate::address::QueueAddress;
use crate::circuit_breaker::{
    raise_critical_error, RepeatedFailuresCircuitBreaker, RepeatedFailuresConfig,
};
use crate::config::{TransactionMode, TransportSettings};
use crate::error::{ConfigurationError, TransportError};
use crate::queue::QueueService;
use crate::receive::{ProcessingCallbacks, ReceiveQueues, ReceiveStrategy, TransactionPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// Pump Settings
// ============================================================================

/// Queues and receive mode a pump is initialized with.
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub input_queue: String,
    pub error_queue: String,
    pub purge_on_startup: bool,
    pub transaction_mode: TransactionMode,
}

impl PushSettings {
    pub fn new(
        input_queue: impl Into<String>,
        error_queue: impl Into<String>,
        transaction_mode: TransactionMode,
    ) -> Self {
        Self {
            input_queue: input_queue.into(),
            error_queue: error_queue.into(),
            purge_on_startup: false,
            transaction_mode,
        }
    }

    pub fn with_purge_on_startup(mut self, purge: bool) -> Self {
        self.purge_on_startup = purge;
        self
    }
}

// ============================================================================
// Message Pump
// ============================================================================

struct InitializedPump {
    input_queue: QueueAddress,
    strategy: Arc<ReceiveStrategy>,
    peek_breaker: Arc<RepeatedFailuresCircuitBreaker>,
    receive_breaker: Arc<RepeatedFailuresCircuitBreaker>,
}

struct RunningPump {
    cancel: CancellationToken,
    limiter: Arc<Semaphore>,
    max_concurrency: usize,
    loop_handle: JoinHandle<()>,
}

/// Drives a [`ReceiveStrategy`] against one input queue.
///
/// Lifecycle: [`init`](Self::init) once, then [`start`](Self::start) and
/// [`stop`](Self::stop).
pub struct MessagePump {
    service: Arc<dyn QueueService>,
    settings: TransportSettings,
    initialized: Option<InitializedPump>,
    running: Option<RunningPump>,
}

impl MessagePump {
    pub fn new(service: Arc<dyn QueueService>, settings: TransportSettings) -> Self {
        Self {
            service,
            settings,
            initialized: None,
            running: None,
        }
    }

    pub fn input_queue(&self) -> Option<&QueueAddress> {
        self.initialized.as_ref().map(|pump| &pump.input_queue)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Validate the queues and build the receive strategy.
    ///
    /// # Errors
    ///
    /// - the input queue is on another machine or does not exist
    /// - the receive mode is transactional but the input queue is not
    /// - a queue can not be inspected or purged
    pub async fn init(
        &mut self,
        callbacks: ProcessingCallbacks,
        push: PushSettings,
    ) -> Result<(), ConfigurationError> {
        let local_machine = self.service.local_machine().to_string();
        let input_queue = QueueAddress::parse(&push.input_queue, &local_machine)?;
        let error_queue = QueueAddress::parse(&push.error_queue, &local_machine)?;

        if !input_queue.is_local(&local_machine) {
            return Err(ConfigurationError::RemoteInputQueue {
                queue: input_queue.queue().to_string(),
                machine: input_queue.machine().to_string(),
                local_machine,
            });
        }

        self.ensure_exists(&input_queue).await?;
        let input_transactional = self.inspect_transactional(&input_queue).await?;
        if push.transaction_mode.is_transactional() && !input_transactional {
            return Err(ConfigurationError::QueueNotTransactional {
                queue: input_queue.to_string(),
                mode: push.transaction_mode.to_string(),
            });
        }

        let error_queue_transactional = if error_queue.is_local(&local_machine) {
            self.ensure_exists(&error_queue).await?;
            self.inspect_transactional(&error_queue).await?
        } else {
            self.settings.use_transactional_queues
        };

        if push.purge_on_startup {
            let purged = self.service.purge(&input_queue).await.map_err(|source| {
                ConfigurationError::QueueInspection {
                    queue: input_queue.to_string(),
                    source,
                }
            })?;
            warn!(queue = %input_queue, purged, "Purged input queue on startup");
        }

        let mut settings = self.settings.clone();
        settings.transaction_mode = push.transaction_mode;

        let critical_error = callbacks.critical_error.clone();
        let strategy = ReceiveStrategy::new(
            self.service.clone(),
            ReceiveQueues {
                input: input_queue.clone(),
                error: error_queue,
                error_queue_transactional,
            },
            TransactionPolicy::from_settings(&settings),
            &settings,
            callbacks,
        );

        let breaker_config = RepeatedFailuresConfig::from(&settings.circuit_breaker);
        let peek_breaker = RepeatedFailuresCircuitBreaker::new(
            format!("{}-peek", input_queue),
            breaker_config.clone(),
            raise_critical_error(critical_error.clone(), format!("Failed to peek {}", input_queue)),
        );
        let receive_breaker = RepeatedFailuresCircuitBreaker::new(
            format!("{}-receive", input_queue),
            breaker_config,
            raise_critical_error(critical_error, format!("Failed to receive from {}", input_queue)),
        );

        info!(
            queue = %input_queue,
            transaction_mode = %push.transaction_mode,
            "Message pump initialized"
        );

        self.initialized = Some(InitializedPump {
            input_queue,
            strategy: Arc::new(strategy),
            peek_breaker: Arc::new(peek_breaker),
            receive_breaker: Arc::new(receive_breaker),
        });
        Ok(())
    }

    /// Start pumping with at most `max_concurrency` messages in flight.
    pub fn start(&mut self, max_concurrency: usize) -> Result<(), ConfigurationError> {
        self.ensure_startable(max_concurrency)?;
        let pump = self
            .initialized
            .as_ref()
            .ok_or(ConfigurationError::NotInitialized)?;

        self.service.clear_connection_cache();

        let cancel = CancellationToken::new();
        let limiter = Arc::new(Semaphore::new(max_concurrency));
        let pump_loop = PumpLoop {
            service: self.service.clone(),
            input_queue: pump.input_queue.clone(),
            peek_timeout: self.settings.peek_timeout(),
            strategy: pump.strategy.clone(),
            peek_breaker: pump.peek_breaker.clone(),
            receive_breaker: pump.receive_breaker.clone(),
            limiter: limiter.clone(),
            cancel: cancel.clone(),
        };

        info!(queue = %pump.input_queue, max_concurrency, "Starting message pump");
        let loop_handle = tokio::spawn(pump_loop.run());

        self.running = Some(RunningPump {
            cancel,
            limiter,
            max_concurrency,
            loop_handle,
        });
        Ok(())
    }

    /// Check that [`start`](Self::start) would succeed without starting.
    pub fn ensure_startable(&self, max_concurrency: usize) -> Result<(), ConfigurationError> {
        if self.running.is_some() {
            return Err(ConfigurationError::AlreadyStarted);
        }
        if self.initialized.is_none() {
            return Err(ConfigurationError::NotInitialized);
        }
        if max_concurrency == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_concurrency must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Stop pumping and wait up to the shutdown timeout for in-flight
    /// receives to finish. Stopping a pump that is not running is a no-op.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let queue = self
            .input_queue()
            .map(ToString::to_string)
            .unwrap_or_default();

        running.cancel.cancel();
        if let Err(join_error) = running.loop_handle.await {
            error!(queue = %queue, error = %join_error, "Message pump loop terminated abnormally");
        }

        let shutdown_timeout = self.settings.shutdown_timeout();
        let permits = u32::try_from(running.max_concurrency).unwrap_or(u32::MAX);
        match tokio::time::timeout(shutdown_timeout, running.limiter.acquire_many(permits)).await {
            Ok(_) => debug!(queue = %queue, "All in-flight receives completed"),
            Err(_) => error!(
                queue = %queue,
                timeout_seconds = shutdown_timeout.as_secs(),
                "The message pump failed to stop within the time allowed; in-flight receives are abandoned"
            ),
        }

        running.limiter.close();
        info!(queue = %queue, "Message pump stopped");
    }

    async fn ensure_exists(&self, queue: &QueueAddress) -> Result<(), ConfigurationError> {
        let exists = self
            .service
            .queue_exists(queue)
            .await
            .map_err(|source| ConfigurationError::QueueInspection {
                queue: queue.to_string(),
                source,
            })?;
        if !exists {
            return Err(ConfigurationError::QueueNotFound {
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn inspect_transactional(&self, queue: &QueueAddress) -> Result<bool, ConfigurationError> {
        self.service
            .is_transactional(queue)
            .await
            .map_err(|source| ConfigurationError::QueueInspection {
                queue: queue.to_string(),
                source,
            })
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
        }
    }
}

// ============================================================================
// Pump Loop
// ============================================================================

struct PumpLoop {
    service: Arc<dyn QueueService>,
    input_queue: QueueAddress,
    peek_timeout: Duration,
    strategy: Arc<ReceiveStrategy>,
    peek_breaker: Arc<RepeatedFailuresCircuitBreaker>,
    receive_breaker: Arc<RepeatedFailuresCircuitBreaker>,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl PumpLoop {
    async fn run(self) {
        loop {
            let peeked = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.service.peek(&self.input_queue, self.peek_timeout) => result,
            };

            match peeked {
                Ok(true) => self.peek_breaker.success(),
                // A peek timeout means the queue is reachable but empty.
                Ok(false) => {
                    self.peek_breaker.success();
                    continue;
                }
                Err(peek_error) => {
                    warn!(queue = %self.input_queue, error = %peek_error, "Failed to peek the input queue");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.peek_breaker.failure(peek_error.into()) => {}
                    }
                    continue;
                }
            }

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.limiter.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                error!(queue = %self.input_queue, "Concurrency limiter closed while the pump was running");
                self.peek_breaker
                    .failure(TransportError::LimiterClosed.into())
                    .await;
                break;
            };

            let strategy = self.strategy.clone();
            let receive_breaker = self.receive_breaker.clone();
            let queue = self.input_queue.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match strategy.receive_message().await {
                    Ok(()) => receive_breaker.success(),
                    Err(receive_error) => {
                        warn!(queue = %queue, error = %receive_error, "Failed to receive from the input queue");
                        receive_breaker.failure(receive_error.into()).await;
                    }
                }
            });
        }

        debug!(queue = %self.input_queue, "Message pump loop exited");
    }
}

#[cfg(test)]
#[path = "pump_tests.rs"]
mod tests;
