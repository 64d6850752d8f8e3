//! Pump draining the timeouts queue plus the due-message poller.

use super::{
    DelayedDeliveryErrorHandler, DelayedDeliveryHandler, DelayedMessageStore,
    DueDelayedMessagePoller, PollerBreakers,
};
use crate::address::QueueAddress;
use crate::circuit_breaker::{
    raise_critical_error, FailureRateCircuitBreaker, RepeatedFailuresCircuitBreaker,
    RepeatedFailuresConfig,
};
use crate::config::{DelayedDeliveryConfig, TransportSettings};
use crate::dispatcher::MessageDispatcher;
use crate::error::ConfigurationError;
use crate::processing::CriticalError;
use crate::pump::{MessagePump, PushSettings};
use crate::queue::QueueService;
use crate::receive::ProcessingCallbacks;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

struct RunningPoller {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Receives from the timeouts queue and dispatches stored messages once due.
pub struct DelayedDeliveryPump {
    settings: TransportSettings,
    config: DelayedDeliveryConfig,
    dispatcher: MessageDispatcher,
    store: Arc<dyn DelayedMessageStore>,
    timeouts_queue: QueueAddress,
    pump: MessagePump,
    poller: Option<Arc<DueDelayedMessagePoller>>,
    running_poller: Option<RunningPoller>,
}

impl DelayedDeliveryPump {
    pub fn new(
        service: Arc<dyn QueueService>,
        settings: TransportSettings,
        dispatcher: MessageDispatcher,
        store: Arc<dyn DelayedMessageStore>,
        timeouts_queue: QueueAddress,
    ) -> Self {
        let config = settings.delayed_delivery.clone().unwrap_or_default();
        Self {
            pump: MessagePump::new(service, settings.clone()),
            settings,
            config,
            dispatcher,
            store,
            timeouts_queue,
            poller: None,
            running_poller: None,
        }
    }

    pub fn timeouts_queue(&self) -> &QueueAddress {
        &self.timeouts_queue
    }

    pub fn poller(&self) -> Option<&Arc<DueDelayedMessagePoller>> {
        self.poller.as_ref()
    }

    /// Initialize the timeouts-queue pump with the main pump's error queue
    /// and receive mode.
    pub async fn init(
        &mut self,
        critical_error: Arc<dyn CriticalError>,
        main: &PushSettings,
    ) -> Result<(), ConfigurationError> {
        let signal = Arc::new(Notify::new());
        let delay_after_failure = self.settings.circuit_breaker.delay_after_failure();

        let store_breaker = RepeatedFailuresCircuitBreaker::new(
            "delayed-delivery-store",
            RepeatedFailuresConfig {
                failure_threshold: 1,
                time_to_wait_before_triggering: self.config.time_to_trigger_store_circuit_breaker(),
                delay_after_failure,
            },
            raise_critical_error(
                critical_error.clone(),
                "Failed to store delayed message".to_string(),
            ),
        );
        let fetch_breaker = RepeatedFailuresCircuitBreaker::new(
            "delayed-delivery-fetch",
            RepeatedFailuresConfig {
                failure_threshold: 1,
                time_to_wait_before_triggering: self.config.time_to_trigger_fetch_circuit_breaker(),
                delay_after_failure,
            },
            raise_critical_error(
                critical_error.clone(),
                "Failed to fetch due delayed messages from the store".to_string(),
            ),
        );
        let dispatch_breaker = FailureRateCircuitBreaker::new(
            "delayed-delivery-dispatch",
            self.config.maximum_recovery_failures_per_second,
            raise_critical_error(
                critical_error.clone(),
                "Failed to dispatch delayed messages to their destination".to_string(),
            ),
        );

        let callbacks = ProcessingCallbacks {
            on_message: Arc::new(DelayedDeliveryHandler::new(
                self.store.clone(),
                self.dispatcher.clone(),
                store_breaker,
                signal.clone(),
            )),
            on_error: Arc::new(DelayedDeliveryErrorHandler::new(
                self.dispatcher.clone(),
                main.error_queue.clone(),
                self.timeouts_queue.clone(),
                self.config.number_of_retries,
            )),
            critical_error,
        };
        let push = PushSettings::new(
            self.timeouts_queue.to_string(),
            main.error_queue.clone(),
            main.transaction_mode,
        );
        self.pump.init(callbacks, push).await?;

        self.poller = Some(Arc::new(DueDelayedMessagePoller::new(
            self.store.clone(),
            self.dispatcher.clone(),
            main.error_queue.clone(),
            self.timeouts_queue.clone(),
            self.config.max_dispatch_attempts,
            self.config.max_poll_interval(),
            PollerBreakers {
                fetch: fetch_breaker,
                dispatch: dispatch_breaker,
            },
            signal,
        )));
        Ok(())
    }

    pub fn ensure_startable(&self) -> Result<(), ConfigurationError> {
        if self.poller.is_none() {
            return Err(ConfigurationError::NotInitialized);
        }
        self.pump.ensure_startable(self.config.max_concurrency)
    }

    pub fn start(&mut self) -> Result<(), ConfigurationError> {
        self.ensure_startable()?;
        let poller = self
            .poller
            .clone()
            .ok_or(ConfigurationError::NotInitialized)?;
        self.pump.start(self.config.max_concurrency)?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));
        self.running_poller = Some(RunningPoller { cancel, handle });
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(running) = self.running_poller.take() {
            running.cancel.cancel();
            if let Err(join_error) = running.handle.await {
                error!(error = %join_error, "Delayed message poller terminated abnormally");
            }
        }
        self.pump.stop().await;
    }
}

impl Drop for DelayedDeliveryPump {
    fn drop(&mut self) {
        if let Some(running) = self.running_poller.take() {
            running.cancel.cancel();
        }
    }
}
