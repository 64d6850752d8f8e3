//! Dispatches stored delayed messages once they are due.

use super::handler::failure_headers;
use super::{DelayedMessage, DelayedMessageStore, StoreError};
use crate::address::QueueAddress;
use crate::circuit_breaker::{FailureRateCircuitBreaker, RepeatedFailuresCircuitBreaker};
use crate::dispatcher::MessageDispatcher;
use crate::message::{OutgoingMessage, TransportOperation};
use crate::transaction::TransportTransaction;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Breakers guarding the poller.
pub struct PollerBreakers {
    /// Fed by failing fetches from the store
    pub fetch: RepeatedFailuresCircuitBreaker,
    /// Fed by failing dispatches of due messages
    pub dispatch: FailureRateCircuitBreaker,
}

/// Polls a [`DelayedMessageStore`] and dispatches due messages.
pub struct DueDelayedMessagePoller {
    store: Arc<dyn DelayedMessageStore>,
    dispatcher: MessageDispatcher,
    error_queue: String,
    timeouts_queue: QueueAddress,
    max_dispatch_attempts: u32,
    max_poll_interval: Duration,
    breakers: PollerBreakers,
    signal: Arc<Notify>,
}

impl DueDelayedMessagePoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DelayedMessageStore>,
        dispatcher: MessageDispatcher,
        error_queue: impl Into<String>,
        timeouts_queue: QueueAddress,
        max_dispatch_attempts: u32,
        max_poll_interval: Duration,
        breakers: PollerBreakers,
        signal: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            error_queue: error_queue.into(),
            timeouts_queue,
            max_dispatch_attempts: max_dispatch_attempts.max(1),
            max_poll_interval,
            breakers,
            signal,
        }
    }

    /// Wakes the poller before its next scheduled poll.
    pub fn signal(&self) -> Arc<Notify> {
        self.signal.clone()
    }

    /// Poll until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(timeouts_queue = %self.timeouts_queue, "Starting delayed message poller");

        loop {
            match self.poll_once().await {
                Ok(dispatched) => {
                    self.breakers.fetch.success();
                    if dispatched > 0 {
                        debug!(dispatched, "Dispatched due delayed messages");
                    }
                }
                Err(fetch_error) => {
                    warn!(error = %fetch_error, "Failed to fetch due delayed messages");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.breakers.fetch.failure(fetch_error.into()) => {}
                    }
                    continue;
                }
            }

            let wait = self.next_wait().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.signal.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(timeouts_queue = %self.timeouts_queue, "Delayed message poller stopped");
    }

    /// Dispatch every message due now. Returns the number dispatched.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let due = self.store.fetch_due(Utc::now()).await?;
        let mut dispatched = 0;
        for message in due {
            if self.deliver(message).await {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    async fn next_wait(&self) -> Duration {
        match self.store.next_due().await {
            Ok(Some(next_due)) => (next_due - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.max_poll_interval),
            Ok(None) => self.max_poll_interval,
            Err(store_error) => {
                debug!(error = %store_error, "Unable to read the next due time");
                self.max_poll_interval
            }
        }
    }

    async fn deliver(&self, mut message: DelayedMessage) -> bool {
        let operation = TransportOperation::new(
            message.destination.clone(),
            OutgoingMessage::new(
                message.message_id.clone(),
                message.headers.clone(),
                message.body.clone(),
            ),
        )
        .isolated();

        let dispatch_error = match self
            .dispatcher
            .dispatch(operation.into(), &TransportTransaction::none())
            .await
        {
            Ok(()) => {
                debug!(id = %message.id, destination = %message.destination, "Delivered delayed message");
                return true;
            }
            Err(dispatch_error) => anyhow::Error::from(dispatch_error),
        };

        message.failure_count += 1;
        warn!(
            id = %message.id,
            destination = %message.destination,
            attempts = message.failure_count,
            error = %dispatch_error,
            "Failed to dispatch delayed message"
        );

        if message.failure_count >= self.max_dispatch_attempts {
            self.move_to_error_queue(message, &dispatch_error).await;
        } else if let Err(store_error) = self.store.store(message.clone()).await {
            error!(
                id = %message.id,
                error = %store_error,
                "Failed to return delayed message to the store"
            );
            self.move_to_error_queue(message, &dispatch_error).await;
        }

        self.breakers.dispatch.failure(dispatch_error);
        false
    }

    async fn move_to_error_queue(&self, message: DelayedMessage, dispatch_error: &anyhow::Error) {
        let headers = failure_headers(message.headers, dispatch_error, &self.timeouts_queue);
        let operation = TransportOperation::new(
            self.error_queue.clone(),
            OutgoingMessage::new(message.message_id, headers, message.body),
        )
        .isolated();

        match self
            .dispatcher
            .dispatch(operation.into(), &TransportTransaction::none())
            .await
        {
            Ok(()) => warn!(
                id = %message.id,
                error_queue = %self.error_queue,
                "Moved undeliverable delayed message to the error queue"
            ),
            Err(move_error) => error!(
                id = %message.id,
                error_queue = %self.error_queue,
                error = %move_error,
                "Failed to move undeliverable delayed message to the error queue; the message is lost"
            ),
        }
    }
}

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;
