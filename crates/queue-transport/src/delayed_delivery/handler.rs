//! Callbacks of the timeouts-queue pump.

use super::{DelayedMessage, DelayedMessageStore};
use crate::address::QueueAddress;
use crate::circuit_breaker::RepeatedFailuresCircuitBreaker;
use crate::dispatcher::MessageDispatcher;
use crate::headers::{
    from_wire_format, EXCEPTION_MESSAGE, FAILED_QUEUE, MESSAGE_ID, TIMEOUT_AT,
    TIMEOUT_DESTINATION,
};
use crate::message::{Headers, NativeMessageId, OutgoingMessage, TransportOperation};
use crate::processing::{
    ErrorContext, ErrorHandleResult, ErrorHandler, MessageContext, MessageHandler,
    ProcessingOutcome,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Moves messages from the timeouts queue into the store, or straight to
/// their destination when they are already due.
pub struct DelayedDeliveryHandler {
    store: Arc<dyn DelayedMessageStore>,
    dispatcher: MessageDispatcher,
    store_breaker: RepeatedFailuresCircuitBreaker,
    poller_signal: Arc<Notify>,
}

impl DelayedDeliveryHandler {
    pub fn new(
        store: Arc<dyn DelayedMessageStore>,
        dispatcher: MessageDispatcher,
        store_breaker: RepeatedFailuresCircuitBreaker,
        poller_signal: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            store_breaker,
            poller_signal,
        }
    }
}

#[async_trait]
impl MessageHandler for DelayedDeliveryHandler {
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<ProcessingOutcome> {
        let MessageContext {
            native_message_id,
            mut headers,
            body,
            transport_transaction,
        } = context;

        let destination = headers
            .shift_remove(TIMEOUT_DESTINATION)
            .with_context(|| format!("Message is missing the {} header", TIMEOUT_DESTINATION))?;
        let due_at = headers
            .shift_remove(TIMEOUT_AT)
            .with_context(|| format!("Message is missing the {} header", TIMEOUT_AT))?;
        let due_at = from_wire_format(&due_at)
            .with_context(|| format!("Invalid {} header value '{}'", TIMEOUT_AT, due_at))?;
        let message_id = message_id_of(&headers, &native_message_id);

        if due_at <= Utc::now() {
            debug!(
                native_message_id = %native_message_id,
                destination = %destination,
                "Delayed message is already due, dispatching"
            );
            let operation = TransportOperation::new(
                destination,
                OutgoingMessage::new(message_id, headers, body),
            );
            self.dispatcher
                .dispatch(operation.into(), &transport_transaction)
                .await?;
            return Ok(ProcessingOutcome::Complete);
        }

        let delayed = DelayedMessage {
            id: native_message_id.clone(),
            message_id,
            destination,
            due_at,
            headers,
            body,
            failure_count: 0,
        };

        match self.store.store(delayed).await {
            Ok(()) => {
                self.store_breaker.success();
                self.poller_signal.notify_one();
                debug!(native_message_id = %native_message_id, due_at = %due_at, "Stored delayed message");
                Ok(ProcessingOutcome::Complete)
            }
            Err(store_error) => {
                warn!(
                    native_message_id = %native_message_id,
                    error = %store_error,
                    "Failed to store delayed message"
                );
                self.store_breaker
                    .failure(anyhow::anyhow!(store_error.to_string()))
                    .await;
                Err(store_error.into())
            }
        }
    }
}

/// Retries failed timeouts-queue messages a fixed number of times, then
/// moves them to the error queue.
pub struct DelayedDeliveryErrorHandler {
    dispatcher: MessageDispatcher,
    error_queue: String,
    timeouts_queue: QueueAddress,
    number_of_retries: u32,
}

impl DelayedDeliveryErrorHandler {
    pub fn new(
        dispatcher: MessageDispatcher,
        error_queue: impl Into<String>,
        timeouts_queue: QueueAddress,
        number_of_retries: u32,
    ) -> Self {
        Self {
            dispatcher,
            error_queue: error_queue.into(),
            timeouts_queue,
            number_of_retries,
        }
    }
}

#[async_trait]
impl ErrorHandler for DelayedDeliveryErrorHandler {
    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult> {
        if context.immediate_processing_failures <= self.number_of_retries {
            return Ok(ErrorHandleResult::RetryRequired);
        }

        warn!(
            native_message_id = %context.native_message_id,
            attempts = context.immediate_processing_failures,
            error_queue = %self.error_queue,
            error = %context.error,
            "Delayed message failed too many times and will be moved to the error queue"
        );

        let message_id = message_id_of(&context.headers, &context.native_message_id);
        let headers = failure_headers(context.headers, &context.error, &self.timeouts_queue);
        let operation = TransportOperation::new(
            self.error_queue.clone(),
            OutgoingMessage::new(message_id, headers, context.body),
        );
        self.dispatcher
            .dispatch(operation.into(), &context.transport_transaction)
            .await?;
        Ok(ErrorHandleResult::Handled)
    }
}

/// Headers describing why a message ended up in the error queue.
pub(super) fn failure_headers(
    mut headers: Headers,
    error: &anyhow::Error,
    failed_queue: &QueueAddress,
) -> Headers {
    headers.insert(EXCEPTION_MESSAGE.to_string(), error.to_string());
    headers.insert(FAILED_QUEUE.to_string(), failed_queue.to_string());
    headers
}

fn message_id_of(headers: &Headers, native_message_id: &NativeMessageId) -> String {
    headers
        .get(MESSAGE_ID)
        .cloned()
        .unwrap_or_else(|| native_message_id.to_string())
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
