//! Receive strategies.
//!
//! A [`ReceiveStrategy`] pulls one message off the input queue, hands it to
//! the processing callback and completes the receive according to its
//! [`TransactionPolicy`]:
//!
//! | Policy | Transaction | Failure handling |
//! |---|---|---|
//! | `None` | none | error callback once, attempt 1; the message is gone |
//! | `ReceiveOnly` | native | abort and redeliver |
//! | `SendsAtomicWithReceive` | native, exposed for sends | abort and redeliver |
//! | `TransactionScope` | ambient, exposed | abort and redeliver |
//!
//! Redelivered messages with a recorded [`FailureInfo`](crate::failure_info::FailureInfo)
//! go to the error callback first, so a failure already observed is not
//! processed again unless the callback asks for a retry.

use crate::address::QueueAddress;
use crate::config::TransportSettings;
use crate::error::{HeaderError, TransportError};
use crate::failure_info::FailureInfoStorage;
use crate::headers;
use crate::message::{Headers, NativeMessageId, WireMessage};
use crate::processing::{
    CriticalError, ErrorContext, ErrorHandleResult, ErrorHandler, MessageContext, MessageHandler,
    ProcessingOutcome,
};
use crate::queue::{QueueService, ReceiveTransaction, SendTransaction};
use crate::transaction::{AbortOnDrop, Transaction, TransportTransaction};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

mod policy;

pub use policy::TransactionPolicy;

/// Host callbacks shared by the receive strategy of a pump.
#[derive(Clone)]
pub struct ProcessingCallbacks {
    pub on_message: Arc<dyn MessageHandler>,
    pub on_error: Arc<dyn ErrorHandler>,
    pub critical_error: Arc<dyn CriticalError>,
}

/// Queues a strategy reads from and moves poison messages to.
#[derive(Debug, Clone)]
pub struct ReceiveQueues {
    pub input: QueueAddress,
    pub error: QueueAddress,
    pub error_queue_transactional: bool,
}

/// Receives and processes one message per call.
pub struct ReceiveStrategy {
    service: Arc<dyn QueueService>,
    queues: ReceiveQueues,
    policy: TransactionPolicy,
    receive_timeout: Duration,
    ignore_incoming_ttbr: bool,
    failure_info: FailureInfoStorage,
    callbacks: ProcessingCallbacks,
}

impl ReceiveStrategy {
    pub fn new(
        service: Arc<dyn QueueService>,
        queues: ReceiveQueues,
        policy: TransactionPolicy,
        settings: &TransportSettings,
        callbacks: ProcessingCallbacks,
    ) -> Self {
        Self {
            service,
            queues,
            policy,
            receive_timeout: settings.receive_timeout(),
            ignore_incoming_ttbr: settings.ignore_incoming_time_to_be_received_headers,
            failure_info: FailureInfoStorage::default(),
            callbacks,
        }
    }

    pub fn policy(&self) -> &TransactionPolicy {
        &self.policy
    }

    pub fn failure_info(&self) -> &FailureInfoStorage {
        &self.failure_info
    }

    /// Receive and process at most one message.
    ///
    /// Errors returned here are queue-service failures the caller should feed
    /// to its circuit breaker. Processing failures are handled internally.
    pub async fn receive_message(&self) -> Result<(), TransportError> {
        match self.policy.begin() {
            Some(transaction) => self.receive_in_transaction(transaction).await,
            None => self.receive_without_transaction().await,
        }
    }

    // ========================================================================
    // Transactional receive
    // ========================================================================

    async fn receive_in_transaction(&self, transaction: Transaction) -> Result<(), TransportError> {
        let _abandoned = AbortOnDrop::new(transaction.clone());
        let mut received = None;
        let Err(error) = self.process_in_transaction(&transaction, &mut received).await else {
            return Ok(());
        };

        if transaction.is_active() {
            if let Err(abort_error) = transaction.abort().await {
                warn!(
                    queue = %self.queues.input,
                    error = %abort_error,
                    "Failed to abort receive transaction"
                );
            }
        }

        match received {
            Some(native_message_id) => {
                warn!(
                    queue = %self.queues.input,
                    native_message_id = %native_message_id,
                    error = %error,
                    "Failed to complete the receive transaction; the message will be redelivered"
                );
                self.failure_info
                    .record_failure(&native_message_id, anyhow::Error::from(error));
                Ok(())
            }
            None => Err(error),
        }
    }

    async fn process_in_transaction(
        &self,
        transaction: &Transaction,
        received: &mut Option<NativeMessageId>,
    ) -> Result<(), TransportError> {
        let message = self
            .service
            .receive(
                &self.queues.input,
                self.receive_timeout,
                ReceiveTransaction::Enlisted(transaction),
            )
            .await?;
        let Some(message) = message else {
            transaction.abort().await?;
            return Ok(());
        };

        let native_message_id = message.native_id();
        *received = Some(native_message_id.clone());

        let headers = match headers::extract_headers(&message) {
            Ok(headers) => headers,
            Err(error) => {
                self.move_to_error_queue(message, self.error_queue_transaction(Some(transaction)), &error)
                    .await?;
                transaction.commit().await?;
                return Ok(());
            }
        };

        if self.has_expired(&headers) {
            info!(
                native_message_id = %native_message_id,
                "Discarding message because its time to be received has elapsed"
            );
            transaction.commit().await?;
            self.failure_info.clear(&native_message_id);
            return Ok(());
        }

        let transport_transaction = self.policy.expose(transaction);

        if let Some(failure) = self.failure_info.get(&native_message_id) {
            let result = self
                .handle_error(
                    &native_message_id,
                    &headers,
                    &message.body,
                    failure.error,
                    transport_transaction.clone(),
                    failure.attempts,
                )
                .await;

            if result == ErrorHandleResult::Handled {
                transaction.commit().await?;
                self.failure_info.clear(&native_message_id);
                return Ok(());
            }
        }

        let context = MessageContext {
            native_message_id: native_message_id.clone(),
            headers,
            body: message.body,
            transport_transaction,
        };

        match self.callbacks.on_message.on_message(context).await {
            Ok(ProcessingOutcome::Complete) => {
                transaction.commit().await?;
                self.failure_info.clear(&native_message_id);
            }
            Ok(ProcessingOutcome::Abort) => {
                debug!(native_message_id = %native_message_id, "Processing aborted, rolling back");
                transaction.abort().await?;
            }
            Err(processing_error) => {
                debug!(
                    native_message_id = %native_message_id,
                    error = %processing_error,
                    "Processing failed, rolling back"
                );
                self.failure_info
                    .record_failure(&native_message_id, processing_error);
                transaction.abort().await?;
            }
        }

        Ok(())
    }

    // ========================================================================
    // Non-transactional receive
    // ========================================================================

    async fn receive_without_transaction(&self) -> Result<(), TransportError> {
        let message = self
            .service
            .receive(&self.queues.input, self.receive_timeout, ReceiveTransaction::None)
            .await?;
        let Some(message) = message else {
            return Ok(());
        };
        let native_message_id = message.native_id();

        let headers = match headers::extract_headers(&message) {
            Ok(headers) => headers,
            Err(error) => {
                return self
                    .move_to_error_queue(message, self.error_queue_transaction(None), &error)
                    .await;
            }
        };

        if self.has_expired(&headers) {
            info!(
                native_message_id = %native_message_id,
                "Discarding message because its time to be received has elapsed"
            );
            return Ok(());
        }

        let context = MessageContext {
            native_message_id: native_message_id.clone(),
            headers: headers.clone(),
            body: message.body.clone(),
            transport_transaction: TransportTransaction::none(),
        };

        match self.callbacks.on_message.on_message(context).await {
            Ok(ProcessingOutcome::Complete) => {}
            Ok(ProcessingOutcome::Abort) => {
                debug!(
                    native_message_id = %native_message_id,
                    "Processing aborted; without a transaction the message is already consumed"
                );
            }
            Err(processing_error) => {
                let result = self
                    .handle_error(
                        &native_message_id,
                        &headers,
                        &message.body,
                        Arc::new(processing_error),
                        TransportTransaction::none(),
                        1,
                    )
                    .await;
                if result == ErrorHandleResult::RetryRequired {
                    warn!(
                        native_message_id = %native_message_id,
                        "Retry requested for a message received without a transaction; the message can not be retried"
                    );
                }
            }
        }

        Ok(())
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    async fn handle_error(
        &self,
        native_message_id: &NativeMessageId,
        headers: &Headers,
        body: &Bytes,
        error: Arc<anyhow::Error>,
        transport_transaction: TransportTransaction,
        attempts: u32,
    ) -> ErrorHandleResult {
        let context = ErrorContext {
            error,
            native_message_id: native_message_id.clone(),
            headers: headers.clone(),
            body: body.clone(),
            transport_transaction,
            immediate_processing_failures: attempts,
        };

        match self.callbacks.on_error.on_error(context).await {
            Ok(result) => result,
            Err(policy_error) => {
                self.callbacks.critical_error.raise(
                    &format!(
                        "Failed to execute recoverability policy for message with native ID: `{}`",
                        native_message_id
                    ),
                    &policy_error,
                );
                ErrorHandleResult::RetryRequired
            }
        }
    }

    async fn move_to_error_queue(
        &self,
        mut message: WireMessage,
        transaction: SendTransaction<'_>,
        header_error: &HeaderError,
    ) -> Result<(), TransportError> {
        error!(
            native_message_id = %message.native_id(),
            error_queue = %self.queues.error,
            error = %header_error,
            "Message has corrupted headers and will be moved to the error queue"
        );
        message.label = None;
        self.service
            .send(&self.queues.error, message, transaction)
            .await?;
        Ok(())
    }

    fn error_queue_transaction<'a>(&self, transaction: Option<&'a Transaction>) -> SendTransaction<'a> {
        match (transaction, self.queues.error_queue_transactional) {
            (_, false) => SendTransaction::None,
            (Some(transaction), true) => SendTransaction::Enlisted(transaction),
            (None, true) => SendTransaction::Single,
        }
    }

    fn has_expired(&self, headers: &Headers) -> bool {
        !self.ignore_incoming_ttbr && headers::has_expired(headers, Utc::now())
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
