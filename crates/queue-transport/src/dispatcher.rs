//! # Message Dispatcher
//!
//! Sends unicast transport operations to their destination queues.
//!
//! Every operation of a batch is validated and converted to its wire form
//! before the first send, so a rejected operation leaves nothing behind.
//! Operations carrying a future delivery time are redirected to the timeouts
//! queue of the delayed delivery subsystem.

use crate::address::QueueAddress;
use crate::config::TransportSettings;
use crate::error::{DispatchError, QueueError};
use crate::headers::{
    self, format_time_span, to_wire_format, NON_DURABLE_MESSAGE, TIMEOUT_AT, TIMEOUT_DESTINATION,
    TIME_SENT, TIME_TO_BE_RECEIVED,
};
use crate::message::{
    DeliveryConstraint, DispatchConsistency, Headers, OutgoingMessage, TransportOperation,
    TransportOperations, WireMessage,
};
use crate::queue::{QueueService, SendTransaction};
use crate::transaction::TransportTransaction;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Longest label the queuing service accepts
pub const MAX_LABEL_LENGTH: usize = 250;

/// Builds the native label of an outgoing message from its headers.
pub type LabelGenerator = Arc<dyn Fn(&Headers) -> String + Send + Sync>;

struct PreparedSend {
    destination: QueueAddress,
    message: WireMessage,
    isolated: bool,
}

/// Sends transport operations through a [`QueueService`].
#[derive(Clone)]
pub struct MessageDispatcher {
    service: Arc<dyn QueueService>,
    settings: TransportSettings,
    timeouts_queue: Option<QueueAddress>,
    label_generator: Option<LabelGenerator>,
}

impl MessageDispatcher {
    pub fn new(service: Arc<dyn QueueService>, settings: TransportSettings) -> Self {
        Self {
            service,
            settings,
            timeouts_queue: None,
            label_generator: None,
        }
    }

    /// Enable delayed delivery through `queue`.
    pub fn with_timeouts_queue(mut self, queue: QueueAddress) -> Self {
        self.timeouts_queue = Some(queue);
        self
    }

    pub fn with_label_generator(mut self, generator: LabelGenerator) -> Self {
        self.label_generator = Some(generator);
        self
    }

    pub fn timeouts_queue(&self) -> Option<&QueueAddress> {
        self.timeouts_queue.as_ref()
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Send every unicast operation of `operations`.
    ///
    /// Non-isolated sends enlist in the transaction carried by `transaction`
    /// when it is still active.
    ///
    /// # Errors
    ///
    /// Validation errors are returned before anything is sent. A missing
    /// destination queue is reported as [`DispatchError::QueueNotFound`],
    /// every other queue-service failure as [`DispatchError::SendFailed`].
    pub async fn dispatch(
        &self,
        operations: TransportOperations,
        transaction: &TransportTransaction,
    ) -> Result<(), DispatchError> {
        if !operations.multicast.is_empty() {
            return Err(DispatchError::UnicastOnly);
        }

        let now = Utc::now();
        let prepared = operations
            .unicast
            .into_iter()
            .map(|operation| self.prepare(operation, now))
            .collect::<Result<Vec<_>, _>>()?;

        for send in prepared {
            let send_transaction = self.send_transaction(send.isolated, transaction);
            debug!(
                destination = %send.destination,
                transactional = send_transaction.is_transactional(),
                "Sending message"
            );
            self.service
                .send(&send.destination, send.message, send_transaction)
                .await
                .map_err(|source| classify_send_error(&send.destination, source))?;
        }

        Ok(())
    }

    fn prepare(
        &self,
        operation: TransportOperation,
        now: DateTime<Utc>,
    ) -> Result<PreparedSend, DispatchError> {
        let destination = QueueAddress::parse(&operation.destination, self.service.local_machine())
            .map_err(|source| DispatchError::InvalidDestination {
                destination: operation.destination.clone(),
                source,
            })?;

        let time_to_be_received = operation.time_to_be_received();
        let due_at = self.due_at(&operation, time_to_be_received, now)?;
        let non_durable = operation.is_non_durable();
        let TransportOperation {
            message,
            consistency,
            properties,
            ..
        } = operation;
        let OutgoingMessage {
            message_id,
            mut headers,
            body,
        } = message;

        let mut target = destination.clone();
        if let Some(due_at) = due_at {
            if let Some(timeouts_queue) = &self.timeouts_queue {
                headers.insert(TIMEOUT_DESTINATION.to_string(), destination.to_string());
                headers.insert(TIMEOUT_AT.to_string(), to_wire_format(due_at));
                target = timeouts_queue.clone();
            }
        }

        let mut native_time_to_be_received = time_to_be_received;
        if let Some(ttbr) = time_to_be_received {
            if self.settings.use_transactional_queues {
                if !self.settings.disable_native_ttbr_in_transactions {
                    return Err(DispatchError::TimeToBeReceivedInTransaction {
                        destination: destination.to_string(),
                    });
                }
                native_time_to_be_received = None;
                headers.insert(TIME_TO_BE_RECEIVED.to_string(), format_time_span(ttbr));
                headers
                    .entry(TIME_SENT.to_string())
                    .or_insert_with(|| to_wire_format(now));
            }
        }

        if non_durable {
            headers.insert(NON_DURABLE_MESSAGE.to_string(), "True".to_string());
        }

        let label = self.label_for(&headers)?;
        let outgoing = OutgoingMessage::new(message_id, headers, body);
        let mut wire = headers::to_wire_message(&outgoing, self.service.local_machine())?;

        wire.label = label;
        wire.time_to_be_received = native_time_to_be_received;
        wire.time_to_reach_queue = self.settings.time_to_reach_queue();
        wire.recoverable = !non_durable;
        wire.use_dead_letter_queue = due_at.is_some()
            || properties.use_dead_letter_queue.unwrap_or(if time_to_be_received.is_some() {
                self.settings.use_dead_letter_queue_for_messages_with_ttbr
            } else {
                self.settings.use_dead_letter_queue
            });
        wire.use_journal_queue = properties
            .use_journal_queue
            .unwrap_or(self.settings.use_journal_queue);

        Ok(PreparedSend {
            destination: target,
            message: wire,
            isolated: consistency == DispatchConsistency::Isolated,
        })
    }

    /// Future delivery time requested by the operation, if any.
    fn due_at(
        &self,
        operation: &TransportOperation,
        time_to_be_received: Option<std::time::Duration>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, DispatchError> {
        let mut delay_until = None;
        let mut delay_by = None;
        for constraint in &operation.constraints {
            match constraint {
                DeliveryConstraint::DelayUntil(at) => delay_until = Some(*at),
                DeliveryConstraint::DelayBy(delay) => delay_by = Some(*delay),
                _ => {}
            }
        }

        let due_at = match (delay_until, delay_by) {
            (None, None) => return Ok(None),
            (Some(_), Some(_)) => return Err(DispatchError::ConflictingDelayConstraints),
            (Some(at), None) => at,
            (None, Some(delay)) => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .ok_or(DispatchError::InvalidDelay { delay })?,
        };

        if self.timeouts_queue.is_none() {
            return Err(DispatchError::DelayedDeliveryNotEnabled);
        }
        if time_to_be_received.is_some() {
            return Err(DispatchError::DelayedWithTimeToBeReceived);
        }

        Ok((due_at > now).then_some(due_at))
    }

    fn label_for(&self, headers: &Headers) -> Result<Option<String>, DispatchError> {
        let Some(generator) = &self.label_generator else {
            return Ok(None);
        };
        let label = generator(headers);
        let length = label.chars().count();
        if length > MAX_LABEL_LENGTH {
            return Err(DispatchError::LabelTooLong {
                length,
                max: MAX_LABEL_LENGTH,
            });
        }
        Ok(Some(label))
    }

    fn send_transaction<'a>(
        &self,
        isolated: bool,
        transaction: &'a TransportTransaction,
    ) -> SendTransaction<'a> {
        let standalone = if self.settings.use_transactional_queues {
            SendTransaction::Single
        } else {
            SendTransaction::None
        };
        if isolated {
            return standalone;
        }
        match transaction.transaction() {
            Some(active) if active.is_active() => SendTransaction::Enlisted(active),
            _ => standalone,
        }
    }
}

fn classify_send_error(destination: &QueueAddress, source: QueueError) -> DispatchError {
    match source {
        QueueError::QueueNotFound { .. } => DispatchError::QueueNotFound {
            destination: destination.to_string(),
            source,
        },
        _ => DispatchError::SendFailed {
            destination: destination.to_string(),
            source,
        },
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
