//! Error types for queue transport operations.

use std::time::Duration;
use thiserror::Error;

/// Failures reported by the underlying queuing service.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {address}")]
    QueueNotFound { address: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Invalid transaction usage on queue {address}: {message}")]
    TransactionUsage { address: String, message: String },

    #[error("Transaction {transaction_id} is no longer active")]
    TransactionNotActive { transaction_id: String },

    #[error("Transaction {transaction_id} timed out after {timeout:?}")]
    TransactionTimedOut {
        transaction_id: String,
        timeout: Duration,
    },

    #[error("Permission denied for operation: {operation}")]
    PermissionDenied { operation: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::TransactionUsage { .. } => false,
            Self::TransactionNotActive { .. } => false,
            Self::TransactionTimedOut { .. } => true,
            Self::PermissionDenied { .. } => false,
            Self::ProviderError { .. } => true,
        }
    }
}

/// Errors raised while parsing a `queue@machine` address string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,

    #[error("Address '{address}' contains more than one '@'")]
    MultipleMachineSeparators { address: String },

    #[error("Address '{address}' has an empty queue name")]
    EmptyQueue { address: String },

    #[error("Address '{address}' has an empty machine name")]
    EmptyMachine { address: String },
}

/// Errors raised while decoding or encoding the header blob of a message.
///
/// A message whose headers fail to decode is a poison message.
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("Header payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Header payload is not well-formed: {message}")]
    Malformed { message: String },

    #[error("Unexpected element <{name}> in header payload")]
    UnexpectedElement { name: String },

    #[error("Header entry {index} has no key")]
    MissingKey { index: usize },

    #[error("Header payload ended before </ArrayOfHeaderInfo>")]
    UnexpectedEnd,
}

impl From<quick_xml::Error> for HeaderError {
    fn from(error: quick_xml::Error) -> Self {
        Self::Malformed {
            message: error.to_string(),
        }
    }
}

/// Startup and settings validation failures. These are never retried.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Invalid queue address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("Queue '{queue}' is on machine '{machine}'; the pump can only receive from the local machine '{local_machine}'")]
    RemoteInputQueue {
        queue: String,
        machine: String,
        local_machine: String,
    },

    #[error("Queue '{queue}' does not exist")]
    QueueNotFound { queue: String },

    #[error("Queue '{queue}' must be transactional when the transport runs in {mode} mode")]
    QueueNotTransactional { queue: String, mode: String },

    #[error("Unable to inspect queue '{queue}': {source}")]
    QueueInspection {
        queue: String,
        #[source]
        source: QueueError,
    },

    #[error("Message pump has not been initialized")]
    NotInitialized,

    #[error("Message pump is already running")]
    AlreadyStarted,
}

/// Failures raised while dispatching outgoing messages.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Multicast operations are not supported; the transport is unicast only")]
    UnicastOnly,

    #[error("Invalid destination '{destination}': {source}")]
    InvalidDestination {
        destination: String,
        #[source]
        source: AddressError,
    },

    #[error("Failed to send message to address {destination}: the queue does not exist")]
    QueueNotFound {
        destination: String,
        #[source]
        source: QueueError,
    },

    #[error("Failed to send message to address {destination}: sending messages with a custom time to be received inside a transaction is not supported on transactional queues")]
    TimeToBeReceivedInTransaction { destination: String },

    #[error("Delayed delivery of messages is not enabled for this transport")]
    DelayedDeliveryNotEnabled,

    #[error("A message can not carry both a DelayUntil and a DelayBy constraint")]
    ConflictingDelayConstraints,

    #[error("Delivery delay of {delay:?} can not be represented")]
    InvalidDelay { delay: std::time::Duration },

    #[error("Delayed messages can not carry a time to be received")]
    DelayedWithTimeToBeReceived,

    #[error("Message label is {length} characters long; the queue service limit is {max}")]
    LabelTooLong { length: usize, max: usize },

    #[error("Unable to encode message headers: {0}")]
    Headers(#[from] HeaderError),

    #[error("Failed to send message to address {destination}: {source}")]
    SendFailed {
        destination: String,
        #[source]
        source: QueueError,
    },
}

impl DispatchError {
    /// Check if the failure is a transient queue-service outage.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::SendFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Umbrella error for pump and receive strategy operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Headers(#[from] HeaderError),

    #[error("Concurrency limiter closed")]
    LimiterClosed,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
