//! Message types exchanged with the queuing service and with callers.

use crate::address::QueueAddress;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Ordered header map. Insertion order is preserved on the wire.
pub type Headers = IndexMap<String, String>;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier assigned to a message by the queuing service, `{guid}\{sequence}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeMessageId(String);

impl NativeMessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NativeMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NativeMessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Intent of a message, carried natively in the application-specific field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageIntent {
    Send = 1,
    Publish = 2,
    Subscribe = 3,
    Unsubscribe = 4,
    Reply = 5,
}

impl MessageIntent {
    /// Numeric code stored in the application-specific field.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Send),
            2 => Some(Self::Publish),
            3 => Some(Self::Subscribe),
            4 => Some(Self::Unsubscribe),
            5 => Some(Self::Reply),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Publish => "Publish",
            Self::Subscribe => "Subscribe",
            Self::Unsubscribe => "Unsubscribe",
            Self::Reply => "Reply",
        }
    }
}

impl std::fmt::Display for MessageIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageIntent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Send" => Ok(Self::Send),
            "Publish" => Ok(Self::Publish),
            "Subscribe" => Ok(Self::Subscribe),
            "Unsubscribe" => Ok(Self::Unsubscribe),
            "Reply" => Ok(Self::Reply),
            other => Err(format!("unknown message intent '{}'", other)),
        }
    }
}

// ============================================================================
// Wire Message
// ============================================================================

/// The unit exchanged with the queuing service.
///
/// Headers travel encoded in `extension`; see [`crate::headers`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireMessage {
    /// Assigned by the queuing service on send. Empty on outgoing messages.
    pub id: Option<NativeMessageId>,
    pub body: Bytes,
    pub extension: Bytes,
    /// Native correlation token, `{guid}\{sequence}`. `None` means the
    /// service default.
    pub correlation_id: Option<String>,
    pub label: Option<String>,
    pub time_to_be_received: Option<Duration>,
    pub time_to_reach_queue: Option<Duration>,
    pub recoverable: bool,
    pub use_dead_letter_queue: bool,
    pub use_journal_queue: bool,
    pub app_specific: i32,
    pub response_queue: Option<QueueAddress>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl WireMessage {
    /// Native id, or an empty string for messages the service has not seen.
    pub fn native_id(&self) -> NativeMessageId {
        self.id
            .clone()
            .unwrap_or_else(|| NativeMessageId::new(String::new()))
    }
}

// ============================================================================
// Outgoing Operations
// ============================================================================

/// A message handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl OutgoingMessage {
    pub fn new(message_id: impl Into<String>, headers: Headers, body: Bytes) -> Self {
        Self {
            message_id: message_id.into(),
            headers,
            body,
        }
    }
}

/// Per-operation delivery requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryConstraint {
    /// Discard the message if it is not received within the duration.
    MaxTimeToBeReceived(Duration),
    /// Message does not need to survive a queue-service restart.
    NonDurable,
    DelayUntil(DateTime<Utc>),
    DelayBy(Duration),
}

/// Whether a send may enlist in the receive transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchConsistency {
    #[default]
    Default,
    Isolated,
}

/// Routing flags supplied by the caller, overriding transport defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchProperties {
    pub use_dead_letter_queue: Option<bool>,
    pub use_journal_queue: Option<bool>,
}

/// A message addressed to a single queue.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOperation {
    pub destination: String,
    pub message: OutgoingMessage,
    pub constraints: Vec<DeliveryConstraint>,
    pub consistency: DispatchConsistency,
    pub properties: DispatchProperties,
}

impl TransportOperation {
    pub fn new(destination: impl Into<String>, message: OutgoingMessage) -> Self {
        Self {
            destination: destination.into(),
            message,
            constraints: Vec::new(),
            consistency: DispatchConsistency::Default,
            properties: DispatchProperties::default(),
        }
    }

    pub fn with_constraint(mut self, constraint: DeliveryConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn isolated(mut self) -> Self {
        self.consistency = DispatchConsistency::Isolated;
        self
    }

    pub fn with_dead_letter_queue(mut self, enabled: bool) -> Self {
        self.properties.use_dead_letter_queue = Some(enabled);
        self
    }

    pub fn with_journal_queue(mut self, enabled: bool) -> Self {
        self.properties.use_journal_queue = Some(enabled);
        self
    }

    pub fn time_to_be_received(&self) -> Option<Duration> {
        self.constraints.iter().find_map(|c| match c {
            DeliveryConstraint::MaxTimeToBeReceived(ttbr) => Some(*ttbr),
            _ => None,
        })
    }

    pub fn is_non_durable(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| matches!(c, DeliveryConstraint::NonDurable))
    }
}

/// A message addressed to all subscribers of a type.
#[derive(Debug, Clone, PartialEq)]
pub struct MulticastTransportOperation {
    pub message_type: String,
    pub message: OutgoingMessage,
}

/// A batch of outgoing operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportOperations {
    pub unicast: Vec<TransportOperation>,
    pub multicast: Vec<MulticastTransportOperation>,
}

impl TransportOperations {
    pub fn new(unicast: Vec<TransportOperation>) -> Self {
        Self {
            unicast,
            multicast: Vec::new(),
        }
    }

    pub fn with_multicast(mut self, operation: MulticastTransportOperation) -> Self {
        self.multicast.push(operation);
        self
    }
}

impl From<TransportOperation> for TransportOperations {
    fn from(operation: TransportOperation) -> Self {
        Self::new(vec![operation])
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
