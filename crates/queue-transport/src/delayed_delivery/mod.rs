//! # Delayed Delivery
//!
//! Messages sent with a future delivery time are redirected by the
//! [`MessageDispatcher`](crate::dispatcher::MessageDispatcher) to a timeouts
//! queue. A dedicated pump drains that queue into a [`DelayedMessageStore`];
//! the [`DueDelayedMessagePoller`] dispatches stored messages to their
//! original destination once they become due.

use crate::message::{Headers, NativeMessageId};
use bytes::Bytes;
use chrono::{DateTime, Utc};

mod handler;
mod poller;
mod pump;
mod store;

pub use handler::{DelayedDeliveryErrorHandler, DelayedDeliveryHandler};
pub use poller::{DueDelayedMessagePoller, PollerBreakers};
pub use pump::DelayedDeliveryPump;
pub use store::{DelayedMessageStore, InMemoryDelayedMessageStore, StoreError};

#[cfg(test)]
pub use store::MockDelayedMessageStore;

/// A message waiting in the store for its delivery time.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedMessage {
    /// Native id of the message on the timeouts queue
    pub id: NativeMessageId,
    /// Message id of the outgoing message
    pub message_id: String,
    pub destination: String,
    pub due_at: DateTime<Utc>,
    pub headers: Headers,
    pub body: Bytes,
    /// Failed dispatch attempts so far
    pub failure_count: u32,
}

impl DelayedMessage {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }
}
