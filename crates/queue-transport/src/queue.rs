//! Interface to the native queuing service.

use crate::address::QueueAddress;
use crate::error::QueueError;
use crate::message::WireMessage;
use crate::transaction::Transaction;
use async_trait::async_trait;
use std::time::Duration;

/// Transaction a receive participates in.
#[derive(Debug, Clone, Copy)]
pub enum ReceiveTransaction<'a> {
    /// The message is removed from the queue immediately.
    None,
    /// The message is removed when the transaction commits and returned to
    /// the head of the queue when it rolls back.
    Enlisted(&'a Transaction),
}

/// Transaction a send participates in.
#[derive(Debug, Clone, Copy)]
pub enum SendTransaction<'a> {
    /// Non-transactional send. Only valid for non-transactional queues.
    None,
    /// A transaction covering this single send.
    Single,
    /// The message becomes visible when the transaction commits.
    Enlisted(&'a Transaction),
}

impl SendTransaction<'_> {
    pub fn is_transactional(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Operations the transport needs from the queuing service.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Name of the machine hosting the service.
    fn local_machine(&self) -> &str;

    async fn queue_exists(&self, queue: &QueueAddress) -> Result<bool, QueueError>;

    async fn is_transactional(&self, queue: &QueueAddress) -> Result<bool, QueueError>;

    /// Wait up to `timeout` for a message to become available without
    /// removing it. Returns `false` when the timeout elapsed.
    async fn peek(&self, queue: &QueueAddress, timeout: Duration) -> Result<bool, QueueError>;

    /// Remove the next message, waiting up to `timeout`.
    async fn receive(
        &self,
        queue: &QueueAddress,
        timeout: Duration,
        transaction: ReceiveTransaction<'_>,
    ) -> Result<Option<WireMessage>, QueueError>;

    async fn send(
        &self,
        queue: &QueueAddress,
        message: WireMessage,
        transaction: SendTransaction<'_>,
    ) -> Result<(), QueueError>;

    /// Remove every message from the queue. Returns the number removed.
    async fn purge(&self, queue: &QueueAddress) -> Result<usize, QueueError>;

    /// Drop cached queue handles so the next operation reconnects.
    fn clear_connection_cache(&self) {}
}
