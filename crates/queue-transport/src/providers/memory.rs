//! In-memory queue service for testing and development.
//!
//! This service behaves like a local transactional queuing service:
//! - FIFO delivery with native ids of the form `{guid}\{sequence}`
//! - Transactional receive (rollback returns the message to the head of the queue)
//! - Transactional send (the message becomes visible on commit)
//! - Time-to-be-received expiry with an optional machine dead-letter queue
//! - Journal copies of consumed messages
//! - Fault injection for exercising failure paths

use crate::address::{local_machine_name, QueueAddress};
use crate::error::QueueError;
use crate::message::{NativeMessageId, WireMessage};
use crate::queue::{QueueService, ReceiveTransaction, SendTransaction};
use crate::transaction::{Enlistment, Transaction};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Operations that can be made to fail with [`InMemoryQueueService::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOperation {
    Peek,
    Receive,
    Send,
    Commit,
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Thread-safe storage for all queues
struct QueueStorage {
    instance: Uuid,
    sequence: u64,
    queues: HashMap<String, InMemoryQueue>,
    /// Machine-wide dead-letter queue for expired messages
    dead_letter: VecDeque<WireMessage>,
    faults: HashMap<QueueOperation, u32>,
}

impl QueueStorage {
    fn take_fault(&mut self, operation: QueueOperation) -> Result<(), QueueError> {
        match self.faults.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(QueueError::ConnectionFailed {
                    message: format!("injected {:?} failure", operation),
                })
            }
            _ => Ok(()),
        }
    }

    fn queue_mut(&mut self, queue: &QueueAddress) -> Result<&mut InMemoryQueue, QueueError> {
        self.queues
            .get_mut(&queue.key())
            .ok_or_else(|| QueueError::QueueNotFound {
                address: queue.to_string(),
            })
    }

    fn next_id(&mut self) -> NativeMessageId {
        self.sequence += 1;
        NativeMessageId::new(format!("{}\\{}", self.instance, self.sequence))
    }

    /// Assign an id and append the message to the queue.
    fn enqueue(&mut self, queue: &QueueAddress, mut message: WireMessage) -> Result<(), QueueError> {
        let id = self.next_id();
        let target = self.queue_mut(queue)?;
        message.id = Some(id);
        message.sent_at = Some(Utc::now());
        let expires_at = message
            .time_to_be_received
            .map(|ttbr| Instant::now() + ttbr);
        target.messages.push_back(StoredMessage {
            message,
            expires_at,
        });
        target.notify.notify_one();
        Ok(())
    }

    /// Move expired messages out of the queue.
    fn expire(&mut self, queue: &QueueAddress) -> Result<&mut InMemoryQueue, QueueError> {
        let now = Instant::now();
        let target = self
            .queues
            .get_mut(&queue.key())
            .ok_or_else(|| QueueError::QueueNotFound {
                address: queue.to_string(),
            })?;

        let mut kept = VecDeque::with_capacity(target.messages.len());
        for stored in target.messages.drain(..) {
            if stored.is_expired(now) {
                debug!(
                    queue = %queue,
                    native_message_id = %stored.message.native_id(),
                    "Message exceeded its time to be received"
                );
                if stored.message.use_dead_letter_queue {
                    self.dead_letter.push_back(stored.message);
                }
            } else {
                kept.push_back(stored);
            }
        }
        target.messages = kept;
        Ok(target)
    }
}

/// Internal queue state for a single queue
struct InMemoryQueue {
    transactional: bool,
    messages: VecDeque<StoredMessage>,
    journal: Vec<WireMessage>,
    notify: Arc<Notify>,
}

/// A message stored in the queue with its expiry
#[derive(Clone)]
struct StoredMessage {
    message: WireMessage,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

// ============================================================================
// Enlistments
// ============================================================================

/// Returns a received message to the head of its queue on rollback.
struct ReceiveEnlistment {
    storage: Arc<RwLock<QueueStorage>>,
    queue: QueueAddress,
    stored: StoredMessage,
}

impl ReceiveEnlistment {
    fn requeue(&self, storage: &mut QueueStorage) {
        if let Ok(target) = storage.queue_mut(&self.queue) {
            target.messages.push_front(self.stored.clone());
            target.notify.notify_one();
        }
    }
}

#[async_trait]
impl Enlistment for ReceiveEnlistment {
    async fn commit(&self) -> Result<(), QueueError> {
        let mut storage = write(&self.storage);
        if let Err(e) = storage.take_fault(QueueOperation::Commit) {
            self.requeue(&mut storage);
            return Err(e);
        }
        if self.stored.message.use_journal_queue {
            if let Ok(target) = storage.queue_mut(&self.queue) {
                target.journal.push(self.stored.message.clone());
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), QueueError> {
        let mut storage = write(&self.storage);
        self.requeue(&mut storage);
        Ok(())
    }
}

/// Makes a sent message visible on commit.
struct SendEnlistment {
    storage: Arc<RwLock<QueueStorage>>,
    queue: QueueAddress,
    message: WireMessage,
}

#[async_trait]
impl Enlistment for SendEnlistment {
    async fn commit(&self) -> Result<(), QueueError> {
        let mut storage = write(&self.storage);
        storage.take_fault(QueueOperation::Commit)?;
        storage.enqueue(&self.queue, self.message.clone())
    }

    async fn rollback(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

fn write(storage: &RwLock<QueueStorage>) -> RwLockWriteGuard<'_, QueueStorage> {
    storage
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// InMemoryQueueService
// ============================================================================

/// In-memory queue service implementation
#[derive(Clone)]
pub struct InMemoryQueueService {
    machine: String,
    storage: Arc<RwLock<QueueStorage>>,
}

impl InMemoryQueueService {
    /// Create a service for `machine`
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            storage: Arc::new(RwLock::new(QueueStorage {
                instance: Uuid::new_v4(),
                sequence: 0,
                queues: HashMap::new(),
                dead_letter: VecDeque::new(),
                faults: HashMap::new(),
            })),
        }
    }

    /// Create a queue on the local machine and return its address
    pub fn create_local_queue(&self, queue: &str, transactional: bool) -> QueueAddress {
        let address = QueueAddress::new(queue, self.machine.clone());
        self.create_queue(&address, transactional);
        address
    }

    /// Create a queue. Existing queues keep their messages.
    pub fn create_queue(&self, queue: &QueueAddress, transactional: bool) {
        write(&self.storage)
            .queues
            .entry(queue.key())
            .or_insert_with(|| InMemoryQueue {
                transactional,
                messages: VecDeque::new(),
                journal: Vec::new(),
                notify: Arc::new(Notify::new()),
            });
    }

    pub fn delete_queue(&self, queue: &QueueAddress) {
        write(&self.storage).queues.remove(&queue.key());
    }

    /// Make the next `times` calls of `operation` fail with a transient error
    pub fn fail_next(&self, operation: QueueOperation, times: u32) {
        *write(&self.storage).faults.entry(operation).or_default() += times;
    }

    /// Snapshot of the messages waiting in a queue
    pub fn messages(&self, queue: &QueueAddress) -> Vec<WireMessage> {
        self.with_queue(queue, |q| {
            q.messages.iter().map(|s| s.message.clone()).collect()
        })
        .unwrap_or_default()
    }

    pub fn message_count(&self, queue: &QueueAddress) -> usize {
        self.with_queue(queue, |q| q.messages.len()).unwrap_or(0)
    }

    /// Copies of consumed messages that requested journaling
    pub fn journal(&self, queue: &QueueAddress) -> Vec<WireMessage> {
        self.with_queue(queue, |q| q.journal.clone()).unwrap_or_default()
    }

    pub fn dead_letter_messages(&self) -> Vec<WireMessage> {
        let storage = self
            .storage
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        storage.dead_letter.iter().cloned().collect()
    }

    fn with_queue<R>(&self, queue: &QueueAddress, f: impl FnOnce(&InMemoryQueue) -> R) -> Option<R> {
        let mut storage = write(&self.storage);
        storage.expire(queue).ok().map(|q| f(q))
    }

    fn take_fault(&self, operation: QueueOperation) -> Result<(), QueueError> {
        write(&self.storage).take_fault(operation)
    }
}

impl Default for InMemoryQueueService {
    fn default() -> Self {
        Self::new(local_machine_name())
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    fn local_machine(&self) -> &str {
        &self.machine
    }

    async fn queue_exists(&self, queue: &QueueAddress) -> Result<bool, QueueError> {
        let storage = self
            .storage
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(storage.queues.contains_key(&queue.key()))
    }

    async fn is_transactional(&self, queue: &QueueAddress) -> Result<bool, QueueError> {
        let mut storage = write(&self.storage);
        Ok(storage.queue_mut(queue)?.transactional)
    }

    async fn peek(&self, queue: &QueueAddress, timeout: Duration) -> Result<bool, QueueError> {
        self.take_fault(QueueOperation::Peek)?;
        let deadline = Instant::now() + timeout;

        loop {
            let notify = {
                let mut storage = write(&self.storage);
                let target = storage.expire(queue)?;
                if !target.messages.is_empty() {
                    return Ok(true);
                }
                target.notify.clone()
            };

            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Ok(false);
            }
        }
    }

    async fn receive(
        &self,
        queue: &QueueAddress,
        timeout: Duration,
        transaction: ReceiveTransaction<'_>,
    ) -> Result<Option<WireMessage>, QueueError> {
        self.take_fault(QueueOperation::Receive)?;
        let deadline = Instant::now() + timeout;

        loop {
            let notify = {
                let mut storage = write(&self.storage);
                let target = storage.expire(queue)?;

                if let ReceiveTransaction::Enlisted(_) = transaction {
                    if !target.transactional {
                        return Err(QueueError::TransactionUsage {
                            address: queue.to_string(),
                            message: "transactional receive from a non-transactional queue"
                                .to_string(),
                        });
                    }
                }

                if let Some(stored) = target.messages.pop_front() {
                    let message = stored.message.clone();
                    match transaction {
                        ReceiveTransaction::None => {
                            if message.use_journal_queue {
                                target.journal.push(message.clone());
                            }
                        }
                        ReceiveTransaction::Enlisted(tx) => {
                            let enlistment = ReceiveEnlistment {
                                storage: self.storage.clone(),
                                queue: queue.clone(),
                                stored: stored.clone(),
                            };
                            if let Err(e) = tx.enlist(Arc::new(enlistment)) {
                                target.messages.push_front(stored);
                                return Err(e);
                            }
                        }
                    }
                    return Ok(Some(message));
                }
                target.notify.clone()
            };

            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn send(
        &self,
        queue: &QueueAddress,
        message: WireMessage,
        transaction: SendTransaction<'_>,
    ) -> Result<(), QueueError> {
        let mut storage = write(&self.storage);
        storage.take_fault(QueueOperation::Send)?;
        let transactional = storage.queue_mut(queue)?.transactional;

        if transactional != transaction.is_transactional() {
            let message = if transactional {
                "non-transactional send to a transactional queue"
            } else {
                "transactional send to a non-transactional queue"
            };
            return Err(QueueError::TransactionUsage {
                address: queue.to_string(),
                message: message.to_string(),
            });
        }

        match transaction {
            SendTransaction::None | SendTransaction::Single => storage.enqueue(queue, message),
            SendTransaction::Enlisted(tx) => enlist_send(tx, &self.storage, queue, message),
        }
    }

    async fn purge(&self, queue: &QueueAddress) -> Result<usize, QueueError> {
        let mut storage = write(&self.storage);
        let target = storage.queue_mut(queue)?;
        let purged = target.messages.len();
        target.messages.clear();
        Ok(purged)
    }
}

fn enlist_send(
    transaction: &Transaction,
    storage: &Arc<RwLock<QueueStorage>>,
    queue: &QueueAddress,
    message: WireMessage,
) -> Result<(), QueueError> {
    transaction.enlist(Arc::new(SendEnlistment {
        storage: storage.clone(),
        queue: queue.clone(),
        message,
    }))
}
