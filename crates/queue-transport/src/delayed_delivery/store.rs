//! Persistence seam for delayed messages.

use super::DelayedMessage;
use crate::message::NativeMessageId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Delayed message store is unavailable: {message}")]
    Unavailable { message: String },

    #[error("Delayed message store rejected message {id}: {message}")]
    Rejected { id: String, message: String },
}

/// Storage for messages waiting for their delivery time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DelayedMessageStore: Send + Sync {
    /// Store a message. Storing a message with a known id replaces it.
    async fn store(&self, message: DelayedMessage) -> Result<(), StoreError>;

    /// Remove and return every message due at `now`.
    async fn fetch_due(&self, now: DateTime<Utc>) -> Result<Vec<DelayedMessage>, StoreError>;

    /// Earliest due time of the stored messages.
    async fn next_due(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Process-local store, ordered by insertion.
#[derive(Debug, Default)]
pub struct InMemoryDelayedMessageStore {
    messages: Mutex<IndexMap<NativeMessageId, DelayedMessage>>,
}

impl InMemoryDelayedMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &NativeMessageId) -> Option<DelayedMessage> {
        self.lock().get(id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<NativeMessageId, DelayedMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DelayedMessageStore for InMemoryDelayedMessageStore {
    async fn store(&self, message: DelayedMessage) -> Result<(), StoreError> {
        self.lock().insert(message.id.clone(), message);
        Ok(())
    }

    async fn fetch_due(&self, now: DateTime<Utc>) -> Result<Vec<DelayedMessage>, StoreError> {
        let mut messages = self.lock();
        let due: Vec<NativeMessageId> = messages
            .values()
            .filter(|message| message.is_due(now))
            .map(|message| message.id.clone())
            .collect();
        Ok(due
            .iter()
            .filter_map(|id| messages.shift_remove(id))
            .collect())
    }

    async fn next_due(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.lock().values().map(|message| message.due_at).min())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
