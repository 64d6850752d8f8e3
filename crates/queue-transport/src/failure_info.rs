//! Bounded cache of processing failures keyed by native message id.
//!
//! When a native transaction rolls back, the queuing service redelivers the
//! same message with the same id. The receive strategy consults this cache
//! so the failure can be handed to the error callback without running the
//! processing callback again.

use crate::message::NativeMessageId;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default number of tracked messages
pub const DEFAULT_CAPACITY: usize = 1_000;

/// Last failure recorded for a message and how often it failed.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub error: Arc<anyhow::Error>,
    pub attempts: u32,
}

/// LRU-style cache of [`FailureInfo`]. The least recently touched entry is
/// evicted once the capacity is exceeded.
#[derive(Debug)]
pub struct FailureInfoStorage {
    capacity: usize,
    entries: Mutex<IndexMap<NativeMessageId, FailureInfo>>,
}

impl FailureInfoStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Record a failure, incrementing the attempt count of known messages.
    pub fn record_failure(&self, message_id: &NativeMessageId, error: anyhow::Error) {
        self.record(message_id, Arc::new(error));
    }

    /// Record a failure whose error is already shared.
    pub fn record(&self, message_id: &NativeMessageId, error: Arc<anyhow::Error>) {
        let mut entries = self.lock();
        let attempts = entries
            .shift_remove(message_id)
            .map(|existing| existing.attempts + 1)
            .unwrap_or(1);
        entries.insert(message_id.clone(), FailureInfo { error, attempts });

        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }

    /// Look up a failure, marking the entry as recently used.
    pub fn get(&self, message_id: &NativeMessageId) -> Option<FailureInfo> {
        let mut entries = self.lock();
        let info = entries.shift_remove(message_id)?;
        entries.insert(message_id.clone(), info.clone());
        Some(info)
    }

    pub fn clear(&self, message_id: &NativeMessageId) {
        self.lock().shift_remove(message_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<NativeMessageId, FailureInfo>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FailureInfoStorage {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
#[path = "failure_info_tests.rs"]
mod tests;
