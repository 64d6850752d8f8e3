//! Explicit transaction handles.
//!
//! A [`Transaction`] is either *native* (local to the queuing service) or
//! *ambient* (spanning the queue and any other resource that enlists). It is
//! passed explicitly through the call chain; there is no implicit "current"
//! transaction.

use crate::error::QueueError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Native,
    Ambient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
    #[default]
    ReadCommitted,
    ReadUncommitted,
    Snapshot,
}

/// Work performed on behalf of a transaction when it completes.
#[async_trait]
pub trait Enlistment: Send + Sync {
    async fn commit(&self) -> Result<(), QueueError>;
    async fn rollback(&self) -> Result<(), QueueError>;
}

struct TransactionState {
    status: TransactionStatus,
    enlistments: Vec<Arc<dyn Enlistment>>,
}

struct TransactionInner {
    id: String,
    kind: TransactionKind,
    isolation_level: Option<IsolationLevel>,
    timeout: Option<Duration>,
    started_at: Instant,
    state: Mutex<TransactionState>,
}

/// Cloneable handle to a single unit of work.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("status", &self.status())
            .finish()
    }
}

impl Transaction {
    /// Begin a transaction local to the queuing service.
    pub fn native() -> Self {
        Self::begin(TransactionKind::Native, None, None)
    }

    /// Begin an ambient transaction that other resources may enlist in.
    pub fn ambient(isolation_level: IsolationLevel, timeout: Duration) -> Self {
        Self::begin(TransactionKind::Ambient, Some(isolation_level), Some(timeout))
    }

    fn begin(
        kind: TransactionKind,
        isolation_level: Option<IsolationLevel>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: Uuid::new_v4().to_string(),
                kind,
                isolation_level,
                timeout,
                started_at: Instant::now(),
                state: Mutex::new(TransactionState {
                    status: TransactionStatus::Active,
                    enlistments: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.inner.kind
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.inner.isolation_level
    }

    pub fn status(&self) -> TransactionStatus {
        self.lock_state().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// Register work to run when the transaction commits or rolls back.
    pub fn enlist(&self, enlistment: Arc<dyn Enlistment>) -> Result<(), QueueError> {
        let mut state = self.lock_state();
        if state.status != TransactionStatus::Active {
            return Err(QueueError::TransactionNotActive {
                transaction_id: self.inner.id.clone(),
            });
        }
        state.enlistments.push(enlistment);
        Ok(())
    }

    /// Commit all enlisted work in enlistment order.
    ///
    /// An ambient transaction past its timeout is rolled back instead. If an
    /// enlistment fails to commit, the remaining ones are rolled back.
    pub async fn commit(&self) -> Result<(), QueueError> {
        let enlistments = self.complete(TransactionStatus::Committed)?;

        if let Some(timeout) = self.inner.timeout {
            if self.inner.started_at.elapsed() > timeout {
                warn!(
                    transaction_id = %self.inner.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Transaction timed out before commit, rolling back"
                );
                self.set_status(TransactionStatus::Aborted);
                rollback_all(&enlistments).await;
                return Err(QueueError::TransactionTimedOut {
                    transaction_id: self.inner.id.clone(),
                    timeout,
                });
            }
        }

        for (index, enlistment) in enlistments.iter().enumerate() {
            if let Err(e) = enlistment.commit().await {
                self.set_status(TransactionStatus::Aborted);
                rollback_all(&enlistments[index + 1..]).await;
                return Err(e);
            }
        }

        debug!(transaction_id = %self.inner.id, "Transaction committed");
        Ok(())
    }

    /// Roll back all enlisted work in reverse order. The first failure is
    /// returned after every enlistment has been attempted.
    pub async fn abort(&self) -> Result<(), QueueError> {
        let enlistments = self.complete(TransactionStatus::Aborted)?;

        let mut first_error = None;
        for enlistment in enlistments.iter().rev() {
            if let Err(e) = enlistment.rollback().await {
                warn!(transaction_id = %self.inner.id, error = %e, "Rollback failed");
                first_error.get_or_insert(e);
            }
        }

        debug!(transaction_id = %self.inner.id, "Transaction aborted");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn complete(&self, status: TransactionStatus) -> Result<Vec<Arc<dyn Enlistment>>, QueueError> {
        let mut state = self.lock_state();
        if state.status != TransactionStatus::Active {
            return Err(QueueError::TransactionNotActive {
                transaction_id: self.inner.id.clone(),
            });
        }
        state.status = status;
        Ok(std::mem::take(&mut state.enlistments))
    }

    fn set_status(&self, status: TransactionStatus) {
        self.lock_state().status = status;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TransactionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn rollback_all(enlistments: &[Arc<dyn Enlistment>]) {
    for enlistment in enlistments.iter().rev() {
        if let Err(e) = enlistment.rollback().await {
            warn!(error = %e, "Rollback failed");
        }
    }
}

/// Aborts a transaction that is still active when the guard is dropped.
///
/// A receive that unwinds or is cancelled before completing its transaction
/// would otherwise leave the received message invisible on its queue.
pub struct AbortOnDrop {
    transaction: Transaction,
}

impl AbortOnDrop {
    pub fn new(transaction: Transaction) -> Self {
        Self { transaction }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if !self.transaction.is_active() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                transaction_id = %self.transaction.id(),
                "Active transaction abandoned outside a runtime, it can not be aborted"
            );
            return;
        };

        warn!(
            transaction_id = %self.transaction.id(),
            "Active transaction abandoned, aborting"
        );
        let transaction = self.transaction.clone();
        runtime.spawn(async move {
            if let Err(e) = transaction.abort().await {
                debug!(transaction_id = %transaction.id(), error = %e, "Abandoned transaction not aborted");
            }
        });
    }
}

/// Carrier for the transaction a received message is processed under.
///
/// The dispatcher consults it to decide whether an outgoing send enlists in
/// the receive transaction.
#[derive(Debug, Clone, Default)]
pub struct TransportTransaction {
    transaction: Option<Transaction>,
}

impl TransportTransaction {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_transaction(transaction: Transaction) -> Self {
        Self {
            transaction: Some(transaction),
        }
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn native_transaction(&self) -> Option<&Transaction> {
        self.transaction
            .as_ref()
            .filter(|t| t.kind() == TransactionKind::Native)
    }

    pub fn ambient_transaction(&self) -> Option<&Transaction> {
        self.transaction
            .as_ref()
            .filter(|t| t.kind() == TransactionKind::Ambient)
    }
}

#[cfg(test)]
#[path = "transaction_tests.rs"]
mod tests;
