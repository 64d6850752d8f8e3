//! Transaction capabilities of the four receive modes.

use crate::config::{TransactionMode, TransportSettings};
use crate::transaction::{IsolationLevel, Transaction, TransportTransaction};
use std::time::Duration;

/// How a receive strategy scopes the transaction around one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionPolicy {
    /// Messages are removed on receive; failures are not redelivered.
    None,
    /// Native transaction around the receive; sends are not enlisted.
    ReceiveOnly,
    /// Native transaction exposed to the processing callback.
    SendsAtomicWithReceive,
    /// Ambient transaction exposed to the processing callback.
    TransactionScope {
        isolation_level: IsolationLevel,
        timeout: Duration,
    },
}

impl TransactionPolicy {
    pub fn from_settings(settings: &TransportSettings) -> Self {
        match settings.transaction_mode {
            TransactionMode::None => Self::None,
            TransactionMode::ReceiveOnly => Self::ReceiveOnly,
            TransactionMode::SendsAtomicWithReceive => Self::SendsAtomicWithReceive,
            TransactionMode::TransactionScope => Self::TransactionScope {
                isolation_level: settings.transaction_scope.isolation_level,
                timeout: settings.transaction_scope.timeout(),
            },
        }
    }

    pub fn mode(&self) -> TransactionMode {
        match self {
            Self::None => TransactionMode::None,
            Self::ReceiveOnly => TransactionMode::ReceiveOnly,
            Self::SendsAtomicWithReceive => TransactionMode::SendsAtomicWithReceive,
            Self::TransactionScope { .. } => TransactionMode::TransactionScope,
        }
    }

    /// Start the transaction for one receive, if the mode uses one.
    pub fn begin(&self) -> Option<Transaction> {
        match self {
            Self::None => None,
            Self::ReceiveOnly | Self::SendsAtomicWithReceive => Some(Transaction::native()),
            Self::TransactionScope {
                isolation_level,
                timeout,
            } => Some(Transaction::ambient(*isolation_level, *timeout)),
        }
    }

    /// What the processing callback sees of the receive transaction.
    pub fn expose(&self, transaction: &Transaction) -> TransportTransaction {
        match self {
            Self::None | Self::ReceiveOnly => TransportTransaction::none(),
            Self::SendsAtomicWithReceive | Self::TransactionScope { .. } => {
                TransportTransaction::with_transaction(transaction.clone())
            }
        }
    }
}
