//! Callback contracts between the transport and its host.

use crate::message::{Headers, NativeMessageId};
use crate::transaction::TransportTransaction;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// A received, decoded message handed to the processing callback.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub native_message_id: NativeMessageId,
    pub headers: Headers,
    pub body: Bytes,
    /// Transaction outgoing sends may enlist in
    pub transport_transaction: TransportTransaction,
}

/// Result of the processing callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Commit the receive.
    Complete,
    /// Roll back the receive without recording a failure.
    Abort,
}

/// A processing failure handed to the error callback.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub error: Arc<anyhow::Error>,
    pub native_message_id: NativeMessageId,
    pub headers: Headers,
    pub body: Bytes,
    pub transport_transaction: TransportTransaction,
    /// Failed attempts of this message observed by this endpoint
    pub immediate_processing_failures: u32,
}

/// Decision of the error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandleResult {
    /// Process the message again.
    RetryRequired,
    /// The error callback dealt with the message; consume it.
    Handled,
}

/// Turns a received message into business processing.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<ProcessingOutcome>;
}

/// Recoverability policy supplied by the host.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult>;
}

/// Sink for failures that should halt the endpoint.
pub trait CriticalError: Send + Sync {
    fn raise(&self, description: &str, error: &anyhow::Error);
}

impl<F> CriticalError for F
where
    F: Fn(&str, &anyhow::Error) + Send + Sync,
{
    fn raise(&self, description: &str, error: &anyhow::Error) {
        self(description, error)
    }
}
