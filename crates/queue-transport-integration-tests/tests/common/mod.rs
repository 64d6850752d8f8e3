//! Common test utilities for queue-transport integration tests
//!
//! This module provides:
//! - Recording implementations of the processing callbacks
//! - An endpoint fixture over the in-memory queue service
//! - Helpers for sending well-formed and poison messages

use async_trait::async_trait;
use bytes::Bytes;
use queue_transport::delayed_delivery::InMemoryDelayedMessageStore;
use queue_transport::headers::MESSAGE_ID;
use queue_transport::providers::InMemoryQueueService;
use queue_transport::queue::SendTransaction;
use queue_transport::{
    CompositePump, CriticalError, ErrorContext, ErrorHandleResult, ErrorHandler, Headers,
    MessageContext, MessageDispatcher, MessageHandler, OutgoingMessage, ProcessingCallbacks,
    ProcessingOutcome, PushSettings, QueueAddress, QueueService, QueueTransport, TransactionMode,
    TransportOperation, TransportSettings, TransportTransaction, WireMessage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MACHINE: &str = "TESTHOST";

// ============================================================================
// Processing Handler
// ============================================================================

/// Processing callback that can fail, stall and produce a side effect.
#[derive(Default)]
#[allow(dead_code)]
pub struct ScriptedHandler {
    failures_remaining: AtomicUsize,
    delay: Duration,
    side_effect: Option<(MessageDispatcher, String)>,
    attempts: AtomicUsize,
    completed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    bodies: Mutex<Vec<Bytes>>,
}

#[allow(dead_code)]
impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `count` invocations.
    pub fn failing_first(mut self, count: usize) -> Self {
        self.failures_remaining = AtomicUsize::new(count);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Send a copy of every processed message to `queue` through the
    /// receive's transport transaction.
    pub fn with_side_effect(mut self, dispatcher: MessageDispatcher, queue: &str) -> Self {
        self.side_effect = Some((dispatcher, queue.to_string()));
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<Bytes> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<ProcessingOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some((dispatcher, queue)) = &self.side_effect {
            let operation = TransportOperation::new(
                queue.clone(),
                OutgoingMessage::new("side-effect", Headers::new(), context.body.clone()),
            );
            dispatcher
                .dispatch(operation.into(), &context.transport_transaction)
                .await?;
        }

        let fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if fail {
            anyhow::bail!("simulated processing failure");
        }

        self.bodies.lock().unwrap().push(context.body);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessingOutcome::Complete)
    }
}

// ============================================================================
// Error Handler
// ============================================================================

/// Error callback recording the attempt count of every invocation.
pub struct RecordingErrorHandler {
    result: ErrorHandleResult,
    attempts: Mutex<Vec<u32>>,
}

#[allow(dead_code)]
impl RecordingErrorHandler {
    pub fn retrying() -> Self {
        Self {
            result: ErrorHandleResult::RetryRequired,
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn handling() -> Self {
        Self {
            result: ErrorHandleResult::Handled,
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ErrorHandler for RecordingErrorHandler {
    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult> {
        self.attempts
            .lock()
            .unwrap()
            .push(context.immediate_processing_failures);
        Ok(self.result)
    }
}

#[derive(Default)]
pub struct RecordingCriticalErrors(Mutex<Vec<String>>);

#[allow(dead_code)]
impl RecordingCriticalErrors {
    pub fn raised(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl CriticalError for RecordingCriticalErrors {
    fn raise(&self, description: &str, _error: &anyhow::Error) {
        self.0.lock().unwrap().push(description.to_string());
    }
}

// ============================================================================
// Endpoint Fixture
// ============================================================================

/// An endpoint receiving from `orders` with failures going to `error`.
pub struct TestEndpoint {
    pub service: Arc<InMemoryQueueService>,
    pub settings: TransportSettings,
    pub input: QueueAddress,
    pub error: QueueAddress,
    pub transport: QueueTransport,
}

#[allow(dead_code)]
impl TestEndpoint {
    pub fn new(mode: TransactionMode) -> Self {
        Self::with_settings(TransportSettings {
            transaction_mode: mode,
            use_transactional_queues: mode != TransactionMode::None,
            peek_timeout_ms: 50,
            ..Default::default()
        })
    }

    pub fn with_settings(settings: TransportSettings) -> Self {
        let service = Arc::new(InMemoryQueueService::new(MACHINE));
        let transactional = settings.use_transactional_queues;
        let input = service.create_local_queue("orders", transactional);
        let error = service.create_local_queue("error", transactional);
        let transport = QueueTransport::new(service.clone(), settings.clone(), "orders")
            .expect("valid transport settings");
        Self {
            service,
            settings,
            input,
            error,
            transport,
        }
    }

    /// Enable delayed delivery backed by an in-memory store and create the
    /// timeouts queue.
    pub fn with_delayed_delivery(mut self) -> Self {
        self.transport = self
            .transport
            .with_delayed_delivery(Arc::new(InMemoryDelayedMessageStore::new()));
        if let Some(timeouts) = self.transport.timeouts_queue() {
            self.service
                .create_queue(timeouts, self.settings.use_transactional_queues);
        }
        self
    }

    pub fn timeouts_queue(&self) -> QueueAddress {
        self.transport
            .timeouts_queue()
            .cloned()
            .expect("delayed delivery is enabled")
    }

    /// Create another local queue with the endpoint's transactionality.
    pub fn create_queue(&self, queue: &str) -> QueueAddress {
        self.service
            .create_local_queue(queue, self.settings.use_transactional_queues)
    }

    pub fn dispatcher(&self) -> MessageDispatcher {
        self.transport.dispatcher()
    }

    /// Initialize and start the endpoint's pumps.
    pub async fn start(
        &self,
        handler: Arc<ScriptedHandler>,
        error_handler: Arc<RecordingErrorHandler>,
        max_concurrency: usize,
    ) -> CompositePump {
        let mut pump = self.transport.message_pump();
        pump.init(
            ProcessingCallbacks {
                on_message: handler,
                on_error: error_handler,
                critical_error: Arc::new(RecordingCriticalErrors::default()),
            },
            PushSettings::new("orders", "error", self.settings.transaction_mode),
        )
        .await
        .expect("pump initializes");
        pump.start(max_concurrency).expect("pump starts");
        pump
    }

    /// Send `count` well-formed messages to the input queue.
    pub async fn send_messages(&self, count: usize) {
        for i in 0..count {
            let mut headers = Headers::new();
            headers.insert(MESSAGE_ID.to_string(), format!("message-{i}"));
            self.dispatcher()
                .dispatch(
                    TransportOperation::new(
                        "orders",
                        OutgoingMessage::new(
                            format!("message-{i}"),
                            headers,
                            Bytes::from(format!("body {i}")),
                        ),
                    )
                    .into(),
                    &TransportTransaction::none(),
                )
                .await
                .expect("message is sent");
        }
    }

    /// Send a message whose extension can not be decoded into headers.
    pub async fn send_poison(&self) {
        let transaction = if self.settings.use_transactional_queues {
            SendTransaction::Single
        } else {
            SendTransaction::None
        };
        let message = WireMessage {
            body: Bytes::from_static(b"poison body"),
            extension: Bytes::from_static(b"not a header list"),
            recoverable: true,
            ..Default::default()
        };
        self.service
            .send(&self.input, message, transaction)
            .await
            .expect("poison message is sent");
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition met before timeout");
}
