//! Tests for the composite pump.

use super::*;
use crate::address::QueueAddress;
use crate::config::{DelayedDeliveryConfig, TransactionMode, TransportSettings};
use crate::delayed_delivery::InMemoryDelayedMessageStore;
use crate::dispatcher::MessageDispatcher;
use crate::message::{DeliveryConstraint, Headers, OutgoingMessage, TransportOperation, WireMessage};
use crate::processing::{
    ErrorContext, ErrorHandleResult, ErrorHandler, MessageContext, MessageHandler,
    ProcessingOutcome,
};
use crate::providers::InMemoryQueueService;
use crate::queue::{QueueService, SendTransaction};
use crate::transaction::TransportTransaction;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MACHINE: &str = "TESTHOST";

#[derive(Default)]
struct CountingHandler(AtomicUsize);

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn on_message(&self, _context: MessageContext) -> anyhow::Result<ProcessingOutcome> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessingOutcome::Complete)
    }
}

struct RetryErrors;

#[async_trait]
impl ErrorHandler for RetryErrors {
    async fn on_error(&self, _context: ErrorContext) -> anyhow::Result<ErrorHandleResult> {
        Ok(ErrorHandleResult::RetryRequired)
    }
}

struct Setup {
    service: InMemoryQueueService,
    settings: TransportSettings,
    timeouts: QueueAddress,
    billing: QueueAddress,
}

fn setup() -> Setup {
    let service = InMemoryQueueService::new(MACHINE);
    service.create_local_queue("orders", true);
    service.create_local_queue("error", true);
    let timeouts = service.create_local_queue("orders.timeouts", true);
    let billing = service.create_local_queue("billing", true);
    let settings = TransportSettings {
        peek_timeout_ms: 50,
        delayed_delivery: Some(DelayedDeliveryConfig::default()),
        ..Default::default()
    };
    Setup {
        service,
        settings,
        timeouts,
        billing,
    }
}

fn callbacks(handler: Arc<CountingHandler>) -> ProcessingCallbacks {
    ProcessingCallbacks {
        on_message: handler,
        on_error: Arc::new(RetryErrors),
        critical_error: Arc::new(|_: &str, _: &anyhow::Error| {}),
    }
}

fn push() -> PushSettings {
    PushSettings::new("orders", "error", TransactionMode::SendsAtomicWithReceive)
}

fn composite(s: &Setup, dispatcher: &MessageDispatcher) -> CompositePump {
    let service: Arc<InMemoryQueueService> = Arc::new(s.service.clone());
    CompositePump::new(MessagePump::new(service.clone(), s.settings.clone())).with_delayed_delivery(
        DelayedDeliveryPump::new(
            service,
            s.settings.clone(),
            dispatcher.clone(),
            Arc::new(InMemoryDelayedMessageStore::new()),
            s.timeouts.clone(),
        ),
    )
}

#[tokio::test]
async fn test_main_pump_only() {
    let s = setup();
    let mut pump = CompositePump::new(MessagePump::new(
        Arc::new(s.service.clone()),
        s.settings.clone(),
    ));

    pump.init(callbacks(Arc::default()), push()).await.unwrap();
    pump.start(1).unwrap();
    assert!(pump.main().is_running());
    assert!(pump.delayed_delivery().is_none());

    pump.stop().await;
    assert!(!pump.main().is_running());
}

#[tokio::test]
async fn test_init_fails_when_timeouts_queue_is_missing() {
    let s = setup();
    s.service.delete_queue(&s.timeouts);
    let dispatcher = MessageDispatcher::new(Arc::new(s.service.clone()), s.settings.clone())
        .with_timeouts_queue(s.timeouts.clone());
    let mut pump = composite(&s, &dispatcher);

    let result = pump.init(callbacks(Arc::default()), push()).await;

    assert!(matches!(result, Err(ConfigurationError::QueueNotFound { .. })));
}

#[tokio::test]
async fn test_start_before_init_fails() {
    let s = setup();
    let dispatcher = MessageDispatcher::new(Arc::new(s.service.clone()), s.settings.clone())
        .with_timeouts_queue(s.timeouts.clone());
    let mut pump = composite(&s, &dispatcher);

    assert!(matches!(
        pump.start(1),
        Err(ConfigurationError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_delayed_message_reaches_destination() {
    let s = setup();
    let dispatcher = MessageDispatcher::new(Arc::new(s.service.clone()), s.settings.clone())
        .with_timeouts_queue(s.timeouts.clone());
    let mut pump = composite(&s, &dispatcher);
    pump.init(callbacks(Arc::default()), push()).await.unwrap();
    pump.start(2).unwrap();
    assert!(pump
        .delayed_delivery()
        .is_some_and(|delayed| delayed.poller().is_some()));

    let operation = TransportOperation::new(
        "billing",
        OutgoingMessage::new("invoice-1", Headers::new(), Bytes::from_static(b"invoice")),
    )
    .with_constraint(DeliveryConstraint::DelayBy(Duration::from_millis(300)));
    dispatcher
        .dispatch(operation.into(), &TransportTransaction::none())
        .await
        .unwrap();

    assert_eq!(s.service.message_count(&s.billing), 0);
    tokio::time::timeout(Duration::from_secs(5), async {
        while s.service.message_count(&s.billing) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    pump.stop().await;
    assert_eq!(s.service.message_count(&s.timeouts), 0);
    assert_eq!(s.service.messages(&s.billing)[0].body, Bytes::from_static(b"invoice"));
}

#[tokio::test]
async fn test_purge_on_startup_keeps_pending_delayed_messages() {
    let s = setup();
    let input = s.service.create_local_queue("orders", true);
    for queue in [&input, &s.timeouts] {
        s.service
            .send(queue, WireMessage::default(), SendTransaction::Single)
            .await
            .unwrap();
    }
    let dispatcher = MessageDispatcher::new(Arc::new(s.service.clone()), s.settings.clone())
        .with_timeouts_queue(s.timeouts.clone());
    let mut pump = composite(&s, &dispatcher);

    pump.init(callbacks(Arc::default()), push().with_purge_on_startup(true))
        .await
        .unwrap();

    assert_eq!(s.service.message_count(&input), 0);
    assert_eq!(s.service.message_count(&s.timeouts), 1);
}

#[tokio::test]
async fn test_failed_delayed_start_leaves_main_pump_stopped() {
    let mut s = setup();
    s.settings.delayed_delivery = Some(DelayedDeliveryConfig {
        max_concurrency: 0,
        ..Default::default()
    });
    let dispatcher = MessageDispatcher::new(Arc::new(s.service.clone()), s.settings.clone())
        .with_timeouts_queue(s.timeouts.clone());
    let mut pump = composite(&s, &dispatcher);
    pump.init(callbacks(Arc::default()), push()).await.unwrap();

    assert!(matches!(
        pump.start(1),
        Err(ConfigurationError::Invalid { .. })
    ));
    assert!(!pump.main().is_running());
}
