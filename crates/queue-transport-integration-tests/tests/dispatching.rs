//! Integration tests for outgoing dispatch
//!
//! These tests verify:
//! - Time-to-be-received handling on transactional queues
//! - Redirect of delayed messages to the timeouts queue
//! - Routing failures are reported distinctly from other send failures

mod common;

use bytes::Bytes;
use common::TestEndpoint;
use queue_transport::headers::{
    extract_headers, from_wire_format, parse_time_span, TIMEOUT_AT, TIMEOUT_DESTINATION,
    TIME_TO_BE_RECEIVED,
};
use queue_transport::{
    DeliveryConstraint, DispatchError, Headers, OutgoingMessage, TransactionMode,
    TransportOperation, TransportSettings, TransportTransaction,
};
use std::time::Duration;

fn invoice() -> OutgoingMessage {
    OutgoingMessage::new("invoice-1", Headers::new(), Bytes::from_static(b"invoice"))
}

fn endpoint_with(disable_native_ttbr_in_transactions: bool) -> TestEndpoint {
    TestEndpoint::with_settings(TransportSettings {
        transaction_mode: TransactionMode::SendsAtomicWithReceive,
        disable_native_ttbr_in_transactions,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_ttbr_on_transactional_queue_is_rejected() {
    let endpoint = endpoint_with(false);
    let billing = endpoint.create_queue("billing");

    let result = endpoint
        .dispatcher()
        .dispatch(
            TransportOperation::new("billing", invoice())
                .with_constraint(DeliveryConstraint::MaxTimeToBeReceived(Duration::from_secs(300)))
                .into(),
            &TransportTransaction::none(),
        )
        .await;

    assert!(matches!(
        result,
        Err(DispatchError::TimeToBeReceivedInTransaction { .. })
    ));
    assert_eq!(endpoint.service.message_count(&billing), 0);
}

#[tokio::test]
async fn test_ttbr_is_stripped_when_native_ttbr_disabled() {
    let endpoint = endpoint_with(true);
    let billing = endpoint.create_queue("billing");

    endpoint
        .dispatcher()
        .dispatch(
            TransportOperation::new("billing", invoice())
                .with_constraint(DeliveryConstraint::MaxTimeToBeReceived(Duration::from_secs(300)))
                .into(),
            &TransportTransaction::none(),
        )
        .await
        .unwrap();

    let sent = endpoint.service.messages(&billing);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].time_to_be_received, None);
    let headers = extract_headers(&sent[0]).unwrap();
    assert_eq!(
        headers
            .get(TIME_TO_BE_RECEIVED)
            .and_then(|value| parse_time_span(value)),
        Some(Duration::from_secs(300))
    );
}

#[tokio::test]
async fn test_delayed_message_is_redirected_to_timeouts_queue() {
    let endpoint = TestEndpoint::new(TransactionMode::SendsAtomicWithReceive).with_delayed_delivery();
    let billing = endpoint.create_queue("billing");
    let timeouts = endpoint.timeouts_queue();
    let before = chrono::Utc::now();

    endpoint
        .dispatcher()
        .dispatch(
            TransportOperation::new("billing", invoice())
                .with_dead_letter_queue(false)
                .with_constraint(DeliveryConstraint::DelayBy(Duration::from_secs(600)))
                .into(),
            &TransportTransaction::none(),
        )
        .await
        .unwrap();

    assert_eq!(endpoint.service.message_count(&billing), 0);
    let redirected = endpoint.service.messages(&timeouts);
    assert_eq!(redirected.len(), 1);
    assert!(redirected[0].use_dead_letter_queue);

    let headers = extract_headers(&redirected[0]).unwrap();
    assert_eq!(
        headers.get(TIMEOUT_DESTINATION),
        Some(&billing.to_string())
    );
    let due_at = headers
        .get(TIMEOUT_AT)
        .and_then(|value| from_wire_format(value))
        .unwrap();
    assert!(due_at >= before + chrono::Duration::seconds(599));
}

#[tokio::test]
async fn test_missing_destination_is_reported_distinctly() {
    let endpoint = TestEndpoint::new(TransactionMode::ReceiveOnly);

    let result = endpoint
        .dispatcher()
        .dispatch(
            TransportOperation::new("nowhere", invoice()).into(),
            &TransportTransaction::none(),
        )
        .await;

    assert!(matches!(result, Err(DispatchError::QueueNotFound { .. })));
}

#[tokio::test]
async fn test_failing_operation_prevents_whole_batch() {
    let endpoint = TestEndpoint::new(TransactionMode::ReceiveOnly);
    let billing = endpoint.create_queue("billing");

    let result = endpoint
        .dispatcher()
        .dispatch(
            queue_transport::TransportOperations::new(vec![
                TransportOperation::new("billing", invoice()),
                TransportOperation::new("billing", invoice())
                    .with_constraint(DeliveryConstraint::DelayBy(Duration::from_secs(60))),
            ]),
            &TransportTransaction::none(),
        )
        .await;

    assert!(matches!(
        result,
        Err(DispatchError::DelayedDeliveryNotEnabled)
    ));
    assert_eq!(endpoint.service.message_count(&billing), 0);
}
