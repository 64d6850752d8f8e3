//! Tests for the queue-transport-host library module.

use super::*;
use queue_transport::headers::extract_headers;
use queue_transport::{NativeMessageId, QueueService};
use std::io::Write;
use std::time::Duration;

const MACHINE: &str = "TESTHOST";

fn fast_settings() -> TransportSettings {
    TransportSettings {
        peek_timeout_ms: 50,
        ..Default::default()
    }
}

// ============================================================================
// CLI Tests
// ============================================================================

#[test]
fn test_cli_parsing_defaults() {
    let cli = Cli::try_parse_from(["queue-transport-host", "run"]).unwrap();

    assert_eq!(cli.log_level, "info");
    assert!(!cli.json_logs);
    match cli.command {
        Commands::Run {
            input_queue,
            error_queue,
            concurrency,
            seed_messages,
            immediate_retries,
        } => {
            assert_eq!(input_queue, "orders");
            assert_eq!(error_queue, "error");
            assert_eq!(concurrency, 4);
            assert_eq!(seed_messages, 0);
            assert_eq!(immediate_retries, 3);
        }
        other => panic!("Expected Run command, got {:?}", other),
    }
}

#[test]
fn test_cli_parsing_run_options() {
    let cli = Cli::try_parse_from([
        "queue-transport-host",
        "--json-logs",
        "--config",
        "transport.yaml",
        "run",
        "--input-queue",
        "billing",
        "--seed-messages",
        "10",
    ])
    .unwrap();

    assert!(cli.json_logs);
    assert_eq!(cli.config, Some(PathBuf::from("transport.yaml")));
    match cli.command {
        Commands::Run {
            input_queue,
            seed_messages,
            ..
        } => {
            assert_eq!(input_queue, "billing");
            assert_eq!(seed_messages, 10);
        }
        other => panic!("Expected Run command, got {:?}", other),
    }
}

#[test]
fn test_cli_rejects_unknown_config_format() {
    assert!(Cli::try_parse_from(["queue-transport-host", "config", "--format", "toml"]).is_err());
}

#[test]
fn test_exit_codes_are_distinct() {
    let codes = [
        HostError::Configuration(ConfigurationError::NotInitialized).exit_code(),
        HostError::Dispatch(DispatchError::UnicastOnly).exit_code(),
        HostError::Logging {
            message: String::new(),
        }
        .exit_code(),
        HostError::Render {
            message: String::new(),
        }
        .exit_code(),
    ];

    for (i, code) in codes.iter().enumerate() {
        assert!(!codes[i + 1..].contains(code));
    }
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn test_render_settings() {
    let settings = TransportSettings::default();

    let yaml = render_settings(&settings, ConfigFormat::Yaml).unwrap();
    let json = render_settings(&settings, ConfigFormat::Json).unwrap();

    assert!(yaml.contains("peek_timeout_ms: 1000"));
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["peek_timeout_ms"], 1000);
    assert_eq!(parsed["use_transactional_queues"], true);
}

#[test]
fn test_settings_file_is_layered_over_defaults() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "peek_timeout_ms: 250").unwrap();
    writeln!(file, "shutdown_timeout_seconds: 5").unwrap();

    let settings = TransportSettings::load(Some(file.path())).unwrap();

    assert_eq!(settings.peek_timeout_ms, 250);
    assert_eq!(settings.shutdown_timeout_seconds, 5);
    assert_eq!(settings.receive_timeout_ms, 10);
}

// ============================================================================
// Callback Tests
// ============================================================================

#[tokio::test]
async fn test_logging_handler_counts_messages() {
    let handler = LoggingHandler::default();
    let context = MessageContext {
        native_message_id: NativeMessageId::from("a\\1"),
        headers: Headers::new(),
        body: Bytes::from_static(b"body"),
        transport_transaction: TransportTransaction::none(),
    };

    let outcome = handler.on_message(context).await.unwrap();

    assert_eq!(outcome, ProcessingOutcome::Complete);
    assert_eq!(handler.processed(), 1);
}

fn error_context(attempts: u32) -> ErrorContext {
    let mut headers = Headers::new();
    headers.insert(MESSAGE_ID.to_string(), "order-7".to_string());
    ErrorContext {
        error: Arc::new(anyhow::anyhow!("payment declined")),
        native_message_id: NativeMessageId::from("a\\7"),
        headers,
        body: Bytes::from_static(b"order"),
        transport_transaction: TransportTransaction::none(),
        immediate_processing_failures: attempts,
    }
}

#[tokio::test]
async fn test_error_handler_retries_then_moves_to_error_queue() {
    let service = InMemoryQueueService::new(MACHINE);
    let input = service.create_local_queue("orders", true);
    let error_queue = service.create_local_queue("error", true);
    let dispatcher = MessageDispatcher::new(Arc::new(service.clone()), TransportSettings::default());
    let handler = MoveToErrorQueue::new(dispatcher, "error", input.clone(), 2);

    assert_eq!(
        handler.on_error(error_context(2)).await.unwrap(),
        ErrorHandleResult::RetryRequired
    );
    assert_eq!(service.message_count(&error_queue), 0);

    assert_eq!(
        handler.on_error(error_context(3)).await.unwrap(),
        ErrorHandleResult::Handled
    );
    let moved = service.messages(&error_queue);
    assert_eq!(moved.len(), 1);
    let headers = extract_headers(&moved[0]).unwrap();
    assert_eq!(
        headers.get(EXCEPTION_MESSAGE).map(String::as_str),
        Some("payment declined")
    );
    assert_eq!(
        headers.get(FAILED_QUEUE).map(String::as_str),
        Some(input.to_string().as_str())
    );
    assert_eq!(headers.get(MESSAGE_ID).map(String::as_str), Some("order-7"));
}

#[test]
fn test_critical_error_requests_shutdown() {
    let shutdown = CancellationToken::new();
    let sink = ShutdownOnCriticalError::new(shutdown.clone());

    sink.raise("Failed to peek orders", &anyhow::anyhow!("offline"));

    assert!(shutdown.is_cancelled());
}

// ============================================================================
// Endpoint Tests
// ============================================================================

#[tokio::test]
async fn test_endpoint_processes_seeded_messages_until_shutdown() {
    let service = Arc::new(InMemoryQueueService::new(MACHINE));
    let handler = Arc::new(LoggingHandler::default());
    let shutdown = CancellationToken::new();
    let options = EndpointOptions {
        seed_messages: 5,
        concurrency: 2,
        ..Default::default()
    };

    let endpoint = tokio::spawn(run_endpoint(
        service.clone(),
        fast_settings(),
        options,
        handler.clone(),
        shutdown.clone(),
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        while handler.processed() < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    endpoint.await.unwrap().unwrap();
    assert_eq!(
        service.message_count(&QueueAddress::new("orders", MACHINE)),
        0
    );
}

#[tokio::test]
async fn test_endpoint_creates_timeouts_queue_when_delayed_delivery_enabled() {
    let service = Arc::new(InMemoryQueueService::new(MACHINE));
    let shutdown = CancellationToken::new();
    let settings = TransportSettings {
        delayed_delivery: Some(Default::default()),
        ..fast_settings()
    };

    let endpoint = tokio::spawn(run_endpoint(
        service.clone(),
        settings,
        EndpointOptions::default(),
        Arc::new(LoggingHandler::default()),
        shutdown.clone(),
    ));

    let timeouts = QueueAddress::new("orders.timeouts", MACHINE);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !service.queue_exists(&timeouts).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    endpoint.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_endpoint_rejects_invalid_settings() {
    let service = Arc::new(InMemoryQueueService::new(MACHINE));
    let settings = TransportSettings {
        peek_timeout_ms: 0,
        ..Default::default()
    };

    let result = run_endpoint(
        service,
        settings,
        EndpointOptions::default(),
        Arc::new(LoggingHandler::default()),
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(HostError::Configuration(_))));
}
