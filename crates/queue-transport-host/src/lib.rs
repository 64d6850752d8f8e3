//! # Queue Transport Host
//!
//! Runs a single endpoint on top of the queue transport.
//!
//! The host:
//! - Loads layered configuration (file plus `QUEUE_TRANSPORT__*` environment)
//! - Initializes structured logging
//! - Wires an in-memory queue service, the transport and its composite pump
//! - Processes messages with a logging handler until Ctrl-C or a critical error

use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use queue_transport::address::local_machine_name;
use queue_transport::delayed_delivery::InMemoryDelayedMessageStore;
use queue_transport::headers::{EXCEPTION_MESSAGE, FAILED_QUEUE, MESSAGE_ID};
use queue_transport::providers::InMemoryQueueService;
use queue_transport::{
    ConfigurationError, CriticalError, DispatchError, ErrorContext, ErrorHandleResult,
    ErrorHandler, Headers, MessageContext, MessageDispatcher, MessageHandler, OutgoingMessage,
    ProcessingCallbacks, ProcessingOutcome, PushSettings, QueueAddress, QueueTransport,
    TransportOperation, TransportSettings, TransportTransaction,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue transport host - runs one message endpoint
#[derive(Parser, Debug)]
#[command(name = "queue-transport-host")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hosts a transactional message-queue endpoint")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_TRANSPORT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Receive and process messages until interrupted
    Run {
        /// Queue the endpoint receives from
        #[arg(short, long, default_value = "orders")]
        input_queue: String,

        /// Queue failed messages are moved to
        #[arg(short, long, default_value = "error")]
        error_queue: String,

        /// Maximum number of messages processed concurrently
        #[arg(long, default_value = "4")]
        concurrency: usize,

        /// Number of sample messages sent to the input queue on startup
        #[arg(long, default_value = "0")]
        seed_messages: usize,

        /// Processing attempts retried before a message moves to the error queue
        #[arg(long, default_value = "3")]
        immediate_retries: u32,
    },

    /// Print the resolved configuration
    Config {
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Failed to send seed messages: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },

    #[error("Failed to render configuration: {message}")]
    Render { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Dispatch(_) => 2,
            Self::Logging { .. } => 3,
            Self::Render { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

// ============================================================================
// Endpoint Callbacks
// ============================================================================

/// Logs and completes every message.
#[derive(Debug, Default)]
pub struct LoggingHandler {
    processed: AtomicUsize,
}

impl LoggingHandler {
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<ProcessingOutcome> {
        info!(
            native_message_id = %context.native_message_id,
            message_id = context.headers.get(MESSAGE_ID).map(String::as_str).unwrap_or_default(),
            header_count = context.headers.len(),
            body_len = context.body.len(),
            "Processed message"
        );
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessingOutcome::Complete)
    }
}

/// Retries a failing message a fixed number of times, then moves it to the
/// error queue.
pub struct MoveToErrorQueue {
    dispatcher: MessageDispatcher,
    error_queue: String,
    input_queue: QueueAddress,
    immediate_retries: u32,
}

impl MoveToErrorQueue {
    pub fn new(
        dispatcher: MessageDispatcher,
        error_queue: impl Into<String>,
        input_queue: QueueAddress,
        immediate_retries: u32,
    ) -> Self {
        Self {
            dispatcher,
            error_queue: error_queue.into(),
            input_queue,
            immediate_retries,
        }
    }
}

#[async_trait]
impl ErrorHandler for MoveToErrorQueue {
    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult> {
        if context.immediate_processing_failures <= self.immediate_retries {
            warn!(
                native_message_id = %context.native_message_id,
                attempt = context.immediate_processing_failures,
                error = %context.error,
                "Message processing failed, retrying"
            );
            return Ok(ErrorHandleResult::RetryRequired);
        }

        let mut headers = context.headers;
        headers.insert(EXCEPTION_MESSAGE.to_string(), context.error.to_string());
        headers.insert(FAILED_QUEUE.to_string(), self.input_queue.to_string());
        let message_id = headers
            .get(MESSAGE_ID)
            .cloned()
            .unwrap_or_else(|| context.native_message_id.to_string());

        self.dispatcher
            .dispatch(
                TransportOperation::new(
                    self.error_queue.clone(),
                    OutgoingMessage::new(message_id, headers, context.body),
                )
                .into(),
                &context.transport_transaction,
            )
            .await?;

        error!(
            native_message_id = %context.native_message_id,
            error_queue = %self.error_queue,
            error = %context.error,
            "Moved message to the error queue"
        );
        Ok(ErrorHandleResult::Handled)
    }
}

/// Stops the endpoint when the transport raises a critical error.
pub struct ShutdownOnCriticalError {
    shutdown: CancellationToken,
}

impl ShutdownOnCriticalError {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }
}

impl CriticalError for ShutdownOnCriticalError {
    fn raise(&self, description: &str, error: &anyhow::Error) {
        error!(description, error = %error, "Critical error, stopping endpoint");
        self.shutdown.cancel();
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Queues and limits of the hosted endpoint.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub input_queue: String,
    pub error_queue: String,
    pub concurrency: usize,
    pub seed_messages: usize,
    pub immediate_retries: u32,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            input_queue: "orders".to_string(),
            error_queue: "error".to_string(),
            concurrency: 4,
            seed_messages: 0,
            immediate_retries: 3,
        }
    }
}

/// Run the endpoint until `shutdown` is cancelled.
pub async fn run_endpoint(
    service: Arc<InMemoryQueueService>,
    settings: TransportSettings,
    options: EndpointOptions,
    handler: Arc<LoggingHandler>,
    shutdown: CancellationToken,
) -> Result<(), HostError> {
    let transactional = settings.use_transactional_queues;
    let input_queue = service.create_local_queue(&options.input_queue, transactional);
    service.create_local_queue(&options.error_queue, transactional);

    let mut transport = QueueTransport::new(service.clone(), settings.clone(), &options.input_queue)?;
    if settings.delayed_delivery_enabled() {
        transport = transport.with_delayed_delivery(Arc::new(InMemoryDelayedMessageStore::new()));
        if let Some(timeouts_queue) = transport.timeouts_queue() {
            service.create_queue(timeouts_queue, transactional);
        }
    }
    let dispatcher = transport.dispatcher();

    let callbacks = ProcessingCallbacks {
        on_message: handler,
        on_error: Arc::new(MoveToErrorQueue::new(
            dispatcher.clone(),
            options.error_queue.clone(),
            input_queue.clone(),
            options.immediate_retries,
        )),
        critical_error: Arc::new(ShutdownOnCriticalError::new(shutdown.clone())),
    };

    let mut pump = transport.message_pump();
    pump.init(
        callbacks,
        PushSettings::new(
            options.input_queue.clone(),
            options.error_queue.clone(),
            settings.transaction_mode,
        ),
    )
    .await?;

    seed_messages(&dispatcher, &options.input_queue, options.seed_messages).await?;

    pump.start(options.concurrency)?;
    info!(
        input_queue = %input_queue,
        error_queue = %options.error_queue,
        transaction_mode = %settings.transaction_mode,
        concurrency = options.concurrency,
        "Endpoint started"
    );

    shutdown.cancelled().await;

    info!("Stopping endpoint");
    pump.stop().await;
    info!("Endpoint stopped");
    Ok(())
}

async fn seed_messages(
    dispatcher: &MessageDispatcher,
    queue: &str,
    count: usize,
) -> Result<(), DispatchError> {
    for i in 0..count {
        let message_id = uuid::Uuid::new_v4().to_string();
        let mut headers = Headers::new();
        headers.insert(MESSAGE_ID.to_string(), message_id.clone());
        let body = Bytes::from(format!("sample message {}", i + 1));

        dispatcher
            .dispatch(
                TransportOperation::new(queue, OutgoingMessage::new(message_id, headers, body)).into(),
                &TransportTransaction::none(),
            )
            .await?;
    }

    if count > 0 {
        info!(queue, count, "Seeded input queue");
    }
    Ok(())
}

// ============================================================================
// Command Execution
// ============================================================================

/// Parse arguments, initialize logging and execute the selected command.
pub async fn run_cli(cli: Cli) -> Result<(), HostError> {
    initialize_logging(&cli)?;
    let settings = TransportSettings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            input_queue,
            error_queue,
            concurrency,
            seed_messages,
            immediate_retries,
        } => {
            let options = EndpointOptions {
                input_queue,
                error_queue,
                concurrency,
                seed_messages,
                immediate_retries,
            };
            execute_run_command(settings, options).await
        }
        Commands::Config { format } => {
            println!("{}", render_settings(&settings, format)?);
            Ok(())
        }
    }
}

async fn execute_run_command(
    settings: TransportSettings,
    options: EndpointOptions,
) -> Result<(), HostError> {
    let service = Arc::new(InMemoryQueueService::new(local_machine_name()));
    let shutdown = CancellationToken::new();

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => error!(error = %e, "Unable to listen for Ctrl-C"),
        }
        ctrl_c.cancel();
    });

    run_endpoint(
        service,
        settings,
        options,
        Arc::new(LoggingHandler::default()),
        shutdown,
    )
    .await
}

/// Serialize resolved settings for display.
pub fn render_settings(
    settings: &TransportSettings,
    format: ConfigFormat,
) -> Result<String, HostError> {
    let rendered = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(settings).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::to_string_pretty(settings).map_err(|e| e.to_string()),
    };
    rendered.map_err(|message| HostError::Render { message })
}

fn initialize_logging(cli: &Cli) -> Result<(), HostError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!(
            "queue_transport={level},queue_transport_host={level}",
            level = cli.log_level
        ))
        .map_err(|e| HostError::Logging {
            message: e.to_string(),
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer().compact()).try_init()
    };

    result.map_err(|e| HostError::Logging {
        message: e.to_string(),
    })
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
