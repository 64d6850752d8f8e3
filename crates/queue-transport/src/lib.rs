//! # Queue Transport
//!
//! Transactional message-queue transport. Moves messages between named queues
//! on a native queuing service with optional transactional semantics.
//!
//! ## Architecture
//!
//! - [`MessagePump`] peeks the input queue and runs receive workers under a
//!   concurrency limit, guarded by circuit breakers.
//! - [`ReceiveStrategy`] wraps each receive in the transaction required by the
//!   configured [`TransactionMode`], hands the message to the host and applies
//!   the error policy.
//! - [`MessageDispatcher`] sends outgoing operations, enlisting in the receive
//!   transaction where allowed.
//! - [`delayed_delivery`] holds delayed messages in a timeouts queue and a
//!   store until they are due.
//! - Headers travel XML-encoded in the native extension field, see [`headers`].
//!
//! The queuing service itself sits behind the [`QueueService`] trait;
//! [`providers::InMemoryQueueService`] implements it in process.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use queue_transport::{QueueTransport, TransportSettings, PushSettings, TransactionMode};
//!
//! let transport = QueueTransport::new(service, TransportSettings::load(None)?, "orders")?;
//! let mut pump = transport.message_pump();
//! pump.init(callbacks, PushSettings::new("orders", "error", TransactionMode::ReceiveOnly)).await?;
//! pump.start(4)?;
//! ```

pub mod address;
pub mod circuit_breaker;
pub mod composite;
pub mod config;
pub mod delayed_delivery;
pub mod dispatcher;
pub mod error;
pub mod failure_info;
pub mod headers;
pub mod message;
pub mod processing;
pub mod providers;
pub mod pump;
pub mod queue;
pub mod receive;
pub mod transaction;
pub mod transport;

pub use address::QueueAddress;
pub use composite::CompositePump;
pub use config::{DelayedDeliveryConfig, TransactionMode, TransportSettings};
pub use dispatcher::MessageDispatcher;
pub use error::{
    AddressError, ConfigurationError, DispatchError, HeaderError, QueueError, TransportError,
};
pub use message::{
    DeliveryConstraint, Headers, NativeMessageId, OutgoingMessage, TransportOperation,
    TransportOperations, WireMessage,
};
pub use processing::{
    CriticalError, ErrorContext, ErrorHandleResult, ErrorHandler, MessageContext, MessageHandler,
    ProcessingOutcome,
};
pub use pump::{MessagePump, PushSettings};
pub use queue::QueueService;
pub use receive::{ProcessingCallbacks, ReceiveStrategy};
pub use transaction::{Transaction, TransportTransaction};
pub use transport::QueueTransport;
