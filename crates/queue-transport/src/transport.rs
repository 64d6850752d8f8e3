//! Entry point tying the dispatcher and pumps of one endpoint together.

use crate::address::QueueAddress;
use crate::composite::CompositePump;
use crate::config::TransportSettings;
use crate::delayed_delivery::{DelayedDeliveryPump, DelayedMessageStore};
use crate::dispatcher::{LabelGenerator, MessageDispatcher};
use crate::error::ConfigurationError;
use crate::pump::MessagePump;
use crate::queue::QueueService;
use std::sync::Arc;

/// Transport of a single endpoint receiving from `input_queue`.
///
/// # Example
///
/// ```rust
/// use bytes::Bytes;
/// use queue_transport::delayed_delivery::InMemoryDelayedMessageStore;
/// use queue_transport::providers::InMemoryQueueService;
/// use queue_transport::{
///     Headers, OutgoingMessage, QueueTransport, TransportOperation, TransportSettings,
///     TransportTransaction,
/// };
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let service = Arc::new(InMemoryQueueService::new("HOST"));
/// let orders = service.create_local_queue("orders", true);
/// let transport = QueueTransport::new(service.clone(), TransportSettings::default(), "orders")
///     .unwrap()
///     .with_delayed_delivery(Arc::new(InMemoryDelayedMessageStore::new()));
///
/// assert_eq!(transport.timeouts_queue(), Some(&orders.with_suffix(".timeouts")));
///
/// let operation = TransportOperation::new(
///     "orders",
///     OutgoingMessage::new("order-1", Headers::new(), Bytes::from_static(b"order")),
/// );
/// transport
///     .dispatcher()
///     .dispatch(operation.into(), &TransportTransaction::none())
///     .await
///     .unwrap();
/// assert_eq!(service.message_count(&orders), 1);
/// # });
/// ```
pub struct QueueTransport {
    service: Arc<dyn QueueService>,
    settings: TransportSettings,
    input_queue: QueueAddress,
    store: Option<Arc<dyn DelayedMessageStore>>,
    dispatcher: MessageDispatcher,
}

impl QueueTransport {
    pub fn new(
        service: Arc<dyn QueueService>,
        settings: TransportSettings,
        input_queue: &str,
    ) -> Result<Self, ConfigurationError> {
        settings.validate()?;
        let input_queue = QueueAddress::parse(input_queue, service.local_machine())?;
        let dispatcher = MessageDispatcher::new(service.clone(), settings.clone());
        Ok(Self {
            service,
            settings,
            input_queue,
            store: None,
            dispatcher,
        })
    }

    /// Enable delayed delivery backed by `store`. Uses the default delayed
    /// delivery configuration unless the settings carry one.
    pub fn with_delayed_delivery(mut self, store: Arc<dyn DelayedMessageStore>) -> Self {
        let config = self.settings.delayed_delivery.get_or_insert_with(Default::default);
        let timeouts_queue = self.input_queue.with_suffix(&config.timeouts_queue_suffix);
        self.dispatcher = self.dispatcher.clone().with_timeouts_queue(timeouts_queue);
        self.store = Some(store);
        self
    }

    pub fn with_label_generator(mut self, generator: LabelGenerator) -> Self {
        self.dispatcher = self.dispatcher.with_label_generator(generator);
        self
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn input_queue(&self) -> &QueueAddress {
        &self.input_queue
    }

    /// Queue delayed messages wait in, when delayed delivery is enabled.
    pub fn timeouts_queue(&self) -> Option<&QueueAddress> {
        self.dispatcher.timeouts_queue()
    }

    pub fn dispatcher(&self) -> MessageDispatcher {
        self.dispatcher.clone()
    }

    /// Pump for the input queue, plus the timeouts queue pump when delayed
    /// delivery is enabled.
    pub fn message_pump(&self) -> CompositePump {
        let main = MessagePump::new(self.service.clone(), self.settings.clone());
        let pump = CompositePump::new(main);

        match (&self.store, self.dispatcher.timeouts_queue()) {
            (Some(store), Some(timeouts_queue)) => pump.with_delayed_delivery(DelayedDeliveryPump::new(
                self.service.clone(),
                self.settings.clone(),
                self.dispatcher.clone(),
                store.clone(),
                timeouts_queue.clone(),
            )),
            _ => pump,
        }
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
