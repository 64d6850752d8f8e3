//! Runs the endpoint's main pump together with the delayed delivery pump.

use crate::delayed_delivery::DelayedDeliveryPump;
use crate::error::ConfigurationError;
use crate::pump::{MessagePump, PushSettings};
use crate::receive::ProcessingCallbacks;

/// One or more pumps managed as a unit.
pub struct CompositePump {
    main: MessagePump,
    delayed: Option<DelayedDeliveryPump>,
}

impl CompositePump {
    pub fn new(main: MessagePump) -> Self {
        Self {
            main,
            delayed: None,
        }
    }

    pub fn with_delayed_delivery(mut self, delayed: DelayedDeliveryPump) -> Self {
        self.delayed = Some(delayed);
        self
    }

    pub fn main(&self) -> &MessagePump {
        &self.main
    }

    pub fn delayed_delivery(&self) -> Option<&DelayedDeliveryPump> {
        self.delayed.as_ref()
    }

    pub async fn init(
        &mut self,
        callbacks: ProcessingCallbacks,
        push: PushSettings,
    ) -> Result<(), ConfigurationError> {
        let critical_error = callbacks.critical_error.clone();
        self.main.init(callbacks, push.clone()).await?;
        if let Some(delayed) = &mut self.delayed {
            delayed.init(critical_error, &push).await?;
        }
        Ok(())
    }

    /// Start every pump, or none of them if any can not start.
    pub fn start(&mut self, max_concurrency: usize) -> Result<(), ConfigurationError> {
        self.main.ensure_startable(max_concurrency)?;
        if let Some(delayed) = &self.delayed {
            delayed.ensure_startable()?;
        }

        self.main.start(max_concurrency)?;
        if let Some(delayed) = &mut self.delayed {
            delayed.start()?;
        }
        Ok(())
    }

    /// Stop all pumps concurrently.
    pub async fn stop(&mut self) {
        match &mut self.delayed {
            Some(delayed) => {
                tokio::join!(self.main.stop(), delayed.stop());
            }
            None => self.main.stop().await,
        }
    }
}

#[cfg(test)]
#[path = "composite_tests.rs"]
mod tests;
