//! Typed publishing front-ends.
//!
//! [`EventBus`] and [`CommandBus`] encode typed messages through a [`BusConfig`] and hand
//! them straight to a [`Publisher`]. Anything that must be atomic with a state change goes
//! through the outbox instead.

use std::sync::Arc;
use ticketflow_core::bus::{BusConfig, BusError, Publisher};
use ticketflow_core::command::Command;
use ticketflow_core::event::Event;

/// Publishes events to their routed topic.
#[derive(Clone)]
pub struct EventBus {
    publisher: Arc<dyn Publisher>,
    config: BusConfig,
}

impl EventBus {
    /// Create an event bus over a transport.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, config: BusConfig) -> Self {
        Self { publisher, config }
    }

    /// Publish one event.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Envelope`] if the event cannot be encoded, or the transport error.
    pub async fn publish(&self, event: impl Into<Event>) -> Result<(), BusError> {
        let event = event.into();
        let routed = self.config.route_event(&event)?;

        tracing::debug!(
            event_name = event.name().as_str(),
            topic = %routed.topic,
            message_id = %routed.message.id,
            "Publishing event"
        );

        self.publisher.publish(&routed.topic, vec![routed.message]).await
    }
}

/// Sends commands to their routed topic.
#[derive(Clone)]
pub struct CommandBus {
    publisher: Arc<dyn Publisher>,
    config: BusConfig,
}

impl CommandBus {
    /// Create a command bus over a transport.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, config: BusConfig) -> Self {
        Self { publisher, config }
    }

    /// Send one command.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Envelope`] if the command cannot be encoded, or the transport error.
    pub async fn send(&self, command: impl Into<Command>) -> Result<(), BusError> {
        let command = command.into();
        let routed = self.config.route_command(&command)?;

        tracing::debug!(
            command_name = command.name().as_str(),
            topic = %routed.topic,
            "Sending command"
        );

        self.publisher.publish(&routed.topic, vec![routed.message]).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::in_process::InProcessBus;
    use ticketflow_core::command::RefundTicket;
    use ticketflow_core::event::{EventHeader, VipBundleFinalized};

    #[tokio::test]
    async fn events_and_commands_land_on_routed_topics() {
        let transport = InProcessBus::recording();
        let config = BusConfig::new("svc-tickets");
        let events = EventBus::new(Arc::new(transport.clone()), config.clone());
        let commands = CommandBus::new(Arc::new(transport.clone()), config);

        events
            .publish(VipBundleFinalized {
                header: EventHeader::new(),
                vip_bundle_id: "bundle-1".to_string(),
            })
            .await
            .unwrap();
        commands
            .send(RefundTicket {
                header: EventHeader::new(),
                ticket_id: "t-1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(transport.published("events").len(), 1);
        assert_eq!(transport.published("commands.RefundTicket").len(), 1);
    }
}
