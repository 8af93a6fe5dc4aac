//! Built-in handlers on the shared `events` topic.
//!
//! - [`EventsSplitter`] fans each message out to its per-type topic (`events.<Name>`), where
//!   the regular handlers subscribe.
//! - [`DataLakeWriter`] appends each message to the data lake so read models can be rebuilt.

use crate::handler::MessageHandler;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use ticketflow_core::bus::{BusConfig, Publisher};
use ticketflow_core::data_lake::{DataLake, DataLakeEvent};
use ticketflow_core::event::EventHeader;
use ticketflow_core::handler::HandlerError;
use ticketflow_core::message::Message;

fn required_name(message: &Message) -> Result<&str, HandlerError> {
    message
        .name()
        .ok_or_else(|| HandlerError::Malformed(format!("message {} has no name", message.id)))
}

/// Re-publishes shared-topic messages to their per-type topic.
pub struct EventsSplitter {
    publisher: Arc<dyn Publisher>,
    bus: BusConfig,
}

impl EventsSplitter {
    /// Create a splitter publishing through `publisher`.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, bus: BusConfig) -> Self {
        Self { publisher, bus }
    }
}

#[async_trait]
impl MessageHandler for EventsSplitter {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let topic = self.bus.split_event_topic(required_name(message)?);
        self.publisher
            .publish(&topic, vec![message.clone()])
            .await
            .map_err(HandlerError::from)
    }
}

#[derive(Deserialize)]
struct HeaderOnly {
    header: EventHeader,
}

/// Stores shared-topic messages in the data lake.
pub struct DataLakeWriter {
    lake: Arc<dyn DataLake>,
}

impl DataLakeWriter {
    /// Create a writer into `lake`.
    #[must_use]
    pub fn new(lake: Arc<dyn DataLake>) -> Self {
        Self { lake }
    }
}

#[async_trait]
impl MessageHandler for DataLakeWriter {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let name = required_name(message)?;
        let HeaderOnly { header } = serde_json::from_slice(&message.payload)
            .map_err(|e| HandlerError::Malformed(format!("event {name} has no header: {e}")))?;

        let event = DataLakeEvent {
            event_id: header.id,
            published_at: header.published_at,
            event_name: name.to_string(),
            event_payload: message.payload.clone(),
        };

        self.lake.store(&event).await?;

        tracing::debug!(event_id = %event.event_id, event_name = name, "Event stored in data lake");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::in_process::InProcessBus;
    use ticketflow_core::event::{Event, TicketRefunded};

    #[tokio::test]
    async fn splitter_forwards_to_named_topic() {
        let bus = InProcessBus::recording();
        let config = BusConfig::new("svc");
        let splitter = EventsSplitter::new(Arc::new(bus.clone()), config.clone());
        let routed = config
            .route_event(&Event::from(TicketRefunded {
                header: EventHeader::new(),
                ticket_id: "t-1".to_string(),
            }))
            .unwrap();

        splitter.handle(&routed.message).await.unwrap();

        assert_eq!(bus.published("events.TicketRefunded_v1"), vec![routed.message]);
    }

    #[tokio::test]
    async fn splitter_rejects_unnamed_messages() {
        let bus = InProcessBus::recording();
        let splitter = EventsSplitter::new(Arc::new(bus), BusConfig::new("svc"));

        let err = splitter.handle(&Message::new(Vec::new())).await.unwrap_err();

        assert!(matches!(err, HandlerError::Malformed(_)));
    }
}
