//! Transport unit shared by every publisher, subscriber and outbox.
//!
//! A [`Message`] is what actually travels over a topic: an opaque JSON payload plus string
//! metadata. The typed [`Event`](crate::event::Event) and [`Command`](crate::command::Command)
//! enums are encoded into messages by [`BusConfig`](crate::bus::BusConfig) and decoded back by
//! the router.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key holding the logical message name (`BookingMade_v1`, `BookFlight`, ...).
pub const NAME_KEY: &str = "name";

/// Metadata key holding the failure reason of a poisoned message.
pub const REASON_KEY: &str = "reason";

/// Metadata key holding the topic a poisoned message was consumed from.
pub const POISONED_TOPIC_KEY: &str = "poisoned_topic";

/// Metadata key holding the handler that gave up on a poisoned message.
pub const POISONED_HANDLER_KEY: &str = "poisoned_handler";

/// A message as seen by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Transport-level identity (not used for deduplication).
    pub id: String,
    /// String metadata travelling next to the payload.
    pub metadata: BTreeMap<String, String>,
    /// Raw JSON payload.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message with a fresh random ID and empty metadata.
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: BTreeMap::new(),
            payload,
        }
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Read a metadata entry.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// The logical message name, if the producer set one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.metadata(NAME_KEY)
    }
}
