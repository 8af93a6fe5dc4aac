//! Message bus abstraction: transport traits, topic routing and envelope construction.
//!
//! # Architecture
//!
//! ```text
//!   command handler / saga step
//!            │ Outbound (typed)
//!            ▼
//!   ┌─────────────────┐  route()   ┌─────────────────────────┐
//!   │    BusConfig    │──────────► │ (topic, Message)        │
//!   └─────────────────┘            └───────────┬─────────────┘
//!                                              │ outbox row or direct publish
//!                                              ▼
//!                                   ┌─────────────────────┐
//!                                   │ Publisher/Subscriber│ (transport)
//!                                   └─────────────────────┘
//! ```
//!
//! # Topic Naming Convention
//!
//! - Commands: `commands.<Name>` (`commands.BookFlight`)
//! - External events: the shared `events` topic, split afterwards into `events.<Name>`
//!   (`events.BookingMade_v1`) so the raw stream can be captured to the data lake
//! - Internal events: `internal-events.<service>.<Name>`
//! - Poisoned messages: `PoisonQueue`
//!
//! All names come from an explicit [`BusConfig`] value handed to every component that
//! publishes or subscribes.
//!
//! # Delivery
//!
//! Transports deliver at-least-once with no ordering guarantee across topics. Every handler
//! must be idempotent.

use crate::command::{Command, CommandName};
use crate::event::{Event, EventError, EventName};
use crate::message::{Message, NAME_KEY};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Failed to connect to the transport
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to build the envelope for a message
    #[error(transparent)]
    Envelope(#[from] EventError),

    /// The transport has been closed
    #[error("Transport closed")]
    Closed,
}

/// Stream of messages delivered to one consumer group on one topic.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, BusError>> + Send>>;

/// Publishing half of a transport.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns keep the trait usable as `Arc<dyn Publisher>`.
pub trait Publisher: Send + Sync {
    /// Publish messages to a topic, in order.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the transport did not acknowledge the messages.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        messages: Vec<Message>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>>;
}

/// Subscribing half of a transport.
pub trait Subscriber: Send + Sync {
    /// Subscribe a consumer group to a topic.
    ///
    /// Each consumer group receives its own copy of every message published to the topic
    /// after the subscription was made.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the subscription cannot be created.
    fn subscribe<'a>(
        &'a self,
        consumer_group: &'a str,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + 'a>>;
}

/// A typed message on its way out of a handler or aggregate transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Event to publish
    Event(Event),
    /// Command to send
    Command(Command),
}

impl From<Event> for Outbound {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

impl From<Command> for Outbound {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl Outbound {
    /// Logical name of the wrapped message.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Event(event) => event.name().as_str(),
            Self::Command(command) => command.name().as_str(),
        }
    }
}

/// A message with the topic it must be published to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedMessage {
    /// Destination topic
    pub topic: String,
    /// Encoded message
    pub message: Message,
}

/// Explicit bus configuration: topic naming and envelope construction.
///
/// # Example
///
/// ```
/// use ticketflow_core::bus::BusConfig;
/// use ticketflow_core::event::EventName;
///
/// let config = BusConfig::new("svc-tickets");
/// assert_eq!(config.subscription_topic(EventName::BookingMade), "events.BookingMade_v1");
/// assert_eq!(
///     config.subscription_topic(EventName::OpsReadModelUpdated),
///     "internal-events.svc-tickets.InternalOpsReadModelUpdated"
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusConfig {
    service_name: String,
    events_topic: String,
    poison_topic: String,
}

impl BusConfig {
    /// Configuration with the default shared-events (`events`) and poison (`PoisonQueue`) topics.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            events_topic: "events".to_string(),
            poison_topic: "PoisonQueue".to_string(),
        }
    }

    /// Override the poison topic.
    #[must_use]
    pub fn with_poison_topic(mut self, topic: impl Into<String>) -> Self {
        self.poison_topic = topic.into();
        self
    }

    /// Name of this service.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Shared topic every external event is published to first.
    #[must_use]
    pub fn events_topic(&self) -> &str {
        &self.events_topic
    }

    /// Topic poisoned messages are diverted to.
    #[must_use]
    pub fn poison_topic(&self) -> &str {
        &self.poison_topic
    }

    /// Topic a command is sent to.
    #[must_use]
    pub fn command_topic(&self, name: CommandName) -> String {
        format!("commands.{name}")
    }

    /// Topic an event is published to.
    #[must_use]
    pub fn publish_topic(&self, name: EventName) -> String {
        if name.is_internal() {
            self.internal_event_topic(name)
        } else {
            self.events_topic.clone()
        }
    }

    /// Topic handlers of an event subscribe to.
    #[must_use]
    pub fn subscription_topic(&self, name: EventName) -> String {
        if name.is_internal() {
            self.internal_event_topic(name)
        } else {
            self.split_event_topic(name.as_str())
        }
    }

    /// Per-type topic the events splitter forwards to.
    #[must_use]
    pub fn split_event_topic(&self, name: &str) -> String {
        format!("{}.{name}", self.events_topic)
    }

    fn internal_event_topic(&self, name: EventName) -> String {
        format!("internal-events.{}.{name}", self.service_name)
    }

    /// Consumer group for a handler of this service.
    #[must_use]
    pub fn consumer_group(&self, handler_name: &str) -> String {
        format!("{}.{handler_name}", self.service_name)
    }

    /// Encode an event and resolve its topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload cannot be encoded.
    pub fn route_event(&self, event: &Event) -> Result<RoutedMessage, EventError> {
        let name = event.name();
        Ok(RoutedMessage {
            topic: self.publish_topic(name),
            message: Message::new(event.to_payload()?).with_metadata(NAME_KEY, name.as_str()),
        })
    }

    /// Encode a command and resolve its topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload cannot be encoded.
    pub fn route_command(&self, command: &Command) -> Result<RoutedMessage, EventError> {
        let name = command.name();
        Ok(RoutedMessage {
            topic: self.command_topic(name),
            message: Message::new(command.to_payload()?).with_metadata(NAME_KEY, name.as_str()),
        })
    }

    /// Encode any outbound message and resolve its topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload cannot be encoded.
    pub fn route(&self, outbound: &Outbound) -> Result<RoutedMessage, EventError> {
        match outbound {
            Outbound::Event(event) => self.route_event(event),
            Outbound::Command(command) => self.route_command(command),
        }
    }
}

/// Decode a message into the closed event set.
///
/// # Errors
///
/// Returns [`EventError::MissingName`], [`EventError::UnknownName`] or
/// [`EventError::Deserialization`].
pub fn decode_event(message: &Message) -> Result<Event, EventError> {
    let name = message
        .name()
        .ok_or_else(|| EventError::MissingName(message.id.clone()))?;
    Event::from_payload(EventName::parse(name)?, &message.payload)
}

/// Decode a message into the closed command set.
///
/// # Errors
///
/// Returns [`EventError::MissingName`], [`EventError::UnknownName`] or
/// [`EventError::Deserialization`].
pub fn decode_command(message: &Message) -> Result<Command, EventError> {
    let name = message
        .name()
        .ok_or_else(|| EventError::MissingName(message.id.clone()))?;
    Command::from_payload(CommandName::parse(name)?, &message.payload)
}
