//! Handler traits the router dispatches to.
//!
//! Handlers are registered per message name; the router decodes the raw [`Message`] with a
//! closed match and hands the typed value to the handler. [`ProjectionHandler`] adapts any
//! [`Projection`] into an [`EventHandler`].

use async_trait::async_trait;
use std::sync::Arc;
use ticketflow_core::bus::{decode_command, decode_event};
use ticketflow_core::command::{Command, CommandName};
use ticketflow_core::event::{Event, EventName};
use ticketflow_core::handler::HandlerError;
use ticketflow_core::message::Message;
use ticketflow_core::projection::Projection;

/// Handles raw messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`]; retryable ones are re-run with backoff.
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// Handles one kind of event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one decoded event.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`]; retryable ones are re-run with backoff.
    async fn handle(&self, event: Event) -> Result<(), HandlerError>;
}

/// Handles one kind of command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Process one decoded command.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`]; retryable ones are re-run with backoff.
    async fn handle(&self, command: Command) -> Result<(), HandlerError>;
}

/// Decodes a message as one expected event and forwards it.
pub(crate) struct EventDispatch {
    pub(crate) expected: EventName,
    pub(crate) handler: Arc<dyn EventHandler>,
}

#[async_trait]
impl MessageHandler for EventDispatch {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let event = decode_event(message)?;
        if event.name() != self.expected {
            return Err(HandlerError::Malformed(format!(
                "expected {}, got {}",
                self.expected,
                event.name()
            )));
        }
        self.handler.handle(event).await
    }
}

/// Decodes a message as one expected command and forwards it.
pub(crate) struct CommandDispatch {
    pub(crate) expected: CommandName,
    pub(crate) handler: Arc<dyn CommandHandler>,
}

#[async_trait]
impl MessageHandler for CommandDispatch {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let command = decode_command(message)?;
        if command.name() != self.expected {
            return Err(HandlerError::Malformed(format!(
                "expected {}, got {}",
                self.expected,
                command.name()
            )));
        }
        self.handler.handle(command).await
    }
}

/// Feeds events into a projection.
pub struct ProjectionHandler<P> {
    projection: Arc<P>,
}

impl<P> ProjectionHandler<P> {
    /// Wrap a projection.
    #[must_use]
    pub const fn new(projection: Arc<P>) -> Self {
        Self { projection }
    }
}

#[async_trait]
impl<P> EventHandler for ProjectionHandler<P>
where
    P: Projection + 'static,
{
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        self.projection
            .apply_event(&event)
            .await
            .map_err(HandlerError::from)
    }
}
