//! Projection system for building read models from the event stream.
//!
//! # Overview
//!
//! Projections are the query side: they fold events into denormalized documents that are
//! cheap to read. They consume the same at-least-once, unordered stream as the saga, so every
//! projection must:
//!
//! - merge instead of overwrite, so re-delivered or partial information is absorbed
//! - report a missing parent document as [`ProjectionError::NotYetAvailable`] instead of
//!   inventing it; the router retries the event until the causally earlier one has landed
//!
//! ```text
//!   events.<Name> ──► Projection::apply_event ──► read model store
//!                         │
//!                         └─ NotYetAvailable ──► retry with backoff
//! ```
//!
//! ## Example
//!
//! ```ignore
//! impl Projection for OpsBookingsProjection {
//!     fn name(&self) -> &str {
//!         "ops_bookings"
//!     }
//!
//!     fn handled_events(&self) -> &'static [EventName] {
//!         &[EventName::BookingMade, EventName::TicketBookingConfirmed]
//!     }
//!
//!     async fn apply_event(&self, event: &Event) -> Result<()> {
//!         match event {
//!             Event::BookingMade(e) => self.store.create(OpsBooking::from(e)).await,
//!             _ => Ok(()),
//!         }
//!     }
//! }
//! ```

use crate::event::{Event, EventName};
use std::future::Future;
use thiserror::Error;

/// Errors that can occur during projection operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    /// Storage backend error (database connection, query failure, etc.)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The document an event refers to does not exist yet
    #[error("Read model not available yet: {0}")]
    NotYetAvailable(String),

    /// Event processing error
    #[error("Event processing error: {0}")]
    EventProcessing(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// A read model fed by events.
pub trait Projection: Send + Sync {
    /// Unique name, also used as the handler name prefix.
    fn name(&self) -> &str;

    /// Events this projection subscribes to.
    fn handled_events(&self) -> &'static [EventName];

    /// Fold one event into the read model.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotYetAvailable`] when the event arrived before the event
    /// that creates its parent document, or a storage error.
    fn apply_event(&self, event: &Event) -> impl Future<Output = Result<()>> + Send;

    /// Drop all projected data ahead of a rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the data cannot be cleared.
    fn reset(&self) -> impl Future<Output = Result<()>> + Send;
}
