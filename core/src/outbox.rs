//! Transactional outbox contract.
//!
//! Writers append routed messages to a local table as part of the transaction that changes
//! their state. A relay then tails that table through [`OutboxSource`], publishes each record
//! and persists its cursor only after the transport acknowledged the publish. A crash in
//! between replays already-published records: delivery is at-least-once, never lossy.

use crate::event::EventError;
use crate::message::Message;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while reading the outbox or its cursor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// Storage failure
    #[error("Database error: {0}")]
    Database(String),

    /// An outbound message could not be encoded
    #[error(transparent)]
    Envelope(#[from] EventError),

    /// A stored record could not be decoded
    #[error("Corrupt outbox record at offset {offset}: {reason}")]
    Corrupt {
        /// Offset of the broken record
        offset: i64,
        /// Decoder error
        reason: String,
    },
}

/// Position of a record in the outbox.
///
/// Records are ordered by the writing transaction first and the offset second, so a record
/// whose transaction committed late is never skipped by a relay that already moved past a
/// higher offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutboxPosition {
    /// ID of the transaction that wrote the record
    pub transaction_id: i64,
    /// Sequence number of the record
    pub offset: i64,
}

/// One appended message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Position in the outbox
    pub position: OutboxPosition,
    /// Destination topic
    pub topic: String,
    /// Message to publish
    pub message: Message,
    /// When the record was appended
    pub created_at: DateTime<Utc>,
}

/// Read side of an outbox, as consumed by a relay.
pub trait OutboxSource: Send + Sync {
    /// Fetch committed records strictly after `after`, in position order.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] or [`OutboxError::Corrupt`].
    fn fetch_after<'a>(
        &'a self,
        after: OutboxPosition,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + 'a>>;

    /// Load the last acknowledged position of a relay.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on storage failure.
    fn load_cursor<'a>(
        &'a self,
        relay_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxPosition>, OutboxError>> + Send + 'a>>;

    /// Persist the last acknowledged position of a relay.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on storage failure.
    fn save_cursor<'a>(
        &'a self,
        relay_name: &'a str,
        position: OutboxPosition,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>>;
}
