//! Append-only capture of every external event.
//!
//! The data lake keeps the raw payload of everything published to the shared `events` topic.
//! It is the source for rebuilding read models from scratch.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned by data lake implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataLakeError {
    /// Storage failure
    #[error("Database error: {0}")]
    Database(String),
}

/// One captured event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataLakeEvent {
    /// Event ID from the event header (primary key)
    pub event_id: String,
    /// Header timestamp, used for replay order
    pub published_at: DateTime<Utc>,
    /// Versioned event name
    pub event_name: String,
    /// Raw JSON payload
    pub event_payload: Vec<u8>,
}

/// Append-only event log.
pub trait DataLake: Send + Sync {
    /// Store an event. Storing an ID twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DataLakeError::Database`] on storage failure.
    fn store<'a>(
        &'a self,
        event: &'a DataLakeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), DataLakeError>> + Send + 'a>>;

    /// All stored events ordered by `published_at`.
    ///
    /// # Errors
    ///
    /// Returns [`DataLakeError::Database`] on storage failure.
    fn events(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DataLakeEvent>, DataLakeError>> + Send + '_>>;
}
