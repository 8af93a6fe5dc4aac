//! Aggregate store contract.
//!
//! Aggregates are JSON documents addressed by their ID and by the booking they belong to.
//! The only way to change one is a read-modify-write through [`AggregateRepository`], which
//! runs the caller's closure inside a serializable transaction and writes the outbound
//! messages it returns to the outbox in that same transaction.

use crate::bus::Outbound;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use thiserror::Error;

/// Errors returned by aggregate stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// No aggregate is stored under the key
    #[error("Aggregate not found: {key}")]
    NotFound {
        /// The ID or booking ID that was looked up
        key: String,
    },

    /// Another aggregate already holds the booking ID
    #[error("Booking ID already taken: {booking_id}")]
    DuplicateBookingId {
        /// The contested booking ID
        booking_id: String,
    },

    /// Concurrent transactions kept conflicting
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    /// Storage failure
    #[error("Database error: {0}")]
    Database(String),

    /// Stored document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    /// Whether this is the not-found condition.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A document stored by an [`AggregateRepository`].
pub trait Aggregate: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Primary key.
    fn aggregate_id(&self) -> &str;

    /// Secondary, unique lookup key.
    fn booking_id(&self) -> &str;

    /// Messages emitted atomically with the first insert of this aggregate.
    fn created(&self) -> Vec<Outbound>;
}

/// Repository of aggregates with atomic read-modify-write.
///
/// Update closures receive the current document, mutate it in place and return the outbound
/// messages of the step. If the closure fails, nothing is written.
pub trait AggregateRepository<A: Aggregate>: Send + Sync {
    /// Insert a new aggregate and its creation messages.
    ///
    /// Inserting an ID that already exists is a no-op, so a retried create is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::DuplicateBookingId`] if another aggregate holds the booking
    /// ID, [`RepositoryError::Database`] or [`RepositoryError::Serialization`].
    fn add(&self, aggregate: A) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Load an aggregate by ID.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] if no aggregate has this ID.
    fn get(&self, id: &str) -> impl Future<Output = Result<A, RepositoryError>> + Send;

    /// Load an aggregate by booking ID.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] if no aggregate has this booking ID.
    fn get_by_booking_id(
        &self,
        booking_id: &str,
    ) -> impl Future<Output = Result<A, RepositoryError>> + Send;

    /// Read-modify-write by ID.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a [`RepositoryError`] converted into `E`
    /// (`NotFound` when the ID is unknown).
    fn update_by_id<F, E>(&self, id: &str, update: F) -> impl Future<Output = Result<A, E>> + Send
    where
        F: FnOnce(&mut A) -> Result<Vec<Outbound>, E> + Send,
        E: From<RepositoryError> + Send;

    /// Read-modify-write by booking ID.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a [`RepositoryError`] converted into `E`
    /// (`NotFound` when the booking ID is unknown).
    fn update_by_booking_id<F, E>(
        &self,
        booking_id: &str,
        update: F,
    ) -> impl Future<Output = Result<A, E>> + Send
    where
        F: FnOnce(&mut A) -> Result<Vec<Outbound>, E> + Send,
        E: From<RepositoryError> + Send;
}
