//! Failure taxonomy shared by every message handler.
//!
//! A handler never swallows a failure. It either succeeds, turns a business failure into an
//! event, or returns a [`HandlerError`]. Retryable errors are re-run with backoff by the
//! router; everything else, and retryable errors that outlive the retry budget, ends up on the
//! poison topic.

use crate::bus::BusError;
use crate::data_lake::DataLakeError;
use crate::event::EventError;
use crate::projection::ProjectionError;
use crate::repository::RepositoryError;
use thiserror::Error;

/// Why a handler could not process a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Infrastructure hiccup (network, timeout, database, concurrent update)
    #[error("transient failure: {0}")]
    Transient(String),

    /// A causally earlier message has not been processed yet
    #[error("not yet available: {0}")]
    NotYetAvailable(String),

    /// A precondition of the step does not hold yet and may once more messages arrive
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// The message can never be processed (illegal transition, invalid data)
    #[error("rejected: {0}")]
    Rejected(String),

    /// The message could not be decoded
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Whether re-running the handler may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::NotYetAvailable(_) | Self::Precondition(_)
        )
    }
}

impl From<EventError> for HandlerError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Serialization(reason) => Self::Transient(reason),
            other => Self::Malformed(other.to_string()),
        }
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<RepositoryError> for HandlerError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { .. } => Self::NotYetAvailable(err.to_string()),
            RepositoryError::Serialization(_) | RepositoryError::DuplicateBookingId { .. } => {
                Self::Rejected(err.to_string())
            }
            RepositoryError::Conflict(_) | RepositoryError::Database(_) => {
                Self::Transient(err.to_string())
            }
        }
    }
}

impl From<ProjectionError> for HandlerError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::NotYetAvailable(_) => Self::NotYetAvailable(err.to_string()),
            ProjectionError::Serialization(_) => Self::Rejected(err.to_string()),
            ProjectionError::Storage(_) | ProjectionError::EventProcessing(_) => {
                Self::Transient(err.to_string())
            }
        }
    }
}

impl From<DataLakeError> for HandlerError {
    fn from(err: DataLakeError) -> Self {
        Self::Transient(err.to_string())
    }
}
