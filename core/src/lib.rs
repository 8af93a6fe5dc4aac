//! # Ticketflow Core
//!
//! Message contracts and storage traits shared by the ticket service crates.
//!
//! ## Core Concepts
//!
//! - **Message**: transport unit (ID, metadata, JSON payload)
//! - **Event / Command**: closed, versioned sets of typed messages
//! - **`BusConfig`**: explicit topic naming and envelope construction
//! - **Aggregate repository**: atomic read-modify-write of JSON documents, with outbound
//!   messages written to the outbox in the same transaction
//! - **Outbox**: local append-only log relayed to the transport at-least-once
//! - **Projection**: read models folded from the event stream
//! - **`HandlerError`**: retryable vs. poison-worthy handler failures
//!
//! ## Architecture Principles
//!
//! - At-least-once everywhere, correctness through idempotency
//! - No ordering assumptions across topics
//! - Explicit configuration, no global registries
//! - Closed message sets, no runtime type lookup

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod bus;
pub mod command;
pub mod data_lake;
pub mod event;
pub mod handler;
pub mod message;
pub mod outbox;
pub mod projection;
pub mod repository;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait for time operations
    ///
    /// Abstracts time so handlers and projections can be tested deterministically.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
