//! `PostgreSQL` storage for the ticket service.
//!
//! This crate provides the write side of the service on top of sqlx:
//!
//! - [`PostgresAggregateRepository`]: JSONB aggregates with serializable read-modify-write
//! - [`publish_in_tx`] / [`PostgresOutbox`]: transactional outbox and its relay source
//! - [`PostgresDataLake`]: append-only capture of every external event
//! - [`PoisonQueue`] / [`PoisonQueueWriter`]: storage and tooling for poisoned messages
//! - [`PostgresShowBookings`]: seat bookings with a capacity check
//! - [`initialize_schema`]: idempotent DDL for all of the above
//!
//! # Example
//!
//! ```ignore
//! use ticketflow_postgres::{initialize_schema, AggregateTable, PostgresAggregateRepository};
//!
//! async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     initialize_schema(&pool).await?;
//!     let bundles = PostgresAggregateRepository::<VipBundle>::new(
//!         pool,
//!         BusConfig::new("svc-tickets"),
//!         AggregateTable::VIP_BUNDLES,
//!     );
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bookings;
pub mod data_lake;
pub mod outbox;
pub mod poison_queue;
pub mod repository;
pub mod schema;

pub use bookings::{BookingOutcome, PostgresShowBookings, ShowBooking, ShowBookingError};
pub use data_lake::PostgresDataLake;
pub use outbox::{PostgresOutbox, publish_in_tx};
pub use poison_queue::{PoisonQueue, PoisonQueueError, PoisonQueueWriter, PoisonStatus, PoisonedMessage};
pub use repository::{AggregateTable, PostgresAggregateRepository};
pub use schema::{SchemaError, initialize_schema};
