//! Read models for the ticket service.
//!
//! # Overview
//!
//! - **`OpsBookingsProjection`**: per-booking operational view, tolerant of events arriving
//!   before the booking that owns them
//! - **`PostgresOpsBookingStore`**: JSONB-backed document store for that view
//! - **`rebuild`**: replays the data lake into a projection from scratch
//!
//! ```text
//! events.<Name> ──► Router ──► OpsBookingsProjection ──► read_model_ops_bookings
//!                                       │
//!                                       └─► InternalOpsReadModelUpdated
//!
//! data lake ──► rebuild() ──► OpsBookingsProjection (after reset)
//! ```

pub mod ops_bookings;
pub mod postgres;
pub mod rebuild;

// Re-export main types for convenience
pub use ops_bookings::{OpsBooking, OpsBookingStore, OpsBookingsProjection, OpsTicket};
pub use postgres::PostgresOpsBookingStore;
pub use rebuild::{RebuildError, rebuild};
