//! Show bookings with a capacity check.
//!
//! A booking is stored only if the show still has enough seats. The check and the insert run
//! in one `SERIALIZABLE` transaction together with the `BookingMade_v1` outbox write, so two
//! concurrent bookings can never oversell a show and a stored booking always announces itself.

use crate::outbox::publish_in_tx;
use sqlx::PgPool;
use thiserror::Error;
use ticketflow_core::bus::{BusConfig, Outbound};
use ticketflow_core::event::{BookingMade, Event, EventHeader};
use ticketflow_core::outbox::OutboxError;

/// SQLSTATE for `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";

/// Errors returned by [`PostgresShowBookings`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShowBookingError {
    /// The show does not have enough seats left
    #[error("Show {show_id} has {available} tickets left, {requested} requested")]
    NoAvailableTickets {
        /// Booked show
        show_id: String,
        /// Seats still free
        available: i64,
        /// Seats requested
        requested: u32,
    },

    /// The show does not exist
    #[error("Show not found: {0}")]
    ShowNotFound(String),

    /// A concurrent booking won the serialization race
    #[error("Concurrent booking conflict: {0}")]
    Conflict(String),

    /// Storage failure
    #[error("Database error: {0}")]
    Database(String),
}

fn database(e: sqlx::Error) -> ShowBookingError {
    let serialization = e
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == SERIALIZATION_FAILURE);

    if serialization {
        ShowBookingError::Conflict(e.to_string())
    } else {
        ShowBookingError::Database(e.to_string())
    }
}

fn outbox(e: OutboxError) -> ShowBookingError {
    ShowBookingError::Database(e.to_string())
}

/// A seat reservation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShowBooking {
    /// Booking ID chosen by the requester
    pub booking_id: String,
    /// Show to book
    pub show_id: String,
    /// Customer booking the seats
    pub customer_email: String,
    /// Number of seats
    pub number_of_tickets: u32,
}

/// Whether a call to [`PostgresShowBookings::book`] stored anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BookingOutcome {
    /// The booking was stored and `BookingMade_v1` written to the outbox
    Booked,
    /// A booking with this ID already existed
    AlreadyBooked,
}

/// `PostgreSQL` show bookings.
#[derive(Clone)]
pub struct PostgresShowBookings {
    pool: PgPool,
    bus: BusConfig,
}

impl PostgresShowBookings {
    /// Create a booking store routing its outbox messages with `bus`.
    #[must_use]
    pub const fn new(pool: PgPool, bus: BusConfig) -> Self {
        Self { pool, bus }
    }

    /// Register a show and its capacity. Registering it again updates the capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ShowBookingError::Database`] if the upsert fails.
    pub async fn add_show(&self, show_id: &str, number_of_tickets: u32) -> Result<(), ShowBookingError> {
        sqlx::query(
            r"
            INSERT INTO shows (show_id, number_of_tickets) VALUES ($1, $2)
            ON CONFLICT (show_id) DO UPDATE SET number_of_tickets = EXCLUDED.number_of_tickets
            ",
        )
        .bind(show_id)
        .bind(i64::from(number_of_tickets))
        .execute(&self.pool)
        .await
        .map_err(database)?;

        Ok(())
    }

    /// Book seats, publishing `BookingMade_v1` through the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`ShowBookingError::NoAvailableTickets`] when the show is full,
    /// [`ShowBookingError::ShowNotFound`] for an unknown show, and
    /// [`ShowBookingError::Conflict`] when a concurrent booking must be retried.
    pub async fn book(&self, booking: &ShowBooking) -> Result<BookingOutcome, ShowBookingError> {
        let mut tx = self.pool.begin().await.map_err(database)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(database)?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT booking_id FROM bookings WHERE booking_id = $1")
                .bind(&booking.booking_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(database)?;
        if existing.is_some() {
            tracing::debug!(booking_id = %booking.booking_id, "Booking already stored");
            return Ok(BookingOutcome::AlreadyBooked);
        }

        let (capacity, booked): (i64, i64) = sqlx::query_as(
            r"
            SELECT s.number_of_tickets, COALESCE(SUM(b.number_of_tickets), 0)::bigint
            FROM shows s
            LEFT JOIN bookings b ON b.show_id = s.show_id
            WHERE s.show_id = $1
            GROUP BY s.show_id, s.number_of_tickets
            ",
        )
        .bind(&booking.show_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(database)?
        .ok_or_else(|| ShowBookingError::ShowNotFound(booking.show_id.clone()))?;

        let available = capacity - booked;
        if available < i64::from(booking.number_of_tickets) {
            return Err(ShowBookingError::NoAvailableTickets {
                show_id: booking.show_id.clone(),
                available,
                requested: booking.number_of_tickets,
            });
        }

        sqlx::query(
            r"
            INSERT INTO bookings (booking_id, show_id, customer_email, number_of_tickets)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(&booking.booking_id)
        .bind(&booking.show_id)
        .bind(&booking.customer_email)
        .bind(i64::from(booking.number_of_tickets))
        .execute(&mut *tx)
        .await
        .map_err(database)?;

        let booking_made = Event::from(BookingMade {
            header: EventHeader::with_idempotency_key(&booking.booking_id),
            booking_id: booking.booking_id.clone(),
            number_of_tickets: booking.number_of_tickets,
            customer_email: booking.customer_email.clone(),
            show_id: booking.show_id.clone(),
        });
        publish_in_tx(&mut tx, &self.bus, &[Outbound::from(booking_made)])
            .await
            .map_err(outbox)?;

        tx.commit().await.map_err(database)?;

        tracing::info!(
            booking_id = %booking.booking_id,
            show_id = %booking.show_id,
            tickets = booking.number_of_tickets,
            "Show tickets booked"
        );
        Ok(BookingOutcome::Booked)
    }
}
