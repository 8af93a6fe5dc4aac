//! Ports to the services the command handlers talk to.
//!
//! Flights, taxis, payments and receipts live outside this service. Each is reached through a
//! small trait so the handlers can be tested without a network, and so the binary can swap in
//! the always-succeeding mocks below during development. Show bookings are local and backed by
//! [`PostgresShowBookings`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use ticketflow_core::command::{BookFlight, BookShowTickets, BookTaxi, CancelFlightTickets, RefundTicket};
use ticketflow_core::handler::HandlerError;
use ticketflow_postgres::{BookingOutcome, PostgresShowBookings, ShowBooking, ShowBookingError};

/// Boxed future returned by every gateway.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

/// Gateway failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The request was refused for a business reason (no seats, sold out flight)
    #[error("{0}")]
    Conflict(String),

    /// The call failed and may succeed if repeated
    #[error("gateway unavailable: {0}")]
    Transient(String),
}

impl From<GatewayError> for HandlerError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transient(reason) => Self::Transient(reason),
            GatewayError::Conflict(reason) => Self::Rejected(reason),
        }
    }
}

/// Flight and taxi provider.
pub trait Transportation: Send + Sync {
    /// Book flight tickets, returning one ticket ID per passenger.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Conflict`] if the flight cannot take the passengers.
    fn book_flight<'a>(&'a self, command: &'a BookFlight) -> GatewayFuture<'a, Vec<String>>;

    /// Book a taxi, returning the taxi booking ID.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Conflict`] if no taxi is available.
    fn book_taxi<'a>(&'a self, command: &'a BookTaxi) -> GatewayFuture<'a, String>;

    /// Cancel flight tickets. Cancelling unknown or cancelled tickets succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transient`] if the provider is unreachable.
    fn cancel_flight_tickets<'a>(&'a self, command: &'a CancelFlightTickets) -> GatewayFuture<'a, ()>;
}

/// Payment provider.
pub trait Payments: Send + Sync {
    /// Refund a ticket. Refunding twice with the same idempotency key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transient`] if the provider is unreachable.
    fn refund<'a>(&'a self, command: &'a RefundTicket) -> GatewayFuture<'a, ()>;
}

/// Receipt issuer.
pub trait Receipts: Send + Sync {
    /// Void the receipt of a refunded ticket.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transient`] if the issuer is unreachable.
    fn void_receipt<'a>(&'a self, command: &'a RefundTicket) -> GatewayFuture<'a, ()>;
}

/// Local seat bookings.
pub trait ShowBookings: Send + Sync {
    /// Book seats; booking an existing booking ID again succeeds without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Conflict`] when the show is full or unknown.
    fn book_show_tickets<'a>(&'a self, command: &'a BookShowTickets) -> GatewayFuture<'a, ()>;
}

impl From<ShowBookingError> for GatewayError {
    fn from(err: ShowBookingError) -> Self {
        match err {
            ShowBookingError::NoAvailableTickets { .. } | ShowBookingError::ShowNotFound(_) => {
                Self::Conflict(err.to_string())
            }
            ShowBookingError::Conflict(_) | ShowBookingError::Database(_) => {
                Self::Transient(err.to_string())
            }
        }
    }
}

impl ShowBookings for PostgresShowBookings {
    fn book_show_tickets<'a>(&'a self, command: &'a BookShowTickets) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            let booking = ShowBooking {
                booking_id: command.booking_id.clone(),
                show_id: command.show_id.clone(),
                customer_email: command.customer_email.clone(),
                number_of_tickets: command.number_of_tickets,
            };

            match self.book(&booking).await? {
                BookingOutcome::Booked => {
                    tracing::info!(booking_id = %booking.booking_id, show_id = %booking.show_id, "Show tickets booked");
                }
                BookingOutcome::AlreadyBooked => {
                    tracing::debug!(booking_id = %booking.booking_id, "Show tickets already booked");
                }
            }
            Ok(())
        })
    }
}

/// Mock transportation provider (always succeeds)
///
/// Issues sequential ticket and taxi IDs. Replace with a real integration in production.
#[derive(Debug)]
pub struct MockTransportation {
    next_id: AtomicU64,
}

impl MockTransportation {
    /// Creates a new mock provider
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MockTransportation {
    fn default() -> Self {
        Self::new()
    }
}

impl Transportation for MockTransportation {
    fn book_flight<'a>(&'a self, command: &'a BookFlight) -> GatewayFuture<'a, Vec<String>> {
        let tickets = command
            .passengers
            .iter()
            .map(|_| self.next(&command.flight_id))
            .collect();
        Box::pin(async move { Ok(tickets) })
    }

    fn book_taxi<'a>(&'a self, _command: &'a BookTaxi) -> GatewayFuture<'a, String> {
        let taxi_booking_id = self.next("taxi");
        Box::pin(async move { Ok(taxi_booking_id) })
    }

    fn cancel_flight_tickets<'a>(&'a self, _command: &'a CancelFlightTickets) -> GatewayFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Mock payment and receipt provider (always succeeds)
#[derive(Debug, Clone, Copy, Default)]
pub struct MockPayments;

impl Payments for MockPayments {
    fn refund<'a>(&'a self, _command: &'a RefundTicket) -> GatewayFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

impl Receipts for MockPayments {
    fn void_receipt<'a>(&'a self, _command: &'a RefundTicket) -> GatewayFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// External providers used by the command handlers.
#[derive(Clone)]
pub struct Gateways {
    /// Flights and taxis
    pub transportation: Arc<dyn Transportation>,
    /// Refunds
    pub payments: Arc<dyn Payments>,
    /// Receipts
    pub receipts: Arc<dyn Receipts>,
}

impl Gateways {
    /// Mock providers for development.
    #[must_use]
    pub fn mock() -> Self {
        Self {
            transportation: Arc::new(MockTransportation::new()),
            payments: Arc::new(MockPayments),
            receipts: Arc::new(MockPayments),
        }
    }
}
