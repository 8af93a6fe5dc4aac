//! Command handlers.
//!
//! Each handler calls one gateway and reports the outcome as an event. A business refusal is
//! not an error: it becomes a `*Failed_v1` event so the saga can compensate. Only transient
//! failures are returned to the router for retry.
//!
//! Outcome events carry the idempotency key of the command that caused them, so consumers can
//! deduplicate a redelivered command's second outcome.

use crate::gateway::{GatewayError, Gateways, Payments, Receipts, ShowBookings, Transportation};
use async_trait::async_trait;
use std::sync::Arc;
use ticketflow_core::command::{Command, CommandName};
use ticketflow_core::event::{
    BookingFailed, EventHeader, FlightBooked, FlightBookingFailed, TaxiBooked, TaxiBookingFailed,
    TicketRefunded,
};
use ticketflow_core::handler::HandlerError;
use ticketflow_runtime::{CommandHandler, EventBus, Router, RouterError};

fn unexpected(expected: CommandName, command: &Command) -> HandlerError {
    HandlerError::Malformed(format!(
        "expected {expected}, received {}",
        command.name().as_str()
    ))
}

fn outcome_header(command: &Command) -> EventHeader {
    EventHeader::with_idempotency_key(&command.header().idempotency_key)
}

/// Books show seats. Success is announced by the booking store through the outbox.
pub struct BookShowTicketsHandler {
    bookings: Arc<dyn ShowBookings>,
    events: EventBus,
}

impl BookShowTicketsHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(bookings: Arc<dyn ShowBookings>, events: EventBus) -> Self {
        Self { bookings, events }
    }
}

#[async_trait]
impl CommandHandler for BookShowTicketsHandler {
    async fn handle(&self, command: Command) -> Result<(), HandlerError> {
        let Command::BookShowTickets(book) = &command else {
            return Err(unexpected(CommandName::BookShowTickets, &command));
        };

        match self.bookings.book_show_tickets(book).await {
            Ok(()) => Ok(()),
            Err(GatewayError::Conflict(reason)) => {
                tracing::info!(booking_id = %book.booking_id, %reason, "Show booking refused");
                self.events
                    .publish(BookingFailed {
                        header: outcome_header(&command),
                        booking_id: book.booking_id.clone(),
                        failure_reason: reason,
                    })
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Books flights with the transportation provider.
pub struct BookFlightHandler {
    transportation: Arc<dyn Transportation>,
    events: EventBus,
}

impl BookFlightHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(transportation: Arc<dyn Transportation>, events: EventBus) -> Self {
        Self {
            transportation,
            events,
        }
    }
}

#[async_trait]
impl CommandHandler for BookFlightHandler {
    async fn handle(&self, command: Command) -> Result<(), HandlerError> {
        let Command::BookFlight(book) = &command else {
            return Err(unexpected(CommandName::BookFlight, &command));
        };
        let header = outcome_header(&command);

        match self.transportation.book_flight(book).await {
            Ok(ticket_ids) => {
                tracing::info!(
                    flight_id = %book.flight_id,
                    reference_id = %book.reference_id,
                    tickets = ticket_ids.len(),
                    "Flight booked"
                );
                self.events
                    .publish(FlightBooked {
                        header,
                        flight_id: book.flight_id.clone(),
                        ticket_ids,
                        reference_id: book.reference_id.clone(),
                    })
                    .await?;
            }
            Err(GatewayError::Conflict(reason)) => {
                tracing::info!(flight_id = %book.flight_id, %reason, "Flight booking refused");
                self.events
                    .publish(FlightBookingFailed {
                        header,
                        flight_id: book.flight_id.clone(),
                        failure_reason: reason,
                        reference_id: book.reference_id.clone(),
                    })
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

/// Books taxis with the transportation provider.
pub struct BookTaxiHandler {
    transportation: Arc<dyn Transportation>,
    events: EventBus,
}

impl BookTaxiHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(transportation: Arc<dyn Transportation>, events: EventBus) -> Self {
        Self {
            transportation,
            events,
        }
    }
}

#[async_trait]
impl CommandHandler for BookTaxiHandler {
    async fn handle(&self, command: Command) -> Result<(), HandlerError> {
        let Command::BookTaxi(book) = &command else {
            return Err(unexpected(CommandName::BookTaxi, &command));
        };
        let header = outcome_header(&command);

        match self.transportation.book_taxi(book).await {
            Ok(taxi_booking_id) => {
                tracing::info!(reference_id = %book.reference_id, %taxi_booking_id, "Taxi booked");
                self.events
                    .publish(TaxiBooked {
                        header,
                        taxi_booking_id,
                        reference_id: book.reference_id.clone(),
                    })
                    .await?;
            }
            Err(GatewayError::Conflict(reason)) => {
                tracing::info!(reference_id = %book.reference_id, %reason, "Taxi booking refused");
                self.events
                    .publish(TaxiBookingFailed {
                        header,
                        failure_reason: reason,
                        reference_id: book.reference_id.clone(),
                    })
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

/// Cancels flight tickets.
pub struct CancelFlightTicketsHandler {
    transportation: Arc<dyn Transportation>,
}

impl CancelFlightTicketsHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(transportation: Arc<dyn Transportation>) -> Self {
        Self { transportation }
    }
}

#[async_trait]
impl CommandHandler for CancelFlightTicketsHandler {
    async fn handle(&self, command: Command) -> Result<(), HandlerError> {
        let Command::CancelFlightTickets(cancel) = &command else {
            return Err(unexpected(CommandName::CancelFlightTickets, &command));
        };

        self.transportation.cancel_flight_tickets(cancel).await?;
        tracing::info!(tickets = ?cancel.flight_ticket_ids, "Flight tickets cancelled");
        Ok(())
    }
}

/// Refunds a ticket: voids its receipt, refunds the payment, then announces the refund.
pub struct RefundTicketHandler {
    receipts: Arc<dyn Receipts>,
    payments: Arc<dyn Payments>,
    events: EventBus,
}

impl RefundTicketHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(receipts: Arc<dyn Receipts>, payments: Arc<dyn Payments>, events: EventBus) -> Self {
        Self {
            receipts,
            payments,
            events,
        }
    }
}

#[async_trait]
impl CommandHandler for RefundTicketHandler {
    async fn handle(&self, command: Command) -> Result<(), HandlerError> {
        let Command::RefundTicket(refund) = &command else {
            return Err(unexpected(CommandName::RefundTicket, &command));
        };

        self.receipts.void_receipt(refund).await?;
        self.payments.refund(refund).await?;
        self.events
            .publish(TicketRefunded {
                header: outcome_header(&command),
                ticket_id: refund.ticket_id.clone(),
            })
            .await?;

        tracing::info!(ticket_id = %refund.ticket_id, "Ticket refunded");
        Ok(())
    }
}

/// Register the show booking handler, and the external ones when `gateways` is supplied.
///
/// Routes are named after the command, e.g. `BookFlight`.
///
/// # Errors
///
/// Returns [`RouterError::DuplicateHandler`] if a route name is taken.
pub fn register(
    router: &mut Router,
    events: &EventBus,
    bookings: Arc<dyn ShowBookings>,
    gateways: Option<&Gateways>,
) -> Result<(), RouterError> {
    let handlers: Vec<(CommandName, Arc<dyn CommandHandler>)> = match gateways {
        None => vec![(
            CommandName::BookShowTickets,
            Arc::new(BookShowTicketsHandler::new(bookings, events.clone())),
        )],
        Some(gateways) => vec![
            (
                CommandName::BookShowTickets,
                Arc::new(BookShowTicketsHandler::new(bookings, events.clone())),
            ),
            (
                CommandName::BookFlight,
                Arc::new(BookFlightHandler::new(
                    Arc::clone(&gateways.transportation),
                    events.clone(),
                )),
            ),
            (
                CommandName::BookTaxi,
                Arc::new(BookTaxiHandler::new(
                    Arc::clone(&gateways.transportation),
                    events.clone(),
                )),
            ),
            (
                CommandName::CancelFlightTickets,
                Arc::new(CancelFlightTicketsHandler::new(Arc::clone(
                    &gateways.transportation,
                ))),
            ),
            (
                CommandName::RefundTicket,
                Arc::new(RefundTicketHandler::new(
                    Arc::clone(&gateways.receipts),
                    Arc::clone(&gateways.payments),
                    events.clone(),
                )),
            ),
        ],
    };

    for (command, handler) in handlers {
        router.add_command_handler(command.as_str(), command, handler)?;
    }
    Ok(())
}
