//! Operational view of bookings and their tickets.
//!
//! One document per booking, keyed by booking ID, with a map of ticket ID to ticket details.
//! The document is created by `BookingMade` and enriched by ticket-level events. Because the
//! bus does not order events across topics, a ticket event can arrive before the booking
//! exists; that case is reported as [`ProjectionError::NotYetAvailable`] and retried by the
//! router until `BookingMade` has been applied.
//!
//! # Example
//!
//! ```ignore
//! let projection = OpsBookingsProjection::new(store)
//!     .with_notifications(event_bus);
//!
//! router.add_projection(Arc::new(projection))?;
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use ticketflow_core::environment::{Clock, SystemClock};
use ticketflow_core::event::{
    BookingMade, Event, EventHeader, EventName, OpsReadModelUpdated, TicketBookingConfirmed,
};
use ticketflow_core::projection::{Projection, ProjectionError, Result};
use ticketflow_runtime::EventBus;

/// Ticket details inside an [`OpsBooking`].
///
/// Every field is optional in JSON so that documents written by older versions still load.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsTicket {
    /// Price as a decimal string
    pub price_amount: String,
    /// Price currency
    pub price_currency: String,
    /// Ticket owner
    pub customer_email: String,
    /// When the show provider confirmed the ticket
    pub confirmed_at: Option<DateTime<Utc>>,
    /// When the ticket PDF was generated
    pub printed_at: Option<DateTime<Utc>>,
    /// Generated file
    pub printed_file_name: String,
    /// When the receipt was issued
    pub receipt_issued_at: Option<DateTime<Utc>>,
    /// Receipt number
    pub receipt_number: String,
    /// When the ticket was refunded
    pub refunded_at: Option<DateTime<Utc>>,
}

/// Read model document of one booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsBooking {
    /// Booking ID (document key)
    pub booking_id: String,
    /// Publication time of the `BookingMade` event
    pub booked_at: DateTime<Utc>,
    /// Tickets by ID
    #[serde(default)]
    pub tickets: BTreeMap<String, OpsTicket>,
    /// Last time the document changed
    pub last_update: DateTime<Utc>,
}

impl OpsBooking {
    /// Whether any ticket of the booking had its receipt issued on `date`.
    #[must_use]
    pub fn has_receipt_issued_on(&self, date: NaiveDate) -> bool {
        self.tickets
            .values()
            .filter_map(|ticket| ticket.receipt_issued_at)
            .any(|issued_at| issued_at.date_naive() == date)
    }
}

/// Storage of [`OpsBooking`] documents.
///
/// Updates are read-modify-write on a single document. Implementations must report a
/// missing document as [`ProjectionError::NotYetAvailable`].
pub trait OpsBookingStore: Send + Sync {
    /// Insert a new document. An existing document with the same booking ID is kept as is.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on storage failure.
    fn create(&self, booking: OpsBooking) -> impl Future<Output = Result<()>> + Send;

    /// Update the document of a booking.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotYetAvailable`] if the booking has no document.
    fn update_by_booking_id<F>(
        &self,
        booking_id: &str,
        update: F,
    ) -> impl Future<Output = Result<OpsBooking>> + Send
    where
        F: FnOnce(&mut OpsBooking) + Send;

    /// Update the document containing a ticket.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotYetAvailable`] if no document contains the ticket.
    fn update_by_ticket_id<F>(
        &self,
        ticket_id: &str,
        update: F,
    ) -> impl Future<Output = Result<OpsBooking>> + Send
    where
        F: FnOnce(&mut OpsBooking) + Send;

    /// Load one document.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on storage failure.
    fn get(&self, booking_id: &str) -> impl Future<Output = Result<Option<OpsBooking>>> + Send;

    /// Load every document, optionally only those with a receipt issued on the given date.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on storage failure.
    fn all(
        &self,
        receipt_issue_date: Option<NaiveDate>,
    ) -> impl Future<Output = Result<Vec<OpsBooking>>> + Send;

    /// Delete every document.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on storage failure.
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Projection maintaining [`OpsBooking`] documents.
pub struct OpsBookingsProjection<S> {
    store: S,
    clock: Arc<dyn Clock>,
    notifications: Option<EventBus>,
}

impl<S: OpsBookingStore> OpsBookingsProjection<S> {
    /// Create a projection writing into `store`.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            notifications: None,
        }
    }

    /// Use another clock for `last_update`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish `InternalOpsReadModelUpdated` after every update that changes a document.
    #[must_use]
    pub fn with_notifications(mut self, bus: EventBus) -> Self {
        self.notifications = Some(bus);
        self
    }

    /// The backing store, for queries.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    async fn on_booking_made(&self, event: &BookingMade) -> Result<()> {
        self.store
            .create(OpsBooking {
                booking_id: event.booking_id.clone(),
                booked_at: event.header.published_at,
                tickets: BTreeMap::new(),
                last_update: self.clock.now(),
            })
            .await
    }

    async fn on_ticket_confirmed(&self, event: &TicketBookingConfirmed) -> Result<Option<OpsBooking>> {
        let now = self.clock.now();
        let mut changed = false;
        let booking = self
            .store
            .update_by_booking_id(&event.booking_id, |booking| {
                changed = merge_ticket(booking, &event.ticket_id, now, |ticket| {
                    ticket.price_amount.clone_from(&event.price.amount);
                    ticket.price_currency.clone_from(&event.price.currency);
                    ticket.customer_email.clone_from(&event.customer_email);
                    ticket.confirmed_at = Some(event.header.published_at);
                });
            })
            .await?;
        Ok(changed.then_some(booking))
    }

    async fn update_ticket<F>(&self, ticket_id: &str, update: F) -> Result<Option<OpsBooking>>
    where
        F: FnOnce(&mut OpsTicket) + Send,
    {
        let now = self.clock.now();
        let mut changed = false;
        let booking = self
            .store
            .update_by_ticket_id(ticket_id, |booking| {
                changed = merge_ticket(booking, ticket_id, now, update);
            })
            .await?;
        Ok(changed.then_some(booking))
    }

    async fn notify(&self, booking_id: &str) {
        let Some(bus) = &self.notifications else {
            return;
        };

        let updated = OpsReadModelUpdated {
            header: EventHeader::new(),
            booking_id: booking_id.to_string(),
        };
        if let Err(err) = bus.publish(updated).await {
            tracing::error!(booking_id, error = %err, "Could not publish InternalOpsReadModelUpdated");
        }
    }
}

/// Apply `update` to one ticket, bumping `last_update` only if something changed.
fn merge_ticket<F>(booking: &mut OpsBooking, ticket_id: &str, now: DateTime<Utc>, update: F) -> bool
where
    F: FnOnce(&mut OpsTicket),
{
    let before = booking.tickets.get(ticket_id).cloned();
    let ticket = booking.tickets.entry(ticket_id.to_string()).or_default();
    update(ticket);

    let changed = before.as_ref() != Some(&*ticket);
    if changed {
        booking.last_update = now;
    }
    changed
}

impl<S: OpsBookingStore> Projection for OpsBookingsProjection<S> {
    fn name(&self) -> &str {
        "ops_bookings"
    }

    fn handled_events(&self) -> &'static [EventName] {
        &[
            EventName::BookingMade,
            EventName::TicketBookingConfirmed,
            EventName::TicketRefunded,
            EventName::TicketPrinted,
            EventName::TicketReceiptIssued,
        ]
    }

    async fn apply_event(&self, event: &Event) -> Result<()> {
        let updated = match event {
            Event::BookingMade(e) => {
                tracing::debug!(booking_id = %e.booking_id, "Creating ops booking");
                self.on_booking_made(e).await?;
                return Ok(());
            }
            Event::TicketBookingConfirmed(e) => self.on_ticket_confirmed(e).await?,
            Event::TicketRefunded(e) => {
                let refunded_at = e.header.published_at;
                self.update_ticket(&e.ticket_id, |ticket| {
                    ticket.refunded_at = Some(refunded_at);
                })
                .await?
            }
            Event::TicketPrinted(e) => {
                self.update_ticket(&e.ticket_id, |ticket| {
                    ticket.printed_at = Some(e.header.published_at);
                    ticket.printed_file_name.clone_from(&e.file_name);
                })
                .await?
            }
            Event::TicketReceiptIssued(e) => {
                self.update_ticket(&e.ticket_id, |ticket| {
                    ticket.receipt_issued_at = Some(e.issued_at);
                    ticket.receipt_number.clone_from(&e.receipt_number);
                })
                .await?
            }
            other => {
                return Err(ProjectionError::EventProcessing(format!(
                    "{} is not handled by ops_bookings",
                    other.name()
                )));
            }
        };

        match updated {
            Some(booking) => self.notify(&booking.booking_id).await,
            None => tracing::debug!(event_name = %event.name(), "Ops booking unchanged"),
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.store.clear().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn receipt_date_filter_matches_any_ticket() {
        let issued = Utc.with_ymd_and_hms(2024, 3, 10, 23, 30, 0).single();
        let booking = OpsBooking {
            booking_id: "b-1".to_string(),
            booked_at: Utc::now(),
            tickets: BTreeMap::from([
                ("t-1".to_string(), OpsTicket::default()),
                (
                    "t-2".to_string(),
                    OpsTicket {
                        receipt_issued_at: issued,
                        ..OpsTicket::default()
                    },
                ),
            ]),
            last_update: Utc::now(),
        };

        assert!(booking.has_receipt_issued_on(NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()));
        assert!(!booking.has_receipt_issued_on(NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()));
    }

    #[test]
    fn tickets_default_when_missing_from_json() {
        let json = r#"{
            "booking_id": "b-1",
            "booked_at": "2024-01-01T00:00:00Z",
            "last_update": "2024-01-01T00:00:00Z"
        }"#;

        let booking: OpsBooking = serde_json::from_str(json).unwrap();

        assert!(booking.tickets.is_empty());
    }
}
