//! The VIP bundle aggregate.
//!
//! A bundle is the saga's unit of consistency: show tickets, an inbound and a return flight and
//! a taxi, booked one after the other. It is stored as one JSON document keyed by its ID and,
//! secondarily, by the show booking it owns.

use crate::fsm::BundleState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ticketflow_core::bus::Outbound;
use ticketflow_core::command::{BookFlight, BookShowTickets, BookTaxi, CancelFlightTickets, Command, RefundTicket};
use ticketflow_core::event::{Event, EventHeader, VipBundleFinalized, VipBundleInitialized};
use ticketflow_core::repository::Aggregate;

/// Why a bundle request was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VipBundleError {
    /// A required field is empty
    #[error("{0} must be set")]
    MissingField(&'static str),

    /// Zero tickets requested
    #[error("number of tickets must be greater than 0")]
    NoTickets,

    /// One passenger per ticket is required
    #[error("number of tickets ({tickets}) and passengers ({passengers}) mismatch")]
    PassengerMismatch {
        /// Requested tickets
        tickets: u32,
        /// Listed passengers
        passengers: usize,
    },

    /// Inbound and return flight are the same flight
    #[error("inbound and return flight must differ, both are {0}")]
    SameFlight(String),
}

/// What a customer asks for when booking a bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipBundleRequest {
    /// Customer contact
    pub customer_email: String,
    /// Seats to book
    pub number_of_tickets: u32,
    /// Show to book
    pub show_id: String,
    /// One name per seat
    pub passengers: Vec<String>,
    /// Flight to the show
    pub inbound_flight_id: String,
    /// Flight back
    pub return_flight_id: String,
}

/// Which of the two flights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Leg {
    /// Flight to the show
    Inbound,
    /// Flight back
    Return,
}

impl Leg {
    /// Lowercase name used in idempotency keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Return => "return",
        }
    }
}

/// One flight of the bundle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flight {
    /// Requested flight
    pub flight_id: String,
    /// When the booking was confirmed
    pub booked_at: Option<DateTime<Utc>>,
    /// Issued flight tickets
    pub ticket_ids: Vec<String>,
}

/// The VIP bundle aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipBundle {
    /// Primary key
    pub vip_bundle_id: String,
    /// Show booking owned by this bundle
    pub booking_id: String,
    /// Customer contact
    pub customer_email: String,
    /// Seats booked
    pub number_of_tickets: u32,
    /// Booked show
    pub show_id: String,
    /// One name per seat
    pub passengers: Vec<String>,
    /// When the show booking was made
    pub booking_made_at: Option<DateTime<Utc>>,
    /// Confirmed show tickets, in confirmation order, without duplicates
    pub ticket_ids: Vec<String>,
    /// Flight to the show
    pub inbound_flight: Flight,
    /// Flight back
    pub return_flight: Flight,
    /// Taxi provider's booking
    pub taxi_booking_id: Option<String>,
    /// When the taxi was booked
    pub taxi_booked_at: Option<DateTime<Utc>>,
    /// Why the bundle failed
    pub failure_reason: Option<String>,
    /// Workflow position
    pub state: BundleState,
}

fn required(field: &'static str, value: &str) -> Result<(), VipBundleError> {
    if value.trim().is_empty() {
        Err(VipBundleError::MissingField(field))
    } else {
        Ok(())
    }
}

impl VipBundle {
    /// Validate a request and build a new bundle.
    ///
    /// # Errors
    ///
    /// Returns a [`VipBundleError`] describing the first invalid field.
    pub fn new(
        vip_bundle_id: impl Into<String>,
        booking_id: impl Into<String>,
        request: VipBundleRequest,
    ) -> Result<Self, VipBundleError> {
        let vip_bundle_id = vip_bundle_id.into();
        let booking_id = booking_id.into();

        required("vip bundle id", &vip_bundle_id)?;
        required("booking id", &booking_id)?;
        required("customer email", &request.customer_email)?;
        if request.number_of_tickets == 0 {
            return Err(VipBundleError::NoTickets);
        }
        required("show id", &request.show_id)?;
        if request.passengers.len() != request.number_of_tickets as usize {
            return Err(VipBundleError::PassengerMismatch {
                tickets: request.number_of_tickets,
                passengers: request.passengers.len(),
            });
        }
        required("inbound flight id", &request.inbound_flight_id)?;
        required("return flight id", &request.return_flight_id)?;
        if request.inbound_flight_id == request.return_flight_id {
            return Err(VipBundleError::SameFlight(request.inbound_flight_id));
        }

        Ok(Self {
            vip_bundle_id,
            booking_id,
            customer_email: request.customer_email,
            number_of_tickets: request.number_of_tickets,
            show_id: request.show_id,
            passengers: request.passengers,
            booking_made_at: None,
            ticket_ids: Vec::new(),
            inbound_flight: Flight {
                flight_id: request.inbound_flight_id,
                ..Flight::default()
            },
            return_flight: Flight {
                flight_id: request.return_flight_id,
                ..Flight::default()
            },
            taxi_booking_id: None,
            taxi_booked_at: None,
            failure_reason: None,
            state: BundleState::New,
        })
    }

    /// Whether the workflow is over, successfully or not.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the workflow ended in a compensated failure.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.state == BundleState::Failed
    }

    /// Whether every booked seat has a confirmed ticket.
    #[must_use]
    pub fn all_tickets_confirmed(&self) -> bool {
        self.ticket_ids.len() == self.number_of_tickets as usize
    }

    /// Whether the show booking produced tickets that would need refunding.
    #[must_use]
    pub fn show_tickets_issued(&self) -> bool {
        self.booking_made_at.is_some() || !self.ticket_ids.is_empty()
    }

    /// Record a confirmed ticket. Returns `false` if it was already recorded.
    pub fn confirm_ticket(&mut self, ticket_id: &str) -> bool {
        if self.ticket_ids.iter().any(|known| known == ticket_id) {
            return false;
        }
        self.ticket_ids.push(ticket_id.to_string());
        true
    }

    /// Which leg a flight ID refers to.
    #[must_use]
    pub fn leg_of(&self, flight_id: &str) -> Option<Leg> {
        if self.inbound_flight.flight_id == flight_id {
            Some(Leg::Inbound)
        } else if self.return_flight.flight_id == flight_id {
            Some(Leg::Return)
        } else {
            None
        }
    }

    /// Flight of a leg.
    #[must_use]
    pub const fn flight(&self, leg: Leg) -> &Flight {
        match leg {
            Leg::Inbound => &self.inbound_flight,
            Leg::Return => &self.return_flight,
        }
    }

    /// Mutable flight of a leg.
    pub fn flight_mut(&mut self, leg: Leg) -> &mut Flight {
        match leg {
            Leg::Inbound => &mut self.inbound_flight,
            Leg::Return => &mut self.return_flight,
        }
    }

    /// `BookShowTickets` for this bundle, keyed by the booking ID.
    #[must_use]
    pub fn book_show_tickets(&self) -> Outbound {
        Outbound::from(Command::from(BookShowTickets {
            header: EventHeader::with_idempotency_key(&self.booking_id),
            booking_id: self.booking_id.clone(),
            customer_email: self.customer_email.clone(),
            number_of_tickets: self.number_of_tickets,
            show_id: self.show_id.clone(),
        }))
    }

    /// `BookFlight` for one leg.
    #[must_use]
    pub fn book_flight(&self, leg: Leg) -> Outbound {
        Outbound::from(Command::from(BookFlight {
            header: EventHeader::with_idempotency_key(format!(
                "{}-{}-flight",
                self.vip_bundle_id,
                leg.as_str()
            )),
            customer_email: self.customer_email.clone(),
            flight_id: self.flight(leg).flight_id.clone(),
            passengers: self.passengers.clone(),
            reference_id: self.vip_bundle_id.clone(),
        }))
    }

    /// `BookTaxi` for every passenger, in the first passenger's name.
    #[must_use]
    pub fn book_taxi(&self) -> Outbound {
        Outbound::from(Command::from(BookTaxi {
            header: EventHeader::with_idempotency_key(format!("{}-taxi", self.vip_bundle_id)),
            customer_email: self.customer_email.clone(),
            customer_name: self.passengers.first().cloned().unwrap_or_default(),
            number_of_passengers: self.number_of_tickets,
            reference_id: self.vip_bundle_id.clone(),
        }))
    }

    /// One `RefundTicket` per confirmed ticket.
    #[must_use]
    pub fn refunds(&self) -> Vec<Outbound> {
        self.ticket_ids
            .iter()
            .map(|ticket_id| {
                Outbound::from(Command::from(RefundTicket {
                    header: EventHeader::with_idempotency_key(format!(
                        "{}-refund-{ticket_id}",
                        self.vip_bundle_id
                    )),
                    ticket_id: ticket_id.clone(),
                }))
            })
            .collect()
    }

    /// `CancelFlightTickets` for every leg that was booked.
    #[must_use]
    pub fn flight_cancellations(&self) -> Vec<Outbound> {
        [Leg::Inbound, Leg::Return]
            .into_iter()
            .filter(|leg| self.flight(*leg).booked_at.is_some())
            .map(|leg| {
                Outbound::from(Command::from(CancelFlightTickets {
                    header: EventHeader::with_idempotency_key(format!(
                        "{}-cancel-{}",
                        self.vip_bundle_id,
                        leg.as_str()
                    )),
                    flight_ticket_ids: self.flight(leg).ticket_ids.clone(),
                }))
            })
            .collect()
    }

    /// `VipBundleFinalized_v1`, keyed by the bundle ID.
    #[must_use]
    pub fn finalized(&self) -> Outbound {
        Outbound::from(Event::from(VipBundleFinalized {
            header: EventHeader::with_idempotency_key(&self.vip_bundle_id),
            vip_bundle_id: self.vip_bundle_id.clone(),
        }))
    }
}

impl Aggregate for VipBundle {
    fn aggregate_id(&self) -> &str {
        &self.vip_bundle_id
    }

    fn booking_id(&self) -> &str {
        &self.booking_id
    }

    fn created(&self) -> Vec<Outbound> {
        vec![Outbound::from(Event::from(VipBundleInitialized {
            header: EventHeader::with_idempotency_key(&self.vip_bundle_id),
            vip_bundle_id: self.vip_bundle_id.clone(),
        }))]
    }
}
