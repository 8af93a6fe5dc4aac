//! Event contracts exchanged between the ticket service and its collaborators.
//!
//! Every event this service publishes or consumes is a variant of the closed [`Event`] enum.
//! The logical name of each variant carries a version suffix (`BookingMade_v1`) so that the
//! payload schema can evolve without breaking in-flight sagas, and decoding is a plain match
//! on [`EventName`] instead of a runtime type registry.
//!
//! # Wire format
//!
//! The payload is the JSON document of the variant's struct, header included:
//!
//! ```json
//! {
//!   "header": {"id": "…", "published_at": "2025-01-01T00:00:00Z", "idempotency_key": "…"},
//!   "booking_id": "…",
//!   "number_of_tickets": 2,
//!   "customer_email": "…",
//!   "show_id": "…"
//! }
//! ```
//!
//! The name travels in the message metadata (see [`crate::message::NAME_KEY`]).
//!
//! # Example
//!
//! ```
//! use ticketflow_core::event::{Event, EventHeader, EventName, VipBundleInitialized};
//!
//! let event = Event::from(VipBundleInitialized {
//!     header: EventHeader::new(),
//!     vip_bundle_id: "bundle-1".to_string(),
//! });
//!
//! assert_eq!(event.name(), EventName::VipBundleInitialized);
//! assert_eq!(event.name().as_str(), "VipBundleInitialized_v1");
//!
//! let payload = event.to_payload().unwrap();
//! let decoded = Event::from_payload(EventName::VipBundleInitialized, &payload).unwrap();
//! assert_eq!(decoded, event);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for event encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize a payload to JSON.
    #[error("Failed to serialize message: {0}")]
    Serialization(String),

    /// Failed to deserialize a payload of a known name.
    #[error("Failed to deserialize {name}: {reason}")]
    Deserialization {
        /// Name the payload was decoded as
        name: &'static str,
        /// Underlying decoder error
        reason: String,
    },

    /// The message name is not part of the closed event or command set.
    #[error("Unknown message name: {0}")]
    UnknownName(String),

    /// The message carries no name metadata at all.
    #[error("Message {0} has no name metadata")]
    MissingName(String),
}

/// Header carried by every event and command.
///
/// `id` identifies the message for logs and audit only. Deduplication of side effects relies on
/// `idempotency_key`, which producers derive from the logical cause of the message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Unique message ID
    pub id: String,
    /// When the message was produced
    pub published_at: DateTime<Utc>,
    /// Key downstream systems use to collapse retried requests
    #[serde(default)]
    pub idempotency_key: String,
}

impl EventHeader {
    /// Create a header with a fresh ID, the current time and no idempotency key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            published_at: Utc::now(),
            idempotency_key: String::new(),
        }
    }

    /// Create a header with a fresh ID, the current time and the given idempotency key.
    #[must_use]
    pub fn with_idempotency_key(idempotency_key: impl Into<String>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            ..Self::new()
        }
    }
}

impl Default for EventHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Monetary amount as exchanged with the payment provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Decimal amount as a string (`"49.90"`)
    pub amount: String,
    /// ISO currency code
    pub currency: String,
}

/// A ticket was confirmed by the show provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketBookingConfirmed {
    /// Message header
    pub header: EventHeader,
    /// Confirmed ticket
    pub ticket_id: String,
    /// Ticket owner
    pub customer_email: String,
    /// Ticket price
    pub price: Money,
    /// Booking the ticket belongs to
    pub booking_id: String,
}

/// A ticket was canceled by the show provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketBookingCanceled {
    /// Message header
    pub header: EventHeader,
    /// Canceled ticket
    pub ticket_id: String,
    /// Ticket owner
    pub customer_email: String,
    /// Ticket price
    pub price: Money,
    /// Booking the ticket belongs to
    pub booking_id: String,
}

/// A ticket PDF was generated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketPrinted {
    /// Message header
    pub header: EventHeader,
    /// Printed ticket
    pub ticket_id: String,
    /// Name of the generated file
    pub file_name: String,
}

/// Seats for a show were booked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingMade {
    /// Message header
    pub header: EventHeader,
    /// Booking ID
    pub booking_id: String,
    /// Number of seats booked
    pub number_of_tickets: u32,
    /// Customer who booked
    pub customer_email: String,
    /// Booked show
    pub show_id: String,
}

/// A receipt was issued for a ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketReceiptIssued {
    /// Message header
    pub header: EventHeader,
    /// Ticket the receipt is for
    pub ticket_id: String,
    /// Receipt number assigned by the receipts service
    pub receipt_number: String,
    /// When the receipt was issued
    pub issued_at: DateTime<Utc>,
}

/// A ticket was refunded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRefunded {
    /// Message header
    pub header: EventHeader,
    /// Refunded ticket
    pub ticket_id: String,
}

/// The ops read model changed for a booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsReadModelUpdated {
    /// Message header
    pub header: EventHeader,
    /// Booking whose document changed
    pub booking_id: String,
}

/// A VIP bundle row was created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipBundleInitialized {
    /// Message header
    pub header: EventHeader,
    /// New bundle
    pub vip_bundle_id: String,
}

/// Seats for a show could not be booked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingFailed {
    /// Message header
    pub header: EventHeader,
    /// Booking that failed
    pub booking_id: String,
    /// Human readable reason
    pub failure_reason: String,
}

/// Flight tickets were booked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightBooked {
    /// Message header
    pub header: EventHeader,
    /// Booked flight
    pub flight_id: String,
    /// Issued flight tickets
    #[serde(rename = "flight_tickets_ids")]
    pub ticket_ids: Vec<String>,
    /// Correlation ID of the requester
    pub reference_id: String,
}

/// Flight tickets could not be booked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightBookingFailed {
    /// Message header
    pub header: EventHeader,
    /// Flight that could not be booked
    pub flight_id: String,
    /// Human readable reason
    pub failure_reason: String,
    /// Correlation ID of the requester
    pub reference_id: String,
}

/// A taxi was booked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxiBooked {
    /// Message header
    pub header: EventHeader,
    /// Booking ID assigned by the taxi provider
    pub taxi_booking_id: String,
    /// Correlation ID of the requester
    pub reference_id: String,
}

/// A VIP bundle completed successfully.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipBundleFinalized {
    /// Message header
    pub header: EventHeader,
    /// Finalized bundle
    pub vip_bundle_id: String,
}

/// A taxi could not be booked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxiBookingFailed {
    /// Message header
    pub header: EventHeader,
    /// Human readable reason
    pub failure_reason: String,
    /// Correlation ID of the requester
    pub reference_id: String,
}

macro_rules! closed_event_set {
    ($( $(#[$doc:meta])* $variant:ident($payload:ident) => $name:literal, internal = $internal:literal; )+) => {
        /// Discriminant of every event in the closed set.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum EventName {
            $( $(#[$doc])* $variant, )+
        }

        impl EventName {
            /// Every known event name.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)+];

            /// Versioned wire name.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            /// Internal events never leave the service and skip the shared `events` topic.
            #[must_use]
            pub const fn is_internal(self) -> bool {
                match self {
                    $(Self::$variant => $internal,)+
                }
            }

            /// Resolve a wire name.
            ///
            /// # Errors
            ///
            /// Returns [`EventError::UnknownName`] for names outside the closed set.
            pub fn parse(name: &str) -> Result<Self, EventError> {
                match name {
                    $($name => Ok(Self::$variant),)+
                    other => Err(EventError::UnknownName(other.to_string())),
                }
            }
        }

        /// Every event this service publishes or consumes.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum Event {
            $( $(#[$doc])* $variant($payload), )+
        }

        impl Event {
            /// Discriminant of this event.
            #[must_use]
            pub const fn name(&self) -> EventName {
                match self {
                    $(Self::$variant(_) => EventName::$variant,)+
                }
            }

            /// Header of this event.
            #[must_use]
            pub const fn header(&self) -> &EventHeader {
                match self {
                    $(Self::$variant(event) => &event.header,)+
                }
            }

            /// Encode the payload as JSON.
            ///
            /// # Errors
            ///
            /// Returns [`EventError::Serialization`] if JSON encoding fails.
            pub fn to_payload(&self) -> Result<Vec<u8>, EventError> {
                match self {
                    $(Self::$variant(event) => serde_json::to_vec(event),)+
                }
                .map_err(|e| EventError::Serialization(e.to_string()))
            }

            /// Decode a JSON payload known to carry `name`.
            ///
            /// # Errors
            ///
            /// Returns [`EventError::Deserialization`] if the payload does not match the schema.
            pub fn from_payload(name: EventName, payload: &[u8]) -> Result<Self, EventError> {
                match name {
                    $(EventName::$variant => serde_json::from_slice(payload).map(Self::$variant),)+
                }
                .map_err(|e| EventError::Deserialization {
                    name: name.as_str(),
                    reason: e.to_string(),
                })
            }
        }

        $(
            impl From<$payload> for Event {
                fn from(event: $payload) -> Self {
                    Self::$variant(event)
                }
            }
        )+
    };
}

closed_event_set! {
    /// `TicketBookingConfirmed_v1`
    TicketBookingConfirmed(TicketBookingConfirmed) => "TicketBookingConfirmed_v1", internal = false;
    /// `TicketBookingCanceled_v1`
    TicketBookingCanceled(TicketBookingCanceled) => "TicketBookingCanceled_v1", internal = false;
    /// `TicketPrinted_v1`
    TicketPrinted(TicketPrinted) => "TicketPrinted_v1", internal = false;
    /// `BookingMade_v1`
    BookingMade(BookingMade) => "BookingMade_v1", internal = false;
    /// `TicketReceiptIssued_v1`
    TicketReceiptIssued(TicketReceiptIssued) => "TicketReceiptIssued_v1", internal = false;
    /// `TicketRefunded_v1`
    TicketRefunded(TicketRefunded) => "TicketRefunded_v1", internal = false;
    /// `InternalOpsReadModelUpdated`
    OpsReadModelUpdated(OpsReadModelUpdated) => "InternalOpsReadModelUpdated", internal = true;
    /// `VipBundleInitialized_v1`
    VipBundleInitialized(VipBundleInitialized) => "VipBundleInitialized_v1", internal = false;
    /// `BookingFailed_v1`
    BookingFailed(BookingFailed) => "BookingFailed_v1", internal = false;
    /// `FlightBooked_v1`
    FlightBooked(FlightBooked) => "FlightBooked_v1", internal = false;
    /// `FlightBookingFailed_v1`
    FlightBookingFailed(FlightBookingFailed) => "FlightBookingFailed_v1", internal = false;
    /// `TaxiBooked_v1`
    TaxiBooked(TaxiBooked) => "TaxiBooked_v1", internal = false;
    /// `VipBundleFinalized_v1`
    VipBundleFinalized(VipBundleFinalized) => "VipBundleFinalized_v1", internal = false;
    /// `TaxiBookingFailed_v1`
    TaxiBookingFailed(TaxiBookingFailed) => "TaxiBookingFailed_v1", internal = false;
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
