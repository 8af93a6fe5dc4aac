//! Command contracts.
//!
//! Commands are requests addressed to exactly one handler. Like events they form a closed set
//! ([`Command`]) resolved through [`CommandName`], and each one is routed to its own topic
//! (`commands.<Name>`).

use crate::event::{EventError, EventHeader};
use serde::{Deserialize, Serialize};

/// Book seats for a show.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookShowTickets {
    /// Message header
    pub header: EventHeader,
    /// Booking ID chosen by the requester (doubles as the idempotency key)
    pub booking_id: String,
    /// Customer booking the seats
    pub customer_email: String,
    /// Number of seats
    pub number_of_tickets: u32,
    /// Show to book
    pub show_id: String,
}

/// Book flight tickets for a list of passengers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookFlight {
    /// Message header
    pub header: EventHeader,
    /// Contact of the customer
    pub customer_email: String,
    /// Flight to book
    pub flight_id: String,
    /// Passenger names
    pub passengers: Vec<String>,
    /// Correlation ID echoed back in the outcome event
    pub reference_id: String,
}

/// Book a taxi.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookTaxi {
    /// Message header
    pub header: EventHeader,
    /// Contact of the customer
    pub customer_email: String,
    /// Name the driver asks for
    pub customer_name: String,
    /// Seats needed
    pub number_of_passengers: u32,
    /// Correlation ID echoed back in the outcome event
    pub reference_id: String,
}

/// Cancel previously issued flight tickets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelFlightTickets {
    /// Message header
    pub header: EventHeader,
    /// Tickets to cancel
    pub flight_ticket_ids: Vec<String>,
}

/// Refund a show ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundTicket {
    /// Message header
    pub header: EventHeader,
    /// Ticket to refund
    pub ticket_id: String,
}

macro_rules! closed_command_set {
    ($( $(#[$doc:meta])* $variant:ident => $name:literal; )+) => {
        /// Discriminant of every command in the closed set.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum CommandName {
            $( $(#[$doc])* $variant, )+
        }

        impl CommandName {
            /// Every known command name.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)+];

            /// Wire name.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
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

        /// Every command this service sends or handles.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum Command {
            $( $(#[$doc])* $variant($variant), )+
        }

        impl Command {
            /// Discriminant of this command.
            #[must_use]
            pub const fn name(&self) -> CommandName {
                match self {
                    $(Self::$variant(_) => CommandName::$variant,)+
                }
            }

            /// Header of this command.
            #[must_use]
            pub const fn header(&self) -> &EventHeader {
                match self {
                    $(Self::$variant(command) => &command.header,)+
                }
            }

            /// Encode the payload as JSON.
            ///
            /// # Errors
            ///
            /// Returns [`EventError::Serialization`] if JSON encoding fails.
            pub fn to_payload(&self) -> Result<Vec<u8>, EventError> {
                match self {
                    $(Self::$variant(command) => serde_json::to_vec(command),)+
                }
                .map_err(|e| EventError::Serialization(e.to_string()))
            }

            /// Decode a JSON payload known to carry `name`.
            ///
            /// # Errors
            ///
            /// Returns [`EventError::Deserialization`] if the payload does not match the schema.
            pub fn from_payload(name: CommandName, payload: &[u8]) -> Result<Self, EventError> {
                match name {
                    $(CommandName::$variant => serde_json::from_slice(payload).map(Self::$variant),)+
                }
                .map_err(|e| EventError::Deserialization {
                    name: name.as_str(),
                    reason: e.to_string(),
                })
            }
        }

        $(
            impl From<$variant> for Command {
                fn from(command: $variant) -> Self {
                    Self::$variant(command)
                }
            }
        )+
    };
}

closed_command_set! {
    /// `BookShowTickets`
    BookShowTickets => "BookShowTickets";
    /// `BookFlight`
    BookFlight => "BookFlight";
    /// `BookTaxi`
    BookTaxi => "BookTaxi";
    /// `CancelFlightTickets`
    CancelFlightTickets => "CancelFlightTickets";
    /// `RefundTicket`
    RefundTicket => "RefundTicket";
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn command_names_parse_back() {
        for name in CommandName::ALL {
            assert_eq!(CommandName::parse(name.as_str()).unwrap(), *name);
        }
        assert!(CommandName::parse("BookHotel").is_err());
    }

    #[test]
    fn refund_keeps_idempotency_key() {
        let command = Command::from(RefundTicket {
            header: EventHeader::with_idempotency_key("bundle-1-refund-t-1"),
            ticket_id: "t-1".to_string(),
        });
        let decoded =
            Command::from_payload(CommandName::RefundTicket, &command.to_payload().unwrap()).unwrap();
        assert_eq!(decoded.header().idempotency_key, "bundle-1-refund-t-1");
        assert_eq!(decoded, command);
    }
}
