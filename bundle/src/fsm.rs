//! VIP bundle state machine.
//!
//! The workflow is a single table of `(state, trigger) -> (next state, effect)` rows. Anything
//! not in the table is classified by [`decide`]:
//!
//! - a trigger whose row already moved the bundle past its current state is a redelivery and is
//!   acknowledged without side effects
//! - every trigger on a terminal bundle is acknowledged without side effects
//! - everything else is an illegal transition
//!
//! ```text
//!  New ─Initialized─► AwaitingShowBooking ─BookingMade─► AwaitingInboundFlight
//!                          │ BookingFailed                  │ InboundFlightBooked
//!                          ▼                                ▼
//!                        Failed ◄──FlightBookingFailed── AwaitingReturnFlight
//!                          ▲                                │ ReturnFlightBooked
//!                          │ TaxiBookingFailed              ▼
//!                          └──────────────────────────── AwaitingTaxi ─TaxiBooked─► Finalized
//! ```
//!
//! The table is checked at compile time: it is deterministic, only moves forward and never
//! leaves a terminal state.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ticketflow_core::handler::HandlerError;
use ticketflow_core::repository::RepositoryError;

use self::BundleState as S;

/// Workflow position of a bundle.
///
/// Variants are declared in workflow order; terminal states come last.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    /// Stored, show tickets not requested yet
    #[default]
    New,
    /// `BookShowTickets` sent
    AwaitingShowBooking,
    /// Show booked, inbound `BookFlight` sent
    AwaitingInboundFlight,
    /// Inbound flight booked, return `BookFlight` sent
    AwaitingReturnFlight,
    /// Both flights booked, `BookTaxi` sent
    AwaitingTaxi,
    /// Every step succeeded
    Finalized,
    /// Compensated failure
    Failed,
}

impl BundleState {
    /// Whether the workflow is over.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }

    const fn rank(self) -> u8 {
        self as u8
    }
}

/// Inbound event, reduced to what the state machine cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// `VipBundleInitialized_v1`
    Initialized,
    /// `BookingMade_v1`
    BookingMade,
    /// `BookingFailed_v1`
    BookingFailed,
    /// `FlightBooked_v1` for the inbound flight
    InboundFlightBooked,
    /// `FlightBooked_v1` for the return flight
    ReturnFlightBooked,
    /// `FlightBookingFailed_v1` for either flight
    FlightBookingFailed,
    /// `TaxiBooked_v1`
    TaxiBooked,
    /// `TaxiBookingFailed_v1`
    TaxiBookingFailed,
}

/// Side effect of a transition, written to the outbox with the new state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Effect {
    /// Send `BookShowTickets`
    BookShowTickets,
    /// Send `BookFlight` for the inbound flight
    BookInboundFlight,
    /// Send `BookFlight` for the return flight
    BookReturnFlight,
    /// Send `BookTaxi`
    BookTaxi,
    /// Publish `VipBundleFinalized_v1`
    PublishFinalized,
    /// Refund the show tickets if any were issued; requires all tickets confirmed
    RollbackShowBooking,
    /// Refund every ticket and cancel every booked flight; requires all tickets confirmed
    Compensate,
}

/// One row of the transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// State the row applies to
    pub from: BundleState,
    /// Trigger the row applies to
    pub on: Trigger,
    /// State after the transition
    pub to: BundleState,
    /// Effect of the transition
    pub effect: Effect,
}

const fn row(from: BundleState, on: Trigger, to: BundleState, effect: Effect) -> Transition {
    Transition {
        from,
        on,
        to,
        effect,
    }
}

/// The VIP bundle workflow.
pub const TRANSITIONS: &[Transition] = &[
    row(S::New, Trigger::Initialized, S::AwaitingShowBooking, Effect::BookShowTickets),
    row(S::AwaitingShowBooking, Trigger::BookingMade, S::AwaitingInboundFlight, Effect::BookInboundFlight),
    row(S::AwaitingShowBooking, Trigger::BookingFailed, S::Failed, Effect::RollbackShowBooking),
    row(S::AwaitingInboundFlight, Trigger::InboundFlightBooked, S::AwaitingReturnFlight, Effect::BookReturnFlight),
    row(S::AwaitingInboundFlight, Trigger::FlightBookingFailed, S::Failed, Effect::Compensate),
    row(S::AwaitingReturnFlight, Trigger::ReturnFlightBooked, S::AwaitingTaxi, Effect::BookTaxi),
    row(S::AwaitingReturnFlight, Trigger::FlightBookingFailed, S::Failed, Effect::Compensate),
    row(S::AwaitingTaxi, Trigger::TaxiBooked, S::Finalized, Effect::PublishFinalized),
    row(S::AwaitingTaxi, Trigger::TaxiBookingFailed, S::Failed, Effect::Compensate),
];

const fn table_is_valid(table: &[Transition]) -> bool {
    let mut i = 0;
    while i < table.len() {
        let current = table[i];
        if current.from.is_terminal() || current.to.rank() <= current.from.rank() {
            return false;
        }
        let mut j = i + 1;
        while j < table.len() {
            let other = table[j];
            if other.from as u8 == current.from as u8 && other.on as u8 == current.on as u8 {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(table_is_valid(TRANSITIONS), "invalid VIP bundle transition table");

/// What to do with a trigger in a given state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Apply this row
    Apply(Transition),
    /// The trigger was already applied; acknowledge it
    Redelivery,
    /// The bundle is terminal; acknowledge it
    Terminal,
    /// The trigger cannot happen in this state
    Illegal,
}

/// Classify `trigger` in `state`.
#[must_use]
pub fn decide(state: BundleState, trigger: Trigger) -> Decision {
    if let Some(transition) = TRANSITIONS
        .iter()
        .find(|t| t.from == state && t.on == trigger)
    {
        return Decision::Apply(*transition);
    }

    if state.is_terminal() {
        return Decision::Terminal;
    }

    let already_applied = TRANSITIONS
        .iter()
        .any(|t| t.on == trigger && !t.to.is_terminal() && t.to.rank() <= state.rank());
    if already_applied {
        Decision::Redelivery
    } else {
        Decision::Illegal
    }
}

/// Errors raised by saga steps.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SagaError {
    /// Loading or storing the bundle failed
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Refunds need every ticket confirmation, and some are still in flight
    #[error("Bundle {vip_bundle_id} has {confirmed} of {expected} tickets confirmed")]
    IncompleteTickets {
        /// Bundle being compensated
        vip_bundle_id: String,
        /// Tickets confirmed so far
        confirmed: usize,
        /// Tickets booked
        expected: u32,
    },

    /// A ticket was confirmed after the bundle failed and settled its refunds
    #[error("Ticket {ticket_id} confirmed after bundle {vip_bundle_id} failed")]
    TicketAfterFailure {
        /// Failed bundle
        vip_bundle_id: String,
        /// Unexpected ticket
        ticket_id: String,
    },

    /// A flight event references a flight the bundle does not contain
    #[error("Flight {flight_id} is not part of bundle {vip_bundle_id}")]
    UnknownFlight {
        /// Referenced bundle
        vip_bundle_id: String,
        /// Unknown flight
        flight_id: String,
    },

    /// The trigger cannot happen in the bundle's state
    #[error("Bundle {vip_bundle_id} cannot handle {trigger:?} in state {state:?}")]
    IllegalTransition {
        /// Bundle
        vip_bundle_id: String,
        /// Current state
        state: BundleState,
        /// Refused trigger
        trigger: Trigger,
    },
}

impl From<SagaError> for HandlerError {
    fn from(err: SagaError) -> Self {
        match err {
            SagaError::Repository(err) => Self::from(err),
            SagaError::IncompleteTickets { .. } => Self::Precondition(err.to_string()),
            SagaError::TicketAfterFailure { .. }
            | SagaError::UnknownFlight { .. }
            | SagaError::IllegalTransition { .. } => {
                Self::Rejected(err.to_string())
            }
        }
    }
}
