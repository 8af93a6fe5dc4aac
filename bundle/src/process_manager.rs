//! VIP bundle process manager.
//!
//! Every inbound event is turned into a [`Trigger`] and run through the transition table in
//! [`crate::fsm`] inside one read-modify-write of the bundle. The commands and events of the
//! step are returned from the update closure, so the repository writes them to the outbox in
//! the same transaction as the new state. A step is therefore either fully applied with its
//! side effects, or not applied at all.
//!
//! # Correlation
//!
//! Show events find their bundle through the booking ID, flight and taxi events through
//! `reference_id`, which the bundle sets to its own ID on every command. Events that match no
//! bundle belong to regular bookings or other requesters and are acknowledged.
//!
//! # Idempotency keys
//!
//! | Message | Key |
//! |---|---|
//! | `BookShowTickets` | booking ID |
//! | `BookFlight` | `<bundle>-inbound-flight`, `<bundle>-return-flight` |
//! | `BookTaxi` | `<bundle>-taxi` |
//! | `RefundTicket` | `<bundle>-refund-<ticket>` |
//! | `CancelFlightTickets` | `<bundle>-cancel-inbound`, `<bundle>-cancel-return` |
//! | `VipBundleFinalized_v1` | bundle ID |

use crate::entity::{Leg, VipBundle};
use crate::fsm::{BundleState, Decision, Effect, SagaError, Transition, Trigger, decide};
use async_trait::async_trait;
use std::sync::Arc;
use ticketflow_core::bus::Outbound;
use ticketflow_core::event::{Event, EventName, FlightBooked, FlightBookingFailed, TicketBookingConfirmed};
use ticketflow_core::handler::HandlerError;
use ticketflow_core::repository::{AggregateRepository, RepositoryError};
use ticketflow_runtime::{EventHandler, Router, RouterError};

/// How an event finds its bundle.
#[derive(Clone, Copy)]
enum Key<'a> {
    /// The bundle's own event; the bundle must exist
    Own(&'a str),
    /// `reference_id` of a flight or taxi outcome
    Reference(&'a str),
    /// Booking ID of a show outcome
    Booking(&'a str),
}

impl Key<'_> {
    const fn as_str(&self) -> &str {
        match self {
            Self::Own(key) | Self::Reference(key) | Self::Booking(key) => key,
        }
    }
}

/// Apply `trigger` to `bundle`, returning the applied row and its outbound messages.
fn step<F>(
    bundle: &mut VipBundle,
    trigger: Trigger,
    record: F,
) -> Result<(Option<Transition>, Vec<Outbound>), SagaError>
where
    F: FnOnce(&mut VipBundle),
{
    let transition = match decide(bundle.state, trigger) {
        Decision::Apply(transition) => transition,
        Decision::Redelivery | Decision::Terminal => {
            tracing::debug!(
                vip_bundle_id = %bundle.vip_bundle_id,
                state = ?bundle.state,
                ?trigger,
                "Trigger already applied, acknowledging"
            );
            return Ok((None, Vec::new()));
        }
        Decision::Illegal => {
            return Err(SagaError::IllegalTransition {
                vip_bundle_id: bundle.vip_bundle_id.clone(),
                state: bundle.state,
                trigger,
            });
        }
    };

    let refunds_tickets = match transition.effect {
        Effect::Compensate => true,
        Effect::RollbackShowBooking => bundle.show_tickets_issued(),
        _ => false,
    };
    if refunds_tickets && !bundle.all_tickets_confirmed() {
        return Err(SagaError::IncompleteTickets {
            vip_bundle_id: bundle.vip_bundle_id.clone(),
            confirmed: bundle.ticket_ids.len(),
            expected: bundle.number_of_tickets,
        });
    }

    record(bundle);
    bundle.state = transition.to;

    let outbound = match transition.effect {
        Effect::BookShowTickets => vec![bundle.book_show_tickets()],
        Effect::BookInboundFlight => vec![bundle.book_flight(Leg::Inbound)],
        Effect::BookReturnFlight => vec![bundle.book_flight(Leg::Return)],
        Effect::BookTaxi => vec![bundle.book_taxi()],
        Effect::PublishFinalized => vec![bundle.finalized()],
        Effect::RollbackShowBooking if refunds_tickets => bundle.refunds(),
        Effect::RollbackShowBooking => Vec::new(),
        Effect::Compensate => {
            let mut outbound = bundle.refunds();
            outbound.extend(bundle.flight_cancellations());
            outbound
        }
    };

    Ok((Some(transition), outbound))
}

fn flight_leg(bundle: &VipBundle, flight_id: &str) -> Result<Leg, SagaError> {
    bundle.leg_of(flight_id).ok_or_else(|| SagaError::UnknownFlight {
        vip_bundle_id: bundle.vip_bundle_id.clone(),
        flight_id: flight_id.to_string(),
    })
}

/// Drives VIP bundles through their workflow.
pub struct VipBundleProcessManager<R> {
    repository: R,
}

impl<R: AggregateRepository<VipBundle>> VipBundleProcessManager<R> {
    /// Events the process manager subscribes to.
    pub const HANDLED_EVENTS: &'static [EventName] = &[
        EventName::VipBundleInitialized,
        EventName::BookingMade,
        EventName::TicketBookingConfirmed,
        EventName::BookingFailed,
        EventName::FlightBooked,
        EventName::FlightBookingFailed,
        EventName::TaxiBooked,
        EventName::TaxiBookingFailed,
    ];

    /// Create a process manager over a bundle repository.
    #[must_use]
    pub const fn new(repository: R) -> Self {
        Self { repository }
    }

    /// The bundle repository.
    #[must_use]
    pub const fn repository(&self) -> &R {
        &self.repository
    }

    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::IncompleteTickets`] when refunds must wait for ticket
    /// confirmations, [`SagaError::TicketAfterFailure`], [`SagaError::IllegalTransition`] or
    /// [`SagaError::UnknownFlight`] for events that can never apply, and repository failures.
    pub async fn handle_event(&self, event: &Event) -> Result<(), SagaError> {
        match event {
            Event::VipBundleInitialized(e) => {
                self.advance(Key::Own(&e.vip_bundle_id), |_| Ok(Trigger::Initialized), |_| {})
                    .await
            }
            Event::BookingMade(e) => {
                let made_at = e.header.published_at;
                self.advance(
                    Key::Booking(&e.booking_id),
                    |_| Ok(Trigger::BookingMade),
                    |bundle| bundle.booking_made_at = Some(made_at),
                )
                .await
            }
            Event::TicketBookingConfirmed(e) => self.on_ticket_confirmed(e).await,
            Event::BookingFailed(e) => {
                self.advance(
                    Key::Booking(&e.booking_id),
                    |_| Ok(Trigger::BookingFailed),
                    |bundle| bundle.failure_reason = Some(e.failure_reason.clone()),
                )
                .await
            }
            Event::FlightBooked(e) => self.on_flight_booked(e).await,
            Event::FlightBookingFailed(e) => self.on_flight_booking_failed(e).await,
            Event::TaxiBooked(e) => {
                let booked_at = e.header.published_at;
                self.advance(
                    Key::Reference(&e.reference_id),
                    |_| Ok(Trigger::TaxiBooked),
                    |bundle| {
                        bundle.taxi_booking_id = Some(e.taxi_booking_id.clone());
                        bundle.taxi_booked_at = Some(booked_at);
                    },
                )
                .await
            }
            Event::TaxiBookingFailed(e) => {
                self.advance(
                    Key::Reference(&e.reference_id),
                    |_| Ok(Trigger::TaxiBookingFailed),
                    |bundle| bundle.failure_reason = Some(e.failure_reason.clone()),
                )
                .await
            }
            other => {
                tracing::debug!(event_name = %other.name(), "Event not handled by the VIP bundle saga");
                Ok(())
            }
        }
    }

    async fn on_ticket_confirmed(&self, event: &TicketBookingConfirmed) -> Result<(), SagaError> {
        let result = self
            .repository
            .update_by_booking_id(&event.booking_id, |bundle| {
                let known = bundle.ticket_ids.iter().any(|id| id == &event.ticket_id);
                // Refunds of a failed bundle are settled; a new ticket there cannot be refunded.
                if bundle.failed() && !known {
                    return Err(SagaError::TicketAfterFailure {
                        vip_bundle_id: bundle.vip_bundle_id.clone(),
                        ticket_id: event.ticket_id.clone(),
                    });
                }
                if bundle.confirm_ticket(&event.ticket_id) {
                    tracing::debug!(
                        vip_bundle_id = %bundle.vip_bundle_id,
                        ticket_id = %event.ticket_id,
                        confirmed = bundle.ticket_ids.len(),
                        "Ticket confirmed"
                    );
                }
                Ok(Vec::new())
            })
            .await;

        ignore_foreign(result.map(|_| ()), Key::Booking(&event.booking_id))
    }

    async fn on_flight_booked(&self, event: &FlightBooked) -> Result<(), SagaError> {
        let booked_at = event.header.published_at;
        self.advance(
            Key::Reference(&event.reference_id),
            |bundle| {
                Ok(match flight_leg(bundle, &event.flight_id)? {
                    Leg::Inbound => Trigger::InboundFlightBooked,
                    Leg::Return => Trigger::ReturnFlightBooked,
                })
            },
            |bundle| {
                if let Some(leg) = bundle.leg_of(&event.flight_id) {
                    let flight = bundle.flight_mut(leg);
                    flight.booked_at = Some(booked_at);
                    flight.ticket_ids.clone_from(&event.ticket_ids);
                }
            },
        )
        .await
    }

    async fn on_flight_booking_failed(&self, event: &FlightBookingFailed) -> Result<(), SagaError> {
        self.advance(
            Key::Reference(&event.reference_id),
            |bundle| flight_leg(bundle, &event.flight_id).map(|_| Trigger::FlightBookingFailed),
            |bundle| bundle.failure_reason = Some(event.failure_reason.clone()),
        )
        .await
    }

    async fn advance<T, F>(&self, key: Key<'_>, resolve: T, record: F) -> Result<(), SagaError>
    where
        T: FnOnce(&VipBundle) -> Result<Trigger, SagaError> + Send,
        F: FnOnce(&mut VipBundle) + Send,
    {
        let mut applied = None;
        let update = |bundle: &mut VipBundle| {
            let trigger = resolve(bundle)?;
            let (transition, outbound) = step(bundle, trigger, record)?;
            applied = transition;
            Ok(outbound)
        };

        let result = match key {
            Key::Own(id) | Key::Reference(id) => self.repository.update_by_id(id, update).await,
            Key::Booking(booking_id) => {
                self.repository.update_by_booking_id(booking_id, update).await
            }
        };

        let bundle = match result {
            Ok(bundle) => bundle,
            Err(err) => return ignore_foreign(Err(err), key),
        };

        if let Some(transition) = applied {
            tracing::info!(
                vip_bundle_id = %bundle.vip_bundle_id,
                from = ?transition.from,
                to = ?transition.to,
                effect = ?transition.effect,
                "VIP bundle advanced"
            );
            match transition.to {
                BundleState::Finalized => metrics::counter!("vip_bundle.finalized").increment(1),
                BundleState::Failed => metrics::counter!("vip_bundle.failed").increment(1),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Events for unknown bookings or references are not ours.
fn ignore_foreign(result: Result<(), SagaError>, key: Key<'_>) -> Result<(), SagaError> {
    match result {
        Err(SagaError::Repository(RepositoryError::NotFound { .. })) if !matches!(key, Key::Own(_)) => {
            tracing::debug!(key = key.as_str(), "No VIP bundle for event, ignoring");
            Ok(())
        }
        other => other,
    }
}

#[async_trait]
impl<R> EventHandler for VipBundleProcessManager<R>
where
    R: AggregateRepository<VipBundle> + 'static,
{
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        self.handle_event(&event).await.map_err(HandlerError::from)
    }
}

/// Subscribe the process manager to every event it handles.
///
/// Routes are named `vip_bundle.<EventName>`.
///
/// # Errors
///
/// Returns [`RouterError::DuplicateHandler`] if a route name is taken.
pub fn register<R>(router: &mut Router, process_manager: Arc<VipBundleProcessManager<R>>) -> Result<(), RouterError>
where
    R: AggregateRepository<VipBundle> + 'static,
{
    for event in VipBundleProcessManager::<R>::HANDLED_EVENTS {
        router.add_event_handler(
            format!("vip_bundle.{event}"),
            *event,
            Arc::clone(&process_manager) as Arc<dyn EventHandler>,
        )?;
    }
    Ok(())
}
