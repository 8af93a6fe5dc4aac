//! VIP bundle saga tests against the in-memory store, outbox and transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;
use ticketflow_bundle::commands;
use ticketflow_bundle::gateway::{GatewayError, GatewayFuture, Gateways, MockPayments, MockTransportation, ShowBookings, Transportation};
use ticketflow_bundle::{
    BookVipBundleError, BundleState, SagaError, VipBundle, VipBundleError, VipBundleProcessManager,
    VipBundleRequest, VipBundleService, process_manager,
};
use ticketflow_core::bus::{BusConfig, decode_event};
use ticketflow_core::command::{BookFlight, BookShowTickets, BookTaxi, CancelFlightTickets, Command};
use ticketflow_core::event::{
    BookingFailed, BookingMade, Event, EventHeader, EventName, FlightBooked, FlightBookingFailed,
    Money, TaxiBooked, TaxiBookingFailed, TicketBookingConfirmed, VipBundleInitialized,
};
use ticketflow_core::handler::HandlerError;
use ticketflow_core::repository::{AggregateRepository, RepositoryError};
use ticketflow_runtime::{EventBus, OutboxRelay, RelayConfig, RetryPolicy, Router, RouterConfig};
use ticketflow_testing::{InMemoryDataLake, InMemoryOutbox, InMemoryRepository, InProcessBus, init_test_tracing};
use tokio::sync::broadcast;

const BUNDLE: &str = "bundle-1";
const BOOKING: &str = "booking-1";
const INBOUND: &str = "FL-OUT";
const RETURN: &str = "FL-BACK";

type Repository = InMemoryRepository<VipBundle>;

fn bus_config() -> BusConfig {
    BusConfig::new("svc-tickets")
}

fn request(tickets: u32) -> VipBundleRequest {
    VipBundleRequest {
        customer_email: "vip@example.com".to_string(),
        number_of_tickets: tickets,
        show_id: "show-1".to_string(),
        passengers: (1..=tickets).map(|n| format!("Passenger {n}")).collect(),
        inbound_flight_id: INBOUND.to_string(),
        return_flight_id: RETURN.to_string(),
    }
}

async fn saga(tickets: u32) -> (Repository, VipBundleProcessManager<Repository>) {
    let repository = Repository::new(bus_config());
    repository
        .add(VipBundle::new(BUNDLE, BOOKING, request(tickets)).unwrap())
        .await
        .unwrap();
    (repository.clone(), VipBundleProcessManager::new(repository))
}

async fn bundle(repository: &Repository) -> VipBundle {
    repository.get(BUNDLE).await.unwrap()
}

fn initialized() -> Event {
    Event::from(VipBundleInitialized {
        header: EventHeader::with_idempotency_key(BUNDLE),
        vip_bundle_id: BUNDLE.to_string(),
    })
}

fn booking_made(booking_id: &str) -> Event {
    Event::from(BookingMade {
        header: EventHeader::with_idempotency_key(booking_id),
        booking_id: booking_id.to_string(),
        number_of_tickets: 1,
        customer_email: "vip@example.com".to_string(),
        show_id: "show-1".to_string(),
    })
}

fn ticket_confirmed(ticket_id: &str) -> Event {
    Event::from(TicketBookingConfirmed {
        header: EventHeader::new(),
        ticket_id: ticket_id.to_string(),
        customer_email: "vip@example.com".to_string(),
        price: Money {
            amount: "120.00".to_string(),
            currency: "EUR".to_string(),
        },
        booking_id: BOOKING.to_string(),
    })
}

fn flight_booked(flight_id: &str, tickets: &[&str]) -> Event {
    Event::from(FlightBooked {
        header: EventHeader::new(),
        flight_id: flight_id.to_string(),
        ticket_ids: tickets.iter().map(ToString::to_string).collect(),
        reference_id: BUNDLE.to_string(),
    })
}

fn flight_failed(flight_id: &str) -> Event {
    Event::from(FlightBookingFailed {
        header: EventHeader::new(),
        flight_id: flight_id.to_string(),
        failure_reason: "no seats left".to_string(),
        reference_id: BUNDLE.to_string(),
    })
}

fn taxi_booked() -> Event {
    Event::from(TaxiBooked {
        header: EventHeader::new(),
        taxi_booking_id: "taxi-1".to_string(),
        reference_id: BUNDLE.to_string(),
    })
}

async fn drive(process_manager: &VipBundleProcessManager<Repository>, events: &[Event]) {
    for event in events {
        process_manager
            .handle_event(event)
            .await
            .unwrap_or_else(|err| panic!("{:?} failed: {err}", event.name()));
    }
}

fn refunded_tickets(repository: &Repository) -> Vec<String> {
    repository
        .outbox()
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            Command::RefundTicket(refund) => Some(refund.ticket_id),
            _ => None,
        })
        .collect()
}

fn cancelled_flight_tickets(repository: &Repository) -> Vec<Vec<String>> {
    repository
        .outbox()
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            Command::CancelFlightTickets(cancel) => Some(cancel.flight_ticket_ids),
            _ => None,
        })
        .collect()
}

fn count_commands(repository: &Repository, matches: impl Fn(&Command) -> bool) -> usize {
    repository.outbox().commands().iter().filter(|c| matches(c)).count()
}

fn finalized_events(repository: &Repository) -> usize {
    repository
        .outbox()
        .events()
        .iter()
        .filter(|event| event.name() == EventName::VipBundleFinalized)
        .count()
}

#[tokio::test]
async fn each_step_sends_the_next_command() {
    let (repository, process_manager) = saga(2).await;

    drive(&process_manager, &[initialized()]).await;
    let commands = repository.outbox().commands();
    let Some(Command::BookShowTickets(book)) = commands.last() else {
        panic!("expected BookShowTickets, got {commands:?}");
    };
    assert_eq!(book.booking_id, BOOKING);
    assert_eq!(book.header.idempotency_key, BOOKING);
    assert_eq!(book.number_of_tickets, 2);

    drive(&process_manager, &[booking_made(BOOKING)]).await;
    let Some(Command::BookFlight(inbound)) = repository.outbox().commands().last().cloned() else {
        panic!("expected inbound BookFlight");
    };
    assert_eq!(inbound.flight_id, INBOUND);
    assert_eq!(inbound.reference_id, BUNDLE);
    assert_eq!(inbound.passengers.len(), 2);
    assert_eq!(inbound.header.idempotency_key, "bundle-1-inbound-flight");

    drive(&process_manager, &[flight_booked(INBOUND, &["in-1", "in-2"])]).await;
    let Some(Command::BookFlight(back)) = repository.outbox().commands().last().cloned() else {
        panic!("expected return BookFlight");
    };
    assert_eq!(back.flight_id, RETURN);
    assert_eq!(back.header.idempotency_key, "bundle-1-return-flight");

    drive(&process_manager, &[flight_booked(RETURN, &["ret-1", "ret-2"])]).await;
    let Some(Command::BookTaxi(taxi)) = repository.outbox().commands().last().cloned() else {
        panic!("expected BookTaxi");
    };
    assert_eq!(taxi.number_of_passengers, 2);
    assert_eq!(taxi.customer_name, "Passenger 1");

    drive(&process_manager, &[taxi_booked()]).await;
    let stored = bundle(&repository).await;
    assert_eq!(stored.state, BundleState::Finalized);
    assert_eq!(stored.taxi_booking_id.as_deref(), Some("taxi-1"));
    assert_eq!(stored.inbound_flight.ticket_ids, vec!["in-1", "in-2"]);
    assert!(stored.return_flight.booked_at.is_some());
    assert_eq!(finalized_events(&repository), 1);
}

#[tokio::test]
async fn taxi_failure_refunds_tickets_and_cancels_both_flights() {
    let (repository, process_manager) = saga(1).await;

    drive(
        &process_manager,
        &[
            initialized(),
            booking_made(BOOKING),
            ticket_confirmed("t-1"),
            flight_booked(INBOUND, &["in-1"]),
            flight_booked(RETURN, &["ret-1"]),
            Event::from(TaxiBookingFailed {
                header: EventHeader::new(),
                failure_reason: "no taxi available".to_string(),
                reference_id: BUNDLE.to_string(),
            }),
        ],
    )
    .await;

    let stored = bundle(&repository).await;
    assert!(stored.failed());
    assert!(stored.is_finalized());
    assert_eq!(stored.failure_reason.as_deref(), Some("no taxi available"));
    assert_eq!(refunded_tickets(&repository), vec!["t-1"]);
    assert_eq!(
        cancelled_flight_tickets(&repository),
        vec![vec!["in-1".to_string()], vec!["ret-1".to_string()]]
    );
    assert_eq!(finalized_events(&repository), 0);
}

fn booking_failed() -> Event {
    Event::from(BookingFailed {
        header: EventHeader::new(),
        booking_id: BOOKING.to_string(),
        failure_reason: "show sold out".to_string(),
    })
}

#[tokio::test]
async fn show_booking_failure_without_tickets_refunds_nothing() {
    let (repository, process_manager) = saga(2).await;

    drive(&process_manager, &[initialized(), booking_failed()]).await;

    let stored = bundle(&repository).await;
    assert!(stored.failed());
    assert_eq!(stored.failure_reason.as_deref(), Some("show sold out"));
    assert!(refunded_tickets(&repository).is_empty());
    assert!(cancelled_flight_tickets(&repository).is_empty());
    assert_eq!(count_commands(&repository, |c| matches!(c, Command::BookFlight(_))), 0);

    // Nothing can refund a ticket confirmed now, so it is rejected rather than dropped.
    let err = process_manager
        .handle_event(&ticket_confirmed("t-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::TicketAfterFailure { .. }));
    assert!(matches!(HandlerError::from(err), HandlerError::Rejected(_)));
    assert!(bundle(&repository).await.ticket_ids.is_empty());
}

#[tokio::test]
async fn show_booking_failure_waits_for_every_issued_ticket() {
    let (repository, process_manager) = saga(2).await;
    drive(&process_manager, &[initialized(), ticket_confirmed("t-1")]).await;

    let err = process_manager.handle_event(&booking_failed()).await.unwrap_err();
    assert_eq!(
        err,
        SagaError::IncompleteTickets {
            vip_bundle_id: BUNDLE.to_string(),
            confirmed: 1,
            expected: 2,
        }
    );
    assert!(HandlerError::from(err).is_retryable());
    assert_eq!(bundle(&repository).await.state, BundleState::AwaitingShowBooking);
    assert!(refunded_tickets(&repository).is_empty());

    drive(&process_manager, &[ticket_confirmed("t-2"), booking_failed()]).await;

    let stored = bundle(&repository).await;
    assert!(stored.failed());
    assert_eq!(stored.ticket_ids, vec!["t-1", "t-2"]);
    assert_eq!(refunded_tickets(&repository), vec!["t-1", "t-2"]);

    // Redelivered confirmations of refunded tickets are acknowledged.
    drive(&process_manager, &[ticket_confirmed("t-2")]).await;
    assert_eq!(refunded_tickets(&repository), vec!["t-1", "t-2"]);
}

#[tokio::test]
async fn redelivered_events_have_no_second_effect() {
    let (repository, process_manager) = saga(3).await;

    drive(
        &process_manager,
        &[
            initialized(),
            initialized(),
            booking_made(BOOKING),
            ticket_confirmed("t-1"),
            ticket_confirmed("t-1"),
            ticket_confirmed("t-2"),
            booking_made(BOOKING),
            flight_booked(INBOUND, &["in-1", "in-2", "in-3"]),
            flight_booked(INBOUND, &["in-1", "in-2", "in-3"]),
        ],
    )
    .await;

    let stored = bundle(&repository).await;
    assert_eq!(stored.state, BundleState::AwaitingReturnFlight);
    assert_eq!(stored.ticket_ids, vec!["t-1", "t-2"]);
    assert_eq!(count_commands(&repository, |c| matches!(c, Command::BookShowTickets(_))), 1);
    assert_eq!(count_commands(&repository, |c| matches!(c, Command::BookFlight(_))), 2);
}

#[tokio::test]
async fn compensation_waits_for_every_ticket_confirmation() {
    let (repository, process_manager) = saga(3).await;
    drive(
        &process_manager,
        &[
            initialized(),
            booking_made(BOOKING),
            ticket_confirmed("t-1"),
            ticket_confirmed("t-2"),
        ],
    )
    .await;

    let err = process_manager
        .handle_event(&flight_failed(INBOUND))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SagaError::IncompleteTickets {
            vip_bundle_id: BUNDLE.to_string(),
            confirmed: 2,
            expected: 3,
        }
    );
    assert!(matches!(HandlerError::from(err), HandlerError::Precondition(_)));
    assert_eq!(bundle(&repository).await.state, BundleState::AwaitingInboundFlight);
    assert!(refunded_tickets(&repository).is_empty());

    // The retry after the last confirmation goes through.
    drive(&process_manager, &[ticket_confirmed("t-3"), flight_failed(INBOUND)]).await;

    assert!(bundle(&repository).await.failed());
    assert_eq!(refunded_tickets(&repository), vec!["t-1", "t-2", "t-3"]);
    assert!(cancelled_flight_tickets(&repository).is_empty());
}

#[tokio::test]
async fn finalized_bundle_ignores_replayed_outcomes() {
    let (repository, process_manager) = saga(1).await;
    let happy_path = [
        initialized(),
        booking_made(BOOKING),
        flight_booked(INBOUND, &["in-1"]),
        flight_booked(RETURN, &["ret-1"]),
        taxi_booked(),
    ];
    drive(&process_manager, &happy_path).await;
    let commands_before = repository.outbox().commands().len();

    drive(&process_manager, &happy_path).await;
    drive(&process_manager, &[flight_failed(RETURN)]).await;

    let stored = bundle(&repository).await;
    assert_eq!(stored.state, BundleState::Finalized);
    assert_eq!(finalized_events(&repository), 1);
    assert_eq!(repository.outbox().commands().len(), commands_before);

    // Late confirmations are still recorded on a finalized bundle.
    drive(&process_manager, &[ticket_confirmed("t-1")]).await;
    assert_eq!(bundle(&repository).await.ticket_ids, vec!["t-1"]);
}

#[tokio::test]
async fn events_of_other_bookings_are_acknowledged() {
    let (repository, process_manager) = saga(1).await;
    drive(&process_manager, &[initialized()]).await;
    let records = repository.outbox().records().len();

    drive(
        &process_manager,
        &[
            booking_made("regular-booking"),
            Event::from(TaxiBooked {
                header: EventHeader::new(),
                taxi_booking_id: "taxi-9".to_string(),
                reference_id: "someone-else".to_string(),
            }),
        ],
    )
    .await;

    assert_eq!(repository.outbox().records().len(), records);
    assert_eq!(bundle(&repository).await.state, BundleState::AwaitingShowBooking);
}

#[tokio::test]
async fn missing_bundle_for_its_own_initialization_is_retried() {
    let process_manager = VipBundleProcessManager::new(Repository::new(bus_config()));

    let err = process_manager.handle_event(&initialized()).await.unwrap_err();

    assert!(HandlerError::from(err).is_retryable());
}

#[tokio::test]
async fn impossible_events_are_rejected() {
    let (_repository, process_manager) = saga(1).await;
    drive(&process_manager, &[initialized(), booking_made(BOOKING)]).await;

    let err = process_manager
        .handle_event(&flight_booked(RETURN, &["ret-1"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::IllegalTransition { .. }));

    let err = process_manager
        .handle_event(&flight_booked("FL-UNKNOWN", &["x-1"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::UnknownFlight { .. }));
    assert!(!HandlerError::from(err).is_retryable());
}

#[tokio::test]
async fn bundles_cannot_share_a_booking_id() {
    let (repository, _process_manager) = saga(1).await;

    let err = repository
        .add(VipBundle::new("bundle-2", BOOKING, request(1)).unwrap())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        RepositoryError::DuplicateBookingId {
            booking_id: BOOKING.to_string(),
        }
    );
    assert!(!HandlerError::from(err).is_retryable());
    assert!(repository.get("bundle-2").await.is_err());
    assert_eq!(repository.outbox().records().len(), 1);
}

#[tokio::test]
async fn invalid_requests_are_not_stored() {
    let repository = Repository::new(bus_config());
    let service = VipBundleService::new(repository.clone());

    let mut invalid = request(2);
    invalid.passengers.pop();
    let err = service.book_vip_bundle(invalid).await.unwrap_err();

    assert_eq!(
        err,
        BookVipBundleError::Invalid(VipBundleError::PassengerMismatch {
            tickets: 2,
            passengers: 1,
        })
    );
    assert!(repository.is_empty());
    assert!(repository.outbox().records().is_empty());
}

/// Seat store that books every request and confirms one ticket per seat.
struct ConfirmingShowBookings {
    events: EventBus,
}

impl ConfirmingShowBookings {
    async fn publish(&self, event: Event) -> Result<(), GatewayError> {
        self.events
            .publish(event)
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))
    }
}

impl ShowBookings for ConfirmingShowBookings {
    fn book_show_tickets<'a>(&'a self, command: &'a BookShowTickets) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            self.publish(Event::from(BookingMade {
                header: EventHeader::with_idempotency_key(&command.booking_id),
                booking_id: command.booking_id.clone(),
                number_of_tickets: command.number_of_tickets,
                customer_email: command.customer_email.clone(),
                show_id: command.show_id.clone(),
            }))
            .await?;

            for seat in 1..=command.number_of_tickets {
                self.publish(Event::from(TicketBookingConfirmed {
                    header: EventHeader::new(),
                    ticket_id: format!("{}-ticket-{seat}", command.booking_id),
                    customer_email: command.customer_email.clone(),
                    price: Money {
                        amount: "120.00".to_string(),
                        currency: "EUR".to_string(),
                    },
                    booking_id: command.booking_id.clone(),
                }))
                .await?;
            }
            Ok(())
        })
    }
}

/// Flights always succeed, taxis are never available.
struct NoTaxis(MockTransportation);

impl Transportation for NoTaxis {
    fn book_flight<'a>(&'a self, command: &'a BookFlight) -> GatewayFuture<'a, Vec<String>> {
        self.0.book_flight(command)
    }

    fn book_taxi<'a>(&'a self, _command: &'a BookTaxi) -> GatewayFuture<'a, String> {
        Box::pin(async { Err(GatewayError::Conflict("no taxi available".to_string())) })
    }

    fn cancel_flight_tickets<'a>(&'a self, command: &'a CancelFlightTickets) -> GatewayFuture<'a, ()> {
        self.0.cancel_flight_tickets(command)
    }
}

struct Harness {
    repository: Repository,
    transport: InProcessBus,
    shutdown: broadcast::Sender<()>,
}

async fn start(gateways: Gateways) -> Harness {
    init_test_tracing();
    let bus = bus_config();
    let outbox = InMemoryOutbox::new();
    let repository = Repository::with_outbox(bus.clone(), outbox.clone());
    let transport = InProcessBus::recording();
    let events = EventBus::new(Arc::new(transport.clone()), bus.clone());

    let mut router = Router::new(
        bus,
        Arc::new(transport.clone()),
        Arc::new(transport.clone()),
        RouterConfig {
            retry: RetryPolicy::builder()
                .max_retries(20)
                .initial_delay(Duration::from_millis(5))
                .max_delay(Duration::from_millis(20))
                .build(),
            ..RouterConfig::default()
        },
    );
    process_manager::register(
        &mut router,
        Arc::new(VipBundleProcessManager::new(repository.clone())),
    )
    .unwrap();
    router
        .add_event_plumbing(Arc::new(InMemoryDataLake::new()))
        .unwrap();
    commands::register(
        &mut router,
        &events,
        Arc::new(ConfirmingShowBookings {
            events: events.clone(),
        }),
        Some(&gateways),
    )
    .unwrap();

    let (shutdown, _) = broadcast::channel(1);
    let _running = router.start(shutdown.subscribe()).await.unwrap();
    let _relay = OutboxRelay::new(
        Arc::new(outbox),
        Arc::new(transport.clone()),
        RelayConfig {
            relay_name: "saga-tests".to_string(),
            poll_interval: Duration::from_millis(5),
            batch_size: 50,
            backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(5))
                .build(),
        },
    )
    .spawn(shutdown.subscribe());

    Harness {
        repository,
        transport,
        shutdown,
    }
}

async fn wait_for(repository: &Repository, id: &str, done: impl Fn(&VipBundle) -> bool) -> VipBundle {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = repository.get(id).await.unwrap();
            if done(&current) {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bundle did not reach the expected state")
}

#[tokio::test]
async fn bundle_is_finalized_end_to_end() {
    let harness = start(Gateways::mock()).await;
    let service = VipBundleService::new(harness.repository.clone());

    let booked = service.book_vip_bundle(request(1)).await.unwrap();
    let finalized = wait_for(&harness.repository, &booked.vip_bundle_id, |b| {
        b.state == BundleState::Finalized && b.all_tickets_confirmed()
    })
    .await;

    assert!(finalized.taxi_booking_id.is_some());
    assert_eq!(finalized.ticket_ids, vec![format!("{}-ticket-1", booked.booking_id)]);
    assert_eq!(finalized.inbound_flight.ticket_ids.len(), 1);

    let bus = bus_config();
    let announced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let finalized: Vec<Event> = harness
                .transport
                .published(bus.events_topic())
                .iter()
                .map(|message| decode_event(message).unwrap())
                .filter(|event| event.name() == EventName::VipBundleFinalized)
                .collect();
            if !finalized.is_empty() {
                return finalized;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(announced.len(), 1);

    harness.shutdown.send(()).unwrap();
}

#[tokio::test]
async fn unavailable_taxi_compensates_end_to_end() {
    let harness = start(Gateways {
        transportation: Arc::new(NoTaxis(MockTransportation::new())),
        payments: Arc::new(MockPayments),
        receipts: Arc::new(MockPayments),
    })
    .await;
    let service = VipBundleService::new(harness.repository.clone());

    let booked = service.book_vip_bundle(request(2)).await.unwrap();
    let failed = wait_for(&harness.repository, &booked.vip_bundle_id, VipBundle::failed).await;

    assert_eq!(failed.failure_reason.as_deref(), Some("no taxi available"));
    assert_eq!(refunded_tickets(&harness.repository).len(), 2);
    assert_eq!(cancelled_flight_tickets(&harness.repository).len(), 2);

    let refunded = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let count = harness
                .transport
                .published(bus_config().events_topic())
                .iter()
                .filter(|message| decode_event(message).unwrap().name() == EventName::TicketRefunded)
                .count();
            if count == 2 {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(refunded, 2);

    harness.shutdown.send(()).unwrap();
}
