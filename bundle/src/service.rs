//! Service assembly.
//!
//! [`Service`] wires every handler of the ticket service onto one router and owns the outbox
//! relay. [`VipBundleService`] is the entry point that starts a bundle.

use crate::commands;
use crate::config::Config;
use crate::entity::{VipBundle, VipBundleError, VipBundleRequest};
use crate::gateway::Gateways;
use crate::process_manager::{self, VipBundleProcessManager};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use ticketflow_core::bus::{Publisher, Subscriber};
use ticketflow_core::repository::{AggregateRepository, RepositoryError};
use ticketflow_postgres::{
    AggregateTable, PoisonQueue, PoisonQueueWriter, PostgresAggregateRepository, PostgresDataLake,
    PostgresOutbox, PostgresShowBookings,
};
use ticketflow_projections::{OpsBookingsProjection, PostgresOpsBookingStore};
use ticketflow_runtime::{EventBus, OutboxRelay, Router, RouterError};
use tokio::sync::broadcast;

/// Route name of the poison queue writer.
pub const POISON_QUEUE_HANDLER: &str = "poison_queue_store";

/// The assembled ticket service.
pub struct Service {
    router: Router,
    relay: OutboxRelay,
}

impl Service {
    /// Wire every route and the outbox relay.
    ///
    /// The show booking handler is always registered. Flight, taxi, refund and cancellation
    /// handlers need `gateways`; without them those commands are left to other services.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateHandler`] if two routes share a name.
    pub fn new(
        config: &Config,
        pool: PgPool,
        subscriber: Arc<dyn Subscriber>,
        publisher: Arc<dyn Publisher>,
        gateways: Option<Gateways>,
    ) -> Result<Self, RouterError> {
        let bus = config.bus_config();
        let events = EventBus::new(Arc::clone(&publisher), bus.clone());

        let mut router = Router::new(
            bus.clone(),
            subscriber,
            Arc::clone(&publisher),
            config.router_config(),
        );

        let bundles = PostgresAggregateRepository::<VipBundle>::new(
            pool.clone(),
            bus.clone(),
            AggregateTable::VIP_BUNDLES,
        );
        process_manager::register(&mut router, Arc::new(VipBundleProcessManager::new(bundles)))?;

        let projection = OpsBookingsProjection::new(PostgresOpsBookingStore::new(pool.clone()))
            .with_notifications(events.clone());
        router.add_projection(Arc::new(projection))?;

        router.add_event_plumbing(Arc::new(PostgresDataLake::new(pool.clone())))?;

        let poison_topic = bus.poison_topic().to_string();
        router.add_handler(
            POISON_QUEUE_HANDLER,
            poison_topic,
            Arc::new(PoisonQueueWriter::new(PoisonQueue::new(pool.clone()))),
        )?;

        commands::register(
            &mut router,
            &events,
            Arc::new(PostgresShowBookings::new(pool.clone(), bus)),
            gateways.as_ref(),
        )?;

        let relay = OutboxRelay::new(
            Arc::new(PostgresOutbox::new(pool)),
            publisher,
            config.relay_config(),
        );

        Ok(Self { router, relay })
    }

    /// Run until `shutdown` fires, then drain in-flight work.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Subscription`] if a route cannot subscribe.
    pub async fn run(self, shutdown: broadcast::Sender<()>) -> Result<(), RouterError> {
        let mut stop = shutdown.subscribe();
        let running = self.router.start(shutdown.subscribe()).await?;
        let relay = self.relay.spawn(shutdown.subscribe());
        tracing::info!("Ticket service started");

        let _ = stop.recv().await;
        tracing::info!("Shutting down");

        running.wait().await;
        if let Err(err) = relay.await {
            tracing::error!(error = %err, "Outbox relay task failed");
        }
        tracing::info!("Ticket service stopped");
        Ok(())
    }
}

/// Errors raised when starting a bundle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookVipBundleError {
    /// The request is invalid
    #[error(transparent)]
    Invalid(#[from] VipBundleError),

    /// The bundle could not be stored
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// IDs of a started bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookedVipBundle {
    /// Bundle ID, also the `reference_id` of its flight and taxi commands
    pub vip_bundle_id: String,
    /// Booking ID of its show tickets
    pub booking_id: String,
}

/// Starts VIP bundles.
pub struct VipBundleService<R> {
    repository: R,
}

impl<R: AggregateRepository<VipBundle>> VipBundleService<R> {
    /// Create the service over a bundle repository.
    #[must_use]
    pub const fn new(repository: R) -> Self {
        Self { repository }
    }

    /// Validate and store a new bundle.
    ///
    /// The bundle and its `VipBundleInitialized_v1` event are written in one transaction; the
    /// process manager takes it from there.
    ///
    /// # Errors
    ///
    /// Returns [`BookVipBundleError::Invalid`] for an invalid request and
    /// [`BookVipBundleError::Repository`] if storing fails.
    pub async fn book_vip_bundle(
        &self,
        request: VipBundleRequest,
    ) -> Result<BookedVipBundle, BookVipBundleError> {
        let bundle = VipBundle::new(
            uuid::Uuid::new_v4().to_string(),
            uuid::Uuid::new_v4().to_string(),
            request,
        )?;
        let booked = BookedVipBundle {
            vip_bundle_id: bundle.vip_bundle_id.clone(),
            booking_id: bundle.booking_id.clone(),
        };

        self.repository.add(bundle).await?;
        metrics::counter!("vip_bundle.started").increment(1);
        tracing::info!(
            vip_bundle_id = %booked.vip_bundle_id,
            booking_id = %booked.booking_id,
            "VIP bundle started"
        );
        Ok(booked)
    }
}
