//! Message router: subscriptions, dispatch, middleware and graceful shutdown.
//!
//! # Overview
//!
//! The router owns one route per registered handler. Each route has a unique handler name,
//! which is also its consumer group, so every handler receives its own copy of every message
//! on its topic.
//!
//! ```text
//!            ┌─────────────┐
//!  topic ──► │ route loop  │──► spawn ──► Middleware::process ──► handler
//!            └─────────────┘     (bounded by max_in_flight)
//! ```
//!
//! Messages for different aggregates are handled concurrently. Nothing serializes messages
//! for the same aggregate; that is the aggregate store's job.
//!
//! # Shutdown
//!
//! On the shutdown signal each route stops pulling new messages and waits for its in-flight
//! handlers. [`RunningRouter::wait`] bounds the drain with the configured timeout.
//!
//! # Example
//!
//! ```ignore
//! let mut router = Router::new(bus_config, subscriber, publisher, RouterConfig::default());
//! router.add_event_handler("vip_bundle.on_booking_made", EventName::BookingMade, handler)?;
//! router.add_projection(Arc::new(projection))?;
//!
//! let running = router.start(shutdown_tx.subscribe()).await?;
//! // ...
//! shutdown_tx.send(())?;
//! running.wait().await;
//! ```

use crate::forwarders::{DataLakeWriter, EventsSplitter};
use crate::handler::{
    CommandDispatch, CommandHandler, EventDispatch, EventHandler, MessageHandler,
    ProjectionHandler,
};
use crate::middleware::Middleware;
use crate::retry::RetryPolicy;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticketflow_core::bus::{BusConfig, BusError, MessageStream, Publisher, Subscriber};
use ticketflow_core::command::CommandName;
use ticketflow_core::data_lake::DataLake;
use ticketflow_core::event::EventName;
use ticketflow_core::projection::Projection;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::{JoinHandle, JoinSet};

/// Errors raised while assembling or starting a router.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Two routes were registered under the same handler name
    #[error("Duplicate handler name: {0}")]
    DuplicateHandler(String),

    /// Subscribing a route failed
    #[error(transparent)]
    Subscription(#[from] BusError),
}

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Backoff applied to every handler invocation
    pub retry: RetryPolicy,
    /// Maximum number of messages handled at the same time per route
    pub max_in_flight: usize,
    /// How long [`RunningRouter::wait`] waits for in-flight handlers
    pub shutdown_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_in_flight: 32,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

struct Route {
    handler_name: String,
    topic: String,
    handler: Arc<dyn MessageHandler>,
}

/// Routes messages from topics to handlers.
pub struct Router {
    bus: BusConfig,
    subscriber: Arc<dyn Subscriber>,
    publisher: Arc<dyn Publisher>,
    config: RouterConfig,
    routes: Vec<Route>,
    names: HashSet<String>,
}

impl Router {
    /// Create a router with no routes.
    ///
    /// `publisher` is used for the poison topic and by the built-in forwarders.
    #[must_use]
    pub fn new(
        bus: BusConfig,
        subscriber: Arc<dyn Subscriber>,
        publisher: Arc<dyn Publisher>,
        config: RouterConfig,
    ) -> Self {
        Self {
            bus,
            subscriber,
            publisher,
            config,
            routes: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Bus configuration used by this router.
    #[must_use]
    pub const fn bus_config(&self) -> &BusConfig {
        &self.bus
    }

    /// Register a raw message handler on a topic.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateHandler`] if the name is taken.
    pub fn add_handler(
        &mut self,
        handler_name: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<&mut Self, RouterError> {
        let handler_name = handler_name.into();
        if !self.names.insert(handler_name.clone()) {
            return Err(RouterError::DuplicateHandler(handler_name));
        }

        self.routes.push(Route {
            handler_name,
            topic: topic.into(),
            handler,
        });
        Ok(self)
    }

    /// Register a handler for one event.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateHandler`] if the name is taken.
    pub fn add_event_handler(
        &mut self,
        handler_name: impl Into<String>,
        event: EventName,
        handler: Arc<dyn EventHandler>,
    ) -> Result<&mut Self, RouterError> {
        let topic = self.bus.subscription_topic(event);
        self.add_handler(
            handler_name,
            topic,
            Arc::new(EventDispatch {
                expected: event,
                handler,
            }),
        )
    }

    /// Register the handler of one command.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateHandler`] if the name is taken.
    pub fn add_command_handler(
        &mut self,
        handler_name: impl Into<String>,
        command: CommandName,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<&mut Self, RouterError> {
        let topic = self.bus.command_topic(command);
        self.add_handler(
            handler_name,
            topic,
            Arc::new(CommandDispatch {
                expected: command,
                handler,
            }),
        )
    }

    /// Register a projection for every event it handles.
    ///
    /// Routes are named `<projection>.<EventName>`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateHandler`] if a route name is taken.
    pub fn add_projection<P>(&mut self, projection: Arc<P>) -> Result<&mut Self, RouterError>
    where
        P: Projection + 'static,
    {
        let handler: Arc<dyn EventHandler> = Arc::new(ProjectionHandler::new(Arc::clone(&projection)));
        for event in projection.handled_events() {
            self.add_event_handler(
                format!("{}.{event}", projection.name()),
                *event,
                Arc::clone(&handler),
            )?;
        }
        Ok(self)
    }

    /// Register the shared-topic plumbing: the events splitter and the data lake writer.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateHandler`] if called twice.
    pub fn add_event_plumbing(&mut self, data_lake: Arc<dyn DataLake>) -> Result<&mut Self, RouterError> {
        let events_topic = self.bus.events_topic().to_string();
        let splitter = Arc::new(EventsSplitter::new(Arc::clone(&self.publisher), self.bus.clone()));
        self.add_handler("events_splitter", events_topic.clone(), splitter)?;
        self.add_handler("store_to_data_lake", events_topic, Arc::new(DataLakeWriter::new(data_lake)))
    }

    /// Subscribe every route and start consuming.
    ///
    /// Returns once all subscriptions exist, so messages published afterwards are not missed.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Subscription`] if any subscription fails.
    pub async fn start(self, shutdown: broadcast::Receiver<()>) -> Result<RunningRouter, RouterError> {
        let middleware = Arc::new(Middleware {
            retry: self.config.retry.clone(),
            publisher: Arc::clone(&self.publisher),
            poison_topic: self.bus.poison_topic().to_string(),
        });

        let mut subscribed = Vec::with_capacity(self.routes.len());
        for route in self.routes {
            let group = self.bus.consumer_group(&route.handler_name);
            let stream = self.subscriber.subscribe(&group, &route.topic).await?;
            tracing::info!(handler = %route.handler_name, topic = %route.topic, "Route subscribed");
            subscribed.push((Arc::new(route), stream));
        }

        let handles = subscribed
            .into_iter()
            .map(|(route, stream)| {
                tokio::spawn(consume(
                    route,
                    stream,
                    Arc::clone(&middleware),
                    self.config.max_in_flight.max(1),
                    shutdown.resubscribe(),
                ))
            })
            .collect();

        Ok(RunningRouter {
            handles,
            shutdown_timeout: self.config.shutdown_timeout,
        })
    }
}

async fn consume(
    route: Arc<Route>,
    mut stream: MessageStream,
    middleware: Arc<Middleware>,
    max_in_flight: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(handler = %route.handler_name, "Shutdown signal received, draining");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(message)) => {
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    let route = Arc::clone(&route);
                    let middleware = Arc::clone(&middleware);
                    in_flight.spawn(async move {
                        middleware
                            .process(&route.handler_name, &route.topic, &route.handler, message)
                            .await;
                        drop(permit);
                    });
                }
                Some(Err(err)) => {
                    tracing::warn!(handler = %route.handler_name, error = %err, "Subscription error");
                }
                None => {
                    tracing::info!(handler = %route.handler_name, "Subscription closed");
                    break;
                }
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(handler = %route.handler_name, error = %err, "Handler task failed");
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            tracing::error!(handler = %route.handler_name, error = %err, "Handler task failed");
        }
    }
}

/// Handle to a started router.
pub struct RunningRouter {
    handles: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl RunningRouter {
    /// Wait for every route to drain, aborting the ones still busy after the timeout.
    pub async fn wait(self) {
        let aborts: Vec<_> = self.handles.iter().map(JoinHandle::abort_handle).collect();

        let drained = tokio::time::timeout(
            self.shutdown_timeout,
            futures::future::join_all(self.handles),
        )
        .await;

        if drained.is_err() {
            tracing::warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Routes did not drain in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }
}
