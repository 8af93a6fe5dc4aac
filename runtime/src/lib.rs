//! # Ticketflow Runtime
//!
//! Message-driven runtime for the ticket service.
//!
//! ## Core Components
//!
//! - **Router**: subscribes handlers to topics, one consumer group per handler, and drains
//!   in-flight work on shutdown
//! - **Middleware**: panic recovery, bounded retry with backoff, poison queue
//! - **Outbox relay**: forwards committed outbox records to the transport at-least-once
//! - **Forwarders**: split the shared `events` topic per type and capture it to the data lake
//! - **`EventBus` / `CommandBus`**: typed publishing for messages outside a transaction
//! - **`InProcessBus`**: channel-backed transport for single-process deployments and tests
//!
//! ## Example
//!
//! ```ignore
//! use ticketflow_runtime::{Router, RouterConfig};
//!
//! let mut router = Router::new(bus_config, subscriber, publisher, RouterConfig::default());
//! router.add_event_handler("vip_bundle.on_booking_made", EventName::BookingMade, handler)?;
//!
//! let running = router.start(shutdown_tx.subscribe()).await?;
//! ```

pub mod bus;
pub mod forwarders;
pub mod handler;
pub mod in_process;
mod middleware;
pub mod relay;
pub mod retry;
pub mod router;

pub use bus::{CommandBus, EventBus};
pub use handler::{CommandHandler, EventHandler, MessageHandler, ProjectionHandler};
pub use in_process::InProcessBus;
pub use relay::{OutboxRelay, RelayConfig, RelayError};
pub use retry::RetryPolicy;
pub use router::{Router, RouterConfig, RouterError, RunningRouter};
