//! # Ticketflow Bundle
//!
//! The VIP bundle saga and the service that runs it.
//!
//! A VIP bundle books show tickets, an inbound and a return flight and a taxi, one after the
//! other. When a step fails, what was booked so far is compensated: confirmed tickets are
//! refunded and booked flights cancelled.
//!
//! ```text
//!  book_vip_bundle ──► VipBundleInitialized ──► BookShowTickets ──► BookingMade
//!      ──► BookFlight (inbound) ──► FlightBooked ──► BookFlight (return) ──► FlightBooked
//!      ──► BookTaxi ──► TaxiBooked ──► VipBundleFinalized
//! ```
//!
//! ## Modules
//!
//! - [`fsm`]: the transition table and its classification of redeliveries
//! - [`entity`]: the bundle aggregate and the messages it emits
//! - [`process_manager`]: event handling on top of the aggregate store
//! - [`commands`] / [`gateway`]: command handlers and the providers behind them
//! - [`service`]: router, relay and entry point wiring
//! - [`config`] / [`telemetry`]: environment configuration and tracing setup

pub mod commands;
pub mod config;
pub mod entity;
pub mod fsm;
pub mod gateway;
pub mod process_manager;
pub mod service;
pub mod telemetry;

pub use config::{Config, ConfigError};
pub use entity::{Leg, VipBundle, VipBundleError, VipBundleRequest};
pub use fsm::{BundleState, SagaError};
pub use gateway::{GatewayError, Gateways};
pub use process_manager::VipBundleProcessManager;
pub use service::{BookVipBundleError, BookedVipBundle, Service, VipBundleService};
