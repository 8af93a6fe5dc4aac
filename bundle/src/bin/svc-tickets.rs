//! Ticket service
//!
//! Runs the VIP bundle saga, its command handlers, the ops read model and the outbox relay
//! against `PostgreSQL`.
//!
//! # Usage
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/tickets cargo run --bin svc-tickets
//! ```

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use ticketflow_bundle::{Config, Gateways, Service, telemetry};
use ticketflow_postgres::initialize_schema;
use ticketflow_projections::PostgresOpsBookingStore;
use ticketflow_runtime::InProcessBus;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    telemetry::init()?;

    let config = Config::from_env()?;
    tracing::info!(
        service = %config.service_name,
        max_connections = config.database.max_connections,
        "Configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("connecting to PostgreSQL")?;
    initialize_schema(&pool).await?;
    PostgresOpsBookingStore::new(pool.clone()).migrate().await?;

    let transport = Arc::new(InProcessBus::new());
    let service = Service::new(
        &config,
        pool,
        transport.clone(),
        transport,
        Some(Gateways::mock()),
    )?;

    let (shutdown, _) = broadcast::channel(1);
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = signal.send(());
    });

    service.run(shutdown).await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable, waiting for Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
