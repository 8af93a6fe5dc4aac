//! Database schema for the ticket service.
//!
//! Every statement is idempotent, so [`initialize_schema`] runs on each start.

use sqlx::PgPool;
use thiserror::Error;

/// Schema creation failed.
#[derive(Error, Debug)]
#[error("Could not initialize database schema: {0}")]
pub struct SchemaError(#[from] sqlx::Error);

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS vip_bundles (
        vip_bundle_id TEXT PRIMARY KEY,
        booking_id TEXT NOT NULL UNIQUE,
        payload JSONB NOT NULL
    )
    ",
    r#"
    CREATE TABLE IF NOT EXISTS outbox_messages (
        "offset" BIGSERIAL,
        transaction_id XID8 NOT NULL DEFAULT pg_current_xact_id(),
        uuid TEXT NOT NULL,
        topic TEXT NOT NULL,
        payload BYTEA NOT NULL,
        metadata JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (transaction_id, "offset")
    )
    "#,
    r"
    CREATE TABLE IF NOT EXISTS outbox_offsets (
        consumer_group TEXT PRIMARY KEY,
        last_transaction_id BIGINT NOT NULL,
        last_offset BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS events (
        event_id TEXT PRIMARY KEY,
        published_at TIMESTAMPTZ NOT NULL,
        event_name TEXT NOT NULL,
        event_payload JSONB NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_events_published_at ON events(published_at)",
    r"
    CREATE TABLE IF NOT EXISTS poisoned_messages (
        id BIGSERIAL PRIMARY KEY,
        message_id TEXT NOT NULL,
        original_topic TEXT NOT NULL,
        handler TEXT NOT NULL,
        reason TEXT NOT NULL,
        payload BYTEA NOT NULL,
        metadata JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        poisoned_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        resolved_at TIMESTAMPTZ,
        UNIQUE (message_id, handler)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_poisoned_messages_status ON poisoned_messages(status, poisoned_at)",
    r"
    CREATE TABLE IF NOT EXISTS shows (
        show_id TEXT PRIMARY KEY,
        number_of_tickets BIGINT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS bookings (
        booking_id TEXT PRIMARY KEY,
        show_id TEXT NOT NULL REFERENCES shows(show_id) ON DELETE CASCADE,
        customer_email TEXT NOT NULL,
        number_of_tickets BIGINT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS read_model_ops_bookings (
        booking_id TEXT PRIMARY KEY,
        payload JSONB NOT NULL
    )
    ",
];

/// Create every table the service uses.
///
/// # Errors
///
/// Returns [`SchemaError`] if a statement fails.
pub async fn initialize_schema(pool: &PgPool) -> Result<(), SchemaError> {
    let mut conn = pool.acquire().await?;
    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *conn).await?;
    }

    tracing::info!(statements = STATEMENTS.len(), "Database schema initialized");
    Ok(())
}
