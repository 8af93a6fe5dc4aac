//! `PostgreSQL` store for the ops bookings read model.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE read_model_ops_bookings (
//!     booking_id TEXT PRIMARY KEY,
//!     payload JSONB NOT NULL
//! );
//! ```
//!
//! The whole [`OpsBooking`] is stored as one JSONB document. Ticket-level updates find their
//! document with the `?` operator on the `tickets` object.

use crate::ops_bookings::{OpsBooking, OpsBookingStore};
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use ticketflow_core::projection::{ProjectionError, Result};

/// PostgreSQL-backed [`OpsBookingStore`].
#[derive(Clone)]
pub struct PostgresOpsBookingStore {
    pool: PgPool,
}

fn storage(context: &str) -> impl FnOnce(sqlx::Error) -> ProjectionError + '_ {
    move |e| ProjectionError::Storage(format!("{context}: {e}"))
}

fn decode(payload: &serde_json::Value) -> Result<OpsBooking> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ProjectionError::Serialization(e.to_string()))
}

fn encode(booking: &OpsBooking) -> Result<serde_json::Value> {
    serde_json::to_value(booking).map_err(|e| ProjectionError::Serialization(e.to_string()))
}

impl PostgresOpsBookingStore {
    /// Create a store using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store with its own connection to a separate read database.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if connection fails.
    pub async fn new_with_separate_db(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(storage("Failed to connect"))?;

        Ok(Self::new(pool))
    }

    /// Create the read model table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the DDL fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS read_model_ops_bookings (
                booking_id TEXT PRIMARY KEY,
                payload JSONB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage("Migration failed"))?;

        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn update_where<F>(&self, query: &str, key: &str, update: F) -> Result<OpsBooking>
    where
        F: FnOnce(&mut OpsBooking) + Send,
    {
        let mut tx = self.pool.begin().await.map_err(storage("Failed to begin"))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(storage("Failed to set isolation"))?;

        let row: Option<(serde_json::Value,)> = sqlx::query_as(query)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage("Failed to load read model"))?;

        let Some((payload,)) = row else {
            return Err(ProjectionError::NotYetAvailable(format!(
                "ops booking for {key} does not exist yet"
            )));
        };

        let mut booking = decode(&payload)?;
        update(&mut booking);
        Self::write(&mut tx, &booking).await?;

        tx.commit().await.map_err(storage("Failed to commit"))?;
        Ok(booking)
    }

    async fn write(tx: &mut Transaction<'_, Postgres>, booking: &OpsBooking) -> Result<()> {
        sqlx::query("UPDATE read_model_ops_bookings SET payload = $1 WHERE booking_id = $2")
            .bind(encode(booking)?)
            .bind(&booking.booking_id)
            .execute(&mut **tx)
            .await
            .map_err(storage("Failed to update read model"))?;

        Ok(())
    }
}

impl OpsBookingStore for PostgresOpsBookingStore {
    async fn create(&self, booking: OpsBooking) -> Result<()> {
        // A ticket event may already have been retried into a later version of this document.
        sqlx::query(
            "INSERT INTO read_model_ops_bookings (booking_id, payload)
             VALUES ($1, $2)
             ON CONFLICT (booking_id) DO NOTHING",
        )
        .bind(&booking.booking_id)
        .bind(encode(&booking)?)
        .execute(&self.pool)
        .await
        .map_err(storage("Failed to create read model"))?;

        Ok(())
    }

    async fn update_by_booking_id<F>(&self, booking_id: &str, update: F) -> Result<OpsBooking>
    where
        F: FnOnce(&mut OpsBooking) + Send,
    {
        self.update_where(
            "SELECT payload FROM read_model_ops_bookings WHERE booking_id = $1 FOR UPDATE",
            booking_id,
            update,
        )
        .await
    }

    async fn update_by_ticket_id<F>(&self, ticket_id: &str, update: F) -> Result<OpsBooking>
    where
        F: FnOnce(&mut OpsBooking) + Send,
    {
        self.update_where(
            "SELECT payload FROM read_model_ops_bookings WHERE payload -> 'tickets' ? $1 FOR UPDATE",
            ticket_id,
            update,
        )
        .await
    }

    async fn get(&self, booking_id: &str) -> Result<Option<OpsBooking>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT payload FROM read_model_ops_bookings WHERE booking_id = $1")
                .bind(booking_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage("Failed to get read model"))?;

        row.map(|(payload,)| decode(&payload)).transpose()
    }

    async fn all(&self, receipt_issue_date: Option<NaiveDate>) -> Result<Vec<OpsBooking>> {
        let rows: Vec<(serde_json::Value,)> = match receipt_issue_date {
            None => {
                sqlx::query_as("SELECT payload FROM read_model_ops_bookings ORDER BY booking_id")
                    .fetch_all(&self.pool)
                    .await
            }
            Some(date) => {
                sqlx::query_as(
                    "SELECT payload FROM read_model_ops_bookings
                     WHERE booking_id IN (
                         SELECT booking_id FROM (
                             SELECT booking_id,
                                    (jsonb_path_query(payload, '$.tickets.*.receipt_issued_at') #>> '{}')
                                        ::timestamptz AT TIME ZONE 'UTC' AS issued_at
                             FROM read_model_ops_bookings
                         ) receipts
                         WHERE issued_at::date = $1
                     )
                     ORDER BY booking_id",
                )
                .bind(date)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(storage("Failed to list read models"))?;

        rows.iter().map(|(payload,)| decode(payload)).collect()
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("TRUNCATE read_model_ops_bookings")
            .execute(&self.pool)
            .await
            .map_err(storage("Failed to clear read model"))?;

        Ok(())
    }
}
