//! `PostgreSQL` implementation of [`AggregateRepository`].
//!
//! Each aggregate is one JSONB document in a table keyed by its ID, with a unique booking ID
//! column for the secondary lookup:
//!
//! ```sql
//! CREATE TABLE vip_bundles (
//!     vip_bundle_id TEXT PRIMARY KEY,
//!     booking_id TEXT NOT NULL UNIQUE,
//!     payload JSONB NOT NULL
//! );
//! ```
//!
//! Updates run at `SERIALIZABLE` isolation and write the step's outbound messages through
//! [`publish_in_tx`] before committing, so a state change and the messages it causes are
//! visible together or not at all.

use crate::outbox::publish_in_tx;
use sqlx::{PgPool, Postgres, Transaction};
use std::marker::PhantomData;
use ticketflow_core::bus::{BusConfig, Outbound};
use ticketflow_core::outbox::OutboxError;
use ticketflow_core::repository::{Aggregate, AggregateRepository, RepositoryError};

/// SQLSTATE for `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for `deadlock_detected`.
const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

/// Table layout of an aggregate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AggregateTable {
    /// Table name
    pub name: &'static str,
    /// Primary key column
    pub id_column: &'static str,
    /// Unique booking ID column
    pub booking_id_column: &'static str,
}

impl AggregateTable {
    /// The `vip_bundles` table.
    pub const VIP_BUNDLES: Self = Self {
        name: "vip_bundles",
        id_column: "vip_bundle_id",
        booking_id_column: "booking_id",
    };
}

fn database(e: sqlx::Error) -> RepositoryError {
    let code = e
        .as_database_error()
        .and_then(|db| db.code().map(|code| code.into_owned()));

    match code.as_deref() {
        Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => RepositoryError::Conflict(e.to_string()),
        _ => RepositoryError::Database(e.to_string()),
    }
}

fn outbox(e: OutboxError) -> RepositoryError {
    match e {
        OutboxError::Envelope(err) => RepositoryError::Serialization(err.to_string()),
        other => RepositoryError::Database(other.to_string()),
    }
}

/// Aggregate repository backed by one `PostgreSQL` table.
pub struct PostgresAggregateRepository<A> {
    pool: PgPool,
    bus: BusConfig,
    table: AggregateTable,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for PostgresAggregateRepository<A> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            bus: self.bus.clone(),
            table: self.table,
            _aggregate: PhantomData,
        }
    }
}

impl<A: Aggregate> PostgresAggregateRepository<A> {
    /// Create a repository over `table`, routing outbox messages with `bus`.
    #[must_use]
    pub const fn new(pool: PgPool, bus: BusConfig, table: AggregateTable) -> Self {
        Self {
            pool,
            bus,
            table,
            _aggregate: PhantomData,
        }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn select_by(&self, column: &str, lock: bool) -> String {
        format!(
            "SELECT payload FROM {} WHERE {column} = $1{}",
            self.table.name,
            if lock { " FOR UPDATE" } else { "" }
        )
    }

    async fn begin(&self, isolation: &str) -> Result<Transaction<'static, Postgres>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(database)?;
        sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {isolation}"))
            .execute(&mut *tx)
            .await
            .map_err(database)?;
        Ok(tx)
    }

    async fn find(&self, column: &str, key: &str) -> Result<A, RepositoryError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(&self.select_by(column, false))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;

        let (payload,) = row.ok_or_else(|| RepositoryError::NotFound {
            key: key.to_string(),
        })?;
        decode(payload)
    }

    async fn update_where<F, E>(&self, column: &str, key: &str, update: F) -> Result<A, E>
    where
        F: FnOnce(&mut A) -> Result<Vec<Outbound>, E> + Send,
        E: From<RepositoryError> + Send,
    {
        let mut tx = self.begin("SERIALIZABLE").await?;

        let row: Option<(serde_json::Value,)> = sqlx::query_as(&self.select_by(column, true))
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(database)?;

        let (payload,) = row.ok_or_else(|| RepositoryError::NotFound {
            key: key.to_string(),
        })?;
        let mut aggregate = decode(payload)?;

        // Dropping `tx` on a closure error rolls back.
        let messages = update(&mut aggregate)?;

        sqlx::query(&format!(
            "UPDATE {} SET payload = $1 WHERE {} = $2",
            self.table.name, self.table.id_column
        ))
        .bind(encode(&aggregate)?)
        .bind(aggregate.aggregate_id())
        .execute(&mut *tx)
        .await
        .map_err(database)?;

        publish_in_tx(&mut tx, &self.bus, &messages)
            .await
            .map_err(outbox)?;
        tx.commit().await.map_err(database)?;

        tracing::debug!(
            table = self.table.name,
            aggregate_id = aggregate.aggregate_id(),
            messages = messages.len(),
            "Aggregate updated"
        );

        Ok(aggregate)
    }
}

fn decode<A: Aggregate>(payload: serde_json::Value) -> Result<A, RepositoryError> {
    serde_json::from_value(payload).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

fn encode<A: Aggregate>(aggregate: &A) -> Result<serde_json::Value, RepositoryError> {
    serde_json::to_value(aggregate).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

impl<A: Aggregate> AggregateRepository<A> for PostgresAggregateRepository<A> {
    async fn add(&self, aggregate: A) -> Result<(), RepositoryError> {
        let mut tx = self.begin("REPEATABLE READ").await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO {name} ({id}, {booking_id}, payload) VALUES ($1, $2, $3) \
             ON CONFLICT ({id}) DO NOTHING",
            name = self.table.name,
            id = self.table.id_column,
            booking_id = self.table.booking_id_column,
        ))
        .bind(aggregate.aggregate_id())
        .bind(aggregate.booking_id())
        .bind(encode(&aggregate)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            let unique_violation = e
                .as_database_error()
                .and_then(|db| db.code())
                .is_some_and(|code| code == UNIQUE_VIOLATION);
            if unique_violation {
                RepositoryError::DuplicateBookingId {
                    booking_id: aggregate.booking_id().to_string(),
                }
            } else {
                database(e)
            }
        })?
        .rows_affected();

        if inserted == 0 {
            tracing::debug!(
                table = self.table.name,
                aggregate_id = aggregate.aggregate_id(),
                "Aggregate already exists, skipping"
            );
            return Ok(());
        }

        publish_in_tx(&mut tx, &self.bus, &aggregate.created())
            .await
            .map_err(outbox)?;
        tx.commit().await.map_err(database)?;

        tracing::info!(
            table = self.table.name,
            aggregate_id = aggregate.aggregate_id(),
            "Aggregate created"
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<A, RepositoryError> {
        self.find(self.table.id_column, id).await
    }

    async fn get_by_booking_id(&self, booking_id: &str) -> Result<A, RepositoryError> {
        self.find(self.table.booking_id_column, booking_id).await
    }

    async fn update_by_id<F, E>(&self, id: &str, update: F) -> Result<A, E>
    where
        F: FnOnce(&mut A) -> Result<Vec<Outbound>, E> + Send,
        E: From<RepositoryError> + Send,
    {
        self.update_where(self.table.id_column, id, update).await
    }

    async fn update_by_booking_id<F, E>(&self, booking_id: &str, update: F) -> Result<A, E>
    where
        F: FnOnce(&mut A) -> Result<Vec<Outbound>, E> + Send,
        E: From<RepositoryError> + Send,
    {
        self.update_where(self.table.booking_id_column, booking_id, update)
            .await
    }
}
