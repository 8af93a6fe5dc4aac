//! `PostgreSQL` data lake: the append-only `events` table.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;
use ticketflow_core::data_lake::{DataLake, DataLakeError, DataLakeEvent};

fn database(e: sqlx::Error) -> DataLakeError {
    DataLakeError::Database(e.to_string())
}

/// [`DataLake`] over the `events` table.
#[derive(Clone)]
pub struct PostgresDataLake {
    pool: PgPool,
}

impl PostgresDataLake {
    /// Create a data lake using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, event: &DataLakeEvent) -> Result<(), DataLakeError> {
        let payload: serde_json::Value = serde_json::from_slice(&event.event_payload)
            .map_err(|e| DataLakeError::Database(format!("payload is not JSON: {e}")))?;

        let result = sqlx::query(
            r"
            INSERT INTO events (event_id, published_at, event_name, event_payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            ",
        )
        .bind(&event.event_id)
        .bind(event.published_at)
        .bind(&event.event_name)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        if result.rows_affected() == 0 {
            tracing::debug!(event_id = %event.event_id, "Event already in data lake");
        }
        Ok(())
    }

    async fn load(&self) -> Result<Vec<DataLakeEvent>, DataLakeError> {
        let rows: Vec<(String, DateTime<Utc>, String, serde_json::Value)> = sqlx::query_as(
            r"
            SELECT event_id, published_at, event_name, event_payload
            FROM events
            ORDER BY published_at ASC, event_id ASC
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        rows.into_iter()
            .map(|(event_id, published_at, event_name, payload)| {
                Ok(DataLakeEvent {
                    event_id,
                    published_at,
                    event_name,
                    event_payload: serde_json::to_vec(&payload)
                        .map_err(|e| DataLakeError::Database(e.to_string()))?,
                })
            })
            .collect()
    }
}

impl DataLake for PostgresDataLake {
    fn store<'a>(
        &'a self,
        event: &'a DataLakeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), DataLakeError>> + Send + 'a>> {
        Box::pin(self.insert(event))
    }

    fn events(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DataLakeEvent>, DataLakeError>> + Send + '_>> {
        Box::pin(self.load())
    }
}
