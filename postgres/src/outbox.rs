//! `PostgreSQL` transactional outbox.
//!
//! [`publish_in_tx`] appends routed messages inside the caller's transaction. [`PostgresOutbox`]
//! is the relay's read side.
//!
//! # Ordering
//!
//! `offset` values come from a sequence and are assigned at insert time, not at commit time. A
//! transaction holding offset 10 may commit after another one that wrote offset 11. Records are
//! therefore ordered by `(transaction_id, offset)`, and only rows whose writing transaction is
//! older than every transaction still in flight are visible to the relay:
//!
//! ```sql
//! transaction_id < pg_snapshot_xmin(pg_current_snapshot())
//! ```

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use ticketflow_core::bus::{BusConfig, Outbound};
use ticketflow_core::event::EventError;
use ticketflow_core::message::Message;
use ticketflow_core::outbox::{OutboxError, OutboxPosition, OutboxRecord, OutboxSource};

fn database(e: sqlx::Error) -> OutboxError {
    OutboxError::Database(e.to_string())
}

/// Append `messages` to the outbox as part of `tx`.
///
/// Nothing is visible to the relay until `tx` commits, and nothing is left behind if it rolls
/// back.
///
/// # Errors
///
/// Returns [`OutboxError::Envelope`] if a message cannot be encoded, or
/// [`OutboxError::Database`] if an insert fails.
pub async fn publish_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    bus: &BusConfig,
    messages: &[Outbound],
) -> Result<(), OutboxError> {
    for outbound in messages {
        let routed = bus.route(outbound)?;
        let metadata = serde_json::to_value(&routed.message.metadata)
            .map_err(|e| EventError::Serialization(e.to_string()))?;

        sqlx::query(
            "INSERT INTO outbox_messages (uuid, topic, payload, metadata) VALUES ($1, $2, $3, $4)",
        )
        .bind(&routed.message.id)
        .bind(&routed.topic)
        .bind(&routed.message.payload)
        .bind(metadata)
        .execute(&mut **tx)
        .await
        .map_err(database)?;

        tracing::debug!(
            topic = %routed.topic,
            message_id = %routed.message.id,
            name = outbound.name(),
            "Message written to outbox"
        );
    }

    Ok(())
}

type OutboxRow = (i64, i64, String, String, Vec<u8>, serde_json::Value, DateTime<Utc>);

fn row_to_record(row: OutboxRow) -> Result<OutboxRecord, OutboxError> {
    let (offset, transaction_id, id, topic, payload, metadata, created_at) = row;
    let metadata: BTreeMap<String, String> =
        serde_json::from_value(metadata).map_err(|e| OutboxError::Corrupt {
            offset,
            reason: e.to_string(),
        })?;

    Ok(OutboxRecord {
        position: OutboxPosition {
            transaction_id,
            offset,
        },
        topic,
        message: Message {
            id,
            metadata,
            payload,
        },
        created_at,
    })
}

/// Relay-facing view of the `outbox_messages` table.
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Create an outbox reader using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, after: OutboxPosition, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        #[allow(clippy::cast_possible_wrap)] // batch sizes are small
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            SELECT "offset", transaction_id::text::bigint, uuid, topic, payload, metadata, created_at
            FROM outbox_messages
            WHERE (transaction_id, "offset") > ($1::text::xid8, $2)
              AND transaction_id < pg_snapshot_xmin(pg_current_snapshot())
            ORDER BY transaction_id, "offset"
            LIMIT $3
            "#,
        )
        .bind(after.transaction_id.to_string())
        .bind(after.offset)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn load(&self, relay_name: &str) -> Result<Option<OutboxPosition>, OutboxError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT last_transaction_id, last_offset FROM outbox_offsets WHERE consumer_group = $1",
        )
        .bind(relay_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?;

        Ok(row.map(|(transaction_id, offset)| OutboxPosition {
            transaction_id,
            offset,
        }))
    }

    async fn save(&self, relay_name: &str, position: OutboxPosition) -> Result<(), OutboxError> {
        sqlx::query(
            r"
            INSERT INTO outbox_offsets (consumer_group, last_transaction_id, last_offset)
            VALUES ($1, $2, $3)
            ON CONFLICT (consumer_group) DO UPDATE
            SET last_transaction_id = EXCLUDED.last_transaction_id,
                last_offset = EXCLUDED.last_offset,
                updated_at = now()
            ",
        )
        .bind(relay_name)
        .bind(position.transaction_id)
        .bind(position.offset)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        Ok(())
    }
}

impl OutboxSource for PostgresOutbox {
    fn fetch_after<'a>(
        &'a self,
        after: OutboxPosition,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + 'a>> {
        Box::pin(self.fetch(after, limit))
    }

    fn load_cursor<'a>(
        &'a self,
        relay_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxPosition>, OutboxError>> + Send + 'a>> {
        Box::pin(self.load(relay_name))
    }

    fn save_cursor<'a>(
        &'a self,
        relay_name: &'a str,
        position: OutboxPosition,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(self.save(relay_name, position))
    }
}
