//! Poison queue storage and operator tooling.
//!
//! The router's poison middleware publishes every message it gives up on to the poison topic.
//! [`PoisonQueueWriter`] consumes that topic into the `poisoned_messages` table, where
//! [`PoisonQueue`] lets an operator preview entries, requeue them to their original topic once
//! the cause is fixed, or remove them for good.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use thiserror::Error;
use ticketflow_core::bus::{BusError, Publisher};
use ticketflow_core::handler::HandlerError;
use ticketflow_core::message::{Message, POISONED_HANDLER_KEY, POISONED_TOPIC_KEY, REASON_KEY};
use ticketflow_runtime::MessageHandler;

/// Errors returned by the poison queue.
#[derive(Error, Debug)]
pub enum PoisonQueueError {
    /// Storage failure
    #[error("Database error: {0}")]
    Database(String),

    /// No entry with this ID
    #[error("Poisoned message not found: {0}")]
    NotFound(i64),

    /// The entry was already requeued or removed
    #[error("Poisoned message {id} is {status}")]
    NotPending {
        /// Entry ID
        id: i64,
        /// Current status
        status: &'static str,
    },

    /// The message could not be stored because it lacks poison metadata
    #[error("Message {0} carries no poison metadata")]
    MissingMetadata(String),

    /// Requeue publish failed
    #[error(transparent)]
    Publish(#[from] BusError),
}

fn database(e: sqlx::Error) -> PoisonQueueError {
    PoisonQueueError::Database(e.to_string())
}

/// Status of a poisoned message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonStatus {
    /// Waiting for an operator
    Pending,
    /// Requeued to its original topic
    Resolved,
    /// Removed without reprocessing
    Discarded,
}

impl PoisonStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, PoisonQueueError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(PoisonQueueError::Database(format!(
                "Invalid poison status: {s}"
            ))),
        }
    }
}

/// An entry in the poison queue.
#[derive(Debug, Clone)]
pub struct PoisonedMessage {
    /// Unique identifier for this entry
    pub id: i64,

    /// The message as it was consumed, poison metadata stripped
    pub message: Message,

    /// Topic the message was consumed from
    pub original_topic: String,

    /// Handler that gave up on it
    pub handler: String,

    /// Last error returned by the handler
    pub reason: String,

    /// Current status
    pub status: PoisonStatus,

    /// When the message was poisoned
    pub poisoned_at: DateTime<Utc>,

    /// When an operator requeued or removed it
    pub resolved_at: Option<DateTime<Utc>>,
}

/// `PostgreSQL`-backed poison queue.
///
/// # Example
///
/// ```no_run
/// use ticketflow_postgres::PoisonQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let queue = PoisonQueue::new(pool);
///
/// for entry in queue.preview(20).await? {
///     println!("{} {} {}", entry.id, entry.original_topic, entry.reason);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PoisonQueue {
    pool: PgPool,
}

const COLUMNS: &str = "id, message_id, original_topic, handler, reason, payload, metadata, \
                       status, poisoned_at, resolved_at";

impl PoisonQueue {
    /// Create a poison queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a message received from the poison topic.
    ///
    /// The same message poisoned again by the same handler (after a requeue, or a duplicate
    /// delivery) reopens its existing entry.
    ///
    /// # Returns
    ///
    /// The ID of the entry.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonQueueError::MissingMetadata`] if the message was not produced by the
    /// poison middleware, or [`PoisonQueueError::Database`] if the insert fails.
    pub async fn add_entry(&self, poisoned: &Message) -> Result<i64, PoisonQueueError> {
        let missing = || PoisonQueueError::MissingMetadata(poisoned.id.clone());
        let topic = poisoned.metadata(POISONED_TOPIC_KEY).ok_or_else(missing)?;
        let handler = poisoned.metadata(POISONED_HANDLER_KEY).ok_or_else(missing)?;
        let reason = poisoned.metadata(REASON_KEY).unwrap_or_default();

        let original = strip_poison_metadata(poisoned.clone());
        let metadata = serde_json::to_value(&original.metadata)
            .map_err(|e| PoisonQueueError::Database(e.to_string()))?;

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO poisoned_messages (
                message_id, original_topic, handler, reason, payload, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id, handler) DO UPDATE
            SET reason = EXCLUDED.reason,
                status = 'pending',
                poisoned_at = now(),
                resolved_at = NULL
            RETURNING id
            ",
        )
        .bind(&original.id)
        .bind(topic)
        .bind(handler)
        .bind(reason)
        .bind(&original.payload)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(database)?;

        tracing::warn!(
            poison_id = id,
            message_id = %original.id,
            topic = topic,
            handler = handler,
            reason = reason,
            "Message stored in poison queue"
        );

        metrics::counter!("poison_queue.added", "handler" => handler.to_string()).increment(1);

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonQueueError::Database`] if the query fails.
    pub async fn preview(&self, limit: usize) -> Result<Vec<PoisonedMessage>, PoisonQueueError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM poisoned_messages
             WHERE status = 'pending'
             ORDER BY poisoned_at ASC, id ASC
             LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        rows.iter().map(Self::row_to_poisoned_message).collect()
    }

    /// Get an entry by ID.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonQueueError::NotFound`] if there is no such entry.
    pub async fn get(&self, id: i64) -> Result<PoisonedMessage, PoisonQueueError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM poisoned_messages WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .ok_or(PoisonQueueError::NotFound(id))?;

        Self::row_to_poisoned_message(&row)
    }

    /// Publish a pending entry back to its original topic and mark it resolved.
    ///
    /// If the status update fails after the publish, the entry stays pending and a later
    /// requeue publishes it again; handlers tolerate the duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonQueueError::NotFound`], [`PoisonQueueError::NotPending`],
    /// [`PoisonQueueError::Publish`] or [`PoisonQueueError::Database`].
    pub async fn requeue(&self, id: i64, publisher: &dyn Publisher) -> Result<(), PoisonQueueError> {
        let entry = self.get(id).await?;
        if entry.status != PoisonStatus::Pending {
            return Err(PoisonQueueError::NotPending {
                id,
                status: entry.status.as_str(),
            });
        }

        publisher
            .publish(&entry.original_topic, vec![entry.message.clone()])
            .await?;
        self.close(id, PoisonStatus::Resolved).await?;

        tracing::info!(
            poison_id = id,
            topic = %entry.original_topic,
            message_id = %entry.message.id,
            "Poisoned message requeued"
        );
        metrics::counter!("poison_queue.requeued").increment(1);

        Ok(())
    }

    /// Acknowledge a pending entry without reprocessing it.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonQueueError::NotFound`] if there is no pending entry with this ID.
    pub async fn remove(&self, id: i64) -> Result<(), PoisonQueueError> {
        self.close(id, PoisonStatus::Discarded).await?;

        tracing::warn!(poison_id = id, "Poisoned message removed");
        metrics::counter!("poison_queue.discarded").increment(1);

        Ok(())
    }

    /// Get count of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonQueueError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, PoisonQueueError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM poisoned_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(database)?;

        Ok(count)
    }

    async fn close(&self, id: i64, status: PoisonStatus) -> Result<(), PoisonQueueError> {
        let result = sqlx::query(
            r"
            UPDATE poisoned_messages
            SET status = $1, resolved_at = now()
            WHERE id = $2 AND status = 'pending'
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        if result.rows_affected() == 0 {
            return Err(PoisonQueueError::NotFound(id));
        }
        Ok(())
    }

    fn row_to_poisoned_message(
        row: &sqlx::postgres::PgRow,
    ) -> Result<PoisonedMessage, PoisonQueueError> {
        let metadata_json: serde_json::Value = row.get("metadata");
        let metadata: BTreeMap<String, String> = serde_json::from_value(metadata_json)
            .map_err(|e| PoisonQueueError::Database(format!("Invalid metadata: {e}")))?;

        let status: String = row.get("status");

        Ok(PoisonedMessage {
            id: row.get("id"),
            message: Message {
                id: row.get("message_id"),
                metadata,
                payload: row.get("payload"),
            },
            original_topic: row.get("original_topic"),
            handler: row.get("handler"),
            reason: row.get("reason"),
            status: PoisonStatus::parse(&status)?,
            poisoned_at: row.get("poisoned_at"),
            resolved_at: row.get("resolved_at"),
        })
    }
}

fn strip_poison_metadata(mut message: Message) -> Message {
    for key in [REASON_KEY, POISONED_TOPIC_KEY, POISONED_HANDLER_KEY] {
        message.metadata.remove(key);
    }
    message
}

/// Router handler storing the poison topic into a [`PoisonQueue`].
pub struct PoisonQueueWriter {
    queue: PoisonQueue,
}

impl PoisonQueueWriter {
    /// Create a writer into `queue`.
    #[must_use]
    pub const fn new(queue: PoisonQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl MessageHandler for PoisonQueueWriter {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        match self.queue.add_entry(message).await {
            Ok(_) => Ok(()),
            Err(err @ PoisonQueueError::MissingMetadata(_)) => {
                Err(HandlerError::Malformed(err.to_string()))
            }
            Err(err) => Err(HandlerError::Transient(err.to_string())),
        }
    }
}
