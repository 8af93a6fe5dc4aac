//! Outbox relay: tails an [`OutboxSource`] and forwards every record to the transport.
//!
//! # Delivery
//!
//! Records are published one at a time in position order. The cursor is saved only after the
//! transport acknowledged a record, so a crash between the two re-publishes that record on
//! restart. A record is never skipped: a failing publish is retried with backoff until it
//! succeeds or the relay is shut down.
//!
//! ```text
//!   load_cursor ──► fetch_after(cursor) ──► publish ──► save_cursor ──► ...
//!                          ▲                   │ error
//!                          │                   ▼
//!                      poll_interval      backoff, same record
//! ```

use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticketflow_core::bus::Publisher;
use ticketflow_core::outbox::{OutboxError, OutboxPosition, OutboxRecord, OutboxSource};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Errors that stop a relay pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Reading records or the cursor failed
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Shutdown was requested while a record was still unpublished
    #[error("Relay shut down before publishing offset {0}")]
    Interrupted(i64),
}

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Cursor name in the offsets table
    pub relay_name: String,
    /// Sleep between polls of an empty outbox
    pub poll_interval: Duration,
    /// Maximum number of records fetched per poll
    pub batch_size: usize,
    /// Backoff between failed publishes; `max_retries` is ignored
    pub backoff: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_name: "svc-tickets-outbox".to_string(),
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(30))
                .build(),
        }
    }
}

/// Forwards outbox records to a publisher.
pub struct OutboxRelay {
    source: Arc<dyn OutboxSource>,
    publisher: Arc<dyn Publisher>,
    config: RelayConfig,
}

impl OutboxRelay {
    /// Create a relay.
    #[must_use]
    pub fn new(
        source: Arc<dyn OutboxSource>,
        publisher: Arc<dyn Publisher>,
        config: RelayConfig,
    ) -> Self {
        Self {
            source,
            publisher,
            config,
        }
    }

    /// Publish one batch after `cursor`, advancing it record by record.
    ///
    /// Returns the number of records published.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Outbox`] if records cannot be fetched or the cursor cannot be
    /// saved, and [`RelayError::Interrupted`] on shutdown. In both cases `cursor` points at the
    /// last record whose position was durably saved.
    pub async fn relay_batch(
        &self,
        cursor: &mut OutboxPosition,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<usize, RelayError> {
        let records = self
            .source
            .fetch_after(*cursor, self.config.batch_size)
            .await?;

        let mut published = 0;
        for record in records {
            self.publish_until_acked(&record, shutdown).await?;

            self.source
                .save_cursor(&self.config.relay_name, record.position)
                .await?;
            *cursor = record.position;
            published += 1;

            metrics::counter!("outbox.relay.published").increment(1);
            tracing::debug!(
                topic = %record.topic,
                offset = record.position.offset,
                transaction_id = record.position.transaction_id,
                "Outbox record published"
            );
        }

        Ok(published)
    }

    async fn publish_until_acked(
        &self,
        record: &OutboxRecord,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        let mut attempt = 0;
        loop {
            let Err(err) = self
                .publisher
                .publish(&record.topic, vec![record.message.clone()])
                .await
            else {
                return Ok(());
            };

            metrics::counter!("outbox.relay.publish_failures").increment(1);
            let delay = self.config.backoff.delay_for_attempt(attempt);
            tracing::warn!(
                topic = %record.topic,
                offset = record.position.offset,
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                error = %err,
                "Outbox publish failed, retrying"
            );
            attempt += 1;

            tokio::select! {
                _ = shutdown.recv() => return Err(RelayError::Interrupted(record.position.offset)),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run until shutdown.
    ///
    /// Storage errors are logged and followed by a cursor reload, which may replay records
    /// that were published but not yet acknowledged in the offsets table.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(relay = %self.config.relay_name, "Outbox relay started");

        let mut failures = 0;
        let mut cursor: Option<OutboxPosition> = None;

        loop {
            let result = match cursor.as_mut() {
                Some(position) => self.relay_batch(position, &mut shutdown).await,
                None => match self.source.load_cursor(&self.config.relay_name).await {
                    Ok(loaded) => {
                        cursor = Some(loaded.unwrap_or_default());
                        continue;
                    }
                    Err(err) => Err(err.into()),
                },
            };

            let pause = match result {
                Ok(0) => {
                    failures = 0;
                    self.config.poll_interval
                }
                Ok(_) => {
                    failures = 0;
                    continue;
                }
                Err(RelayError::Interrupted(offset)) => {
                    tracing::info!(offset, "Outbox relay interrupted");
                    break;
                }
                Err(err) => {
                    tracing::error!(relay = %self.config.relay_name, error = %err, "Outbox relay error");
                    cursor = None;
                    failures += 1;
                    self.config.backoff.delay_for_attempt(failures - 1)
                }
            };

            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!(relay = %self.config.relay_name, "Outbox relay stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
