//! In-memory aggregate store, outbox and data lake.
//!
//! These mirror the Postgres implementations closely enough for saga and relay tests:
//! - [`InMemoryRepository`] applies update closures under one lock and appends their outbound
//!   messages to a shared [`InMemoryOutbox`] before releasing it
//! - [`InMemoryOutbox`] hands out positions in commit order and can be told to fail cursor
//!   saves, which simulates a relay crashing between publish and acknowledgement
//! - [`InMemoryDataLake`] ignores duplicate event IDs

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use ticketflow_core::bus::{BusConfig, Outbound, decode_command, decode_event};
use ticketflow_core::command::Command;
use ticketflow_core::data_lake::{DataLake, DataLakeError, DataLakeEvent};
use ticketflow_core::event::{Event, EventError};
use ticketflow_core::message::Message;
use ticketflow_core::outbox::{OutboxError, OutboxPosition, OutboxRecord, OutboxSource};
use ticketflow_core::repository::{Aggregate, AggregateRepository, RepositoryError};
use ticketflow_core::{DateTime, Utc};

#[derive(Default)]
struct OutboxState {
    records: Vec<OutboxRecord>,
    cursors: HashMap<String, OutboxPosition>,
    last_transaction_id: i64,
    failing_cursor_saves: usize,
}

/// In-memory outbox.
///
/// # Example
///
/// ```
/// use ticketflow_core::bus::{BusConfig, Outbound};
/// use ticketflow_core::event::{Event, EventHeader, VipBundleFinalized};
/// use ticketflow_testing::InMemoryOutbox;
///
/// let outbox = InMemoryOutbox::new();
/// let event = Event::from(VipBundleFinalized {
///     header: EventHeader::new(),
///     vip_bundle_id: "bundle-1".to_string(),
/// });
///
/// outbox.append(&BusConfig::new("svc"), &[Outbound::from(event.clone())]).unwrap();
/// assert_eq!(outbox.events(), vec![event]);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<OutboxState>>,
}

impl InMemoryOutbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append messages as one committed transaction.
    ///
    /// Nothing is appended if any message fails to encode.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if a message cannot be encoded.
    pub fn append(&self, bus: &BusConfig, messages: &[Outbound]) -> Result<(), EventError> {
        let routed = messages
            .iter()
            .map(|outbound| bus.route(outbound))
            .collect::<Result<Vec<_>, _>>()?;
        if routed.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();
        state.last_transaction_id += 1;
        let transaction_id = state.last_transaction_id;
        for routed in routed {
            let offset = i64::try_from(state.records.len()).unwrap() + 1;
            state.records.push(OutboxRecord {
                position: OutboxPosition {
                    transaction_id,
                    offset,
                },
                topic: routed.topic,
                message: routed.message,
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Every record, in position order.
    #[must_use]
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.state.lock().unwrap().records.clone()
    }

    /// Messages appended for `topic`.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.records()
            .into_iter()
            .filter(|record| record.topic == topic)
            .map(|record| record.message)
            .collect()
    }

    /// Every appended event, decoded.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.records()
            .iter()
            .filter_map(|record| decode_event(&record.message).ok())
            .collect()
    }

    /// Every appended command, decoded.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        self.records()
            .iter()
            .filter_map(|record| decode_command(&record.message).ok())
            .collect()
    }

    /// Make the next `count` cursor saves fail.
    pub fn fail_cursor_saves(&self, count: usize) {
        self.state.lock().unwrap().failing_cursor_saves = count;
    }

    /// Last saved cursor of a relay.
    #[must_use]
    pub fn cursor(&self, relay_name: &str) -> Option<OutboxPosition> {
        self.state.lock().unwrap().cursors.get(relay_name).copied()
    }
}

impl OutboxSource for InMemoryOutbox {
    fn fetch_after<'a>(
        &'a self,
        after: OutboxPosition,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .records
                .iter()
                .filter(|record| record.position > after)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn load_cursor<'a>(
        &'a self,
        relay_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxPosition>, OutboxError>> + Send + 'a>>
    {
        Box::pin(async move { Ok(self.cursor(relay_name)) })
    }

    fn save_cursor<'a>(
        &'a self,
        relay_name: &'a str,
        position: OutboxPosition,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.failing_cursor_saves > 0 {
                state.failing_cursor_saves -= 1;
                return Err(OutboxError::Database("cursor save failed".to_string()));
            }
            state.cursors.insert(relay_name.to_string(), position);
            Ok(())
        })
    }
}

/// In-memory [`AggregateRepository`].
///
/// Every read-modify-write holds a single lock for the whole step, so concurrent updates of
/// one aggregate are serialized the same way serializable transactions serialize them.
pub struct InMemoryRepository<A> {
    aggregates: Arc<Mutex<HashMap<String, A>>>,
    outbox: InMemoryOutbox,
    bus: BusConfig,
    injected_conflicts: Arc<AtomicUsize>,
}

impl<A> Clone for InMemoryRepository<A> {
    fn clone(&self) -> Self {
        Self {
            aggregates: Arc::clone(&self.aggregates),
            outbox: self.outbox.clone(),
            bus: self.bus.clone(),
            injected_conflicts: Arc::clone(&self.injected_conflicts),
        }
    }
}

impl<A: Aggregate> InMemoryRepository<A> {
    /// Create an empty repository with its own outbox.
    #[must_use]
    pub fn new(bus: BusConfig) -> Self {
        Self::with_outbox(bus, InMemoryOutbox::new())
    }

    /// Create an empty repository writing to a shared outbox.
    #[must_use]
    pub fn with_outbox(bus: BusConfig, outbox: InMemoryOutbox) -> Self {
        Self {
            aggregates: Arc::new(Mutex::new(HashMap::new())),
            outbox,
            bus,
            injected_conflicts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The outbox updates are written to.
    #[must_use]
    pub const fn outbox(&self) -> &InMemoryOutbox {
        &self.outbox
    }

    /// Make the next `count` updates fail with [`RepositoryError::Conflict`].
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of stored aggregates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.aggregates.lock().unwrap().len()
    }

    /// Whether the repository is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, key: &str, matches: impl Fn(&A) -> bool) -> Result<A, RepositoryError> {
        self.aggregates
            .lock()
            .unwrap()
            .values()
            .find(|&aggregate| matches(aggregate))
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound {
                key: key.to_string(),
            })
    }

    fn update_matching<F, E>(
        &self,
        key: &str,
        matches: impl Fn(&A) -> bool,
        update: F,
    ) -> Result<A, E>
    where
        F: FnOnce(&mut A) -> Result<Vec<Outbound>, E>,
        E: From<RepositoryError>,
    {
        let conflict = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflict {
            return Err(RepositoryError::Conflict(format!("injected conflict on {key}")).into());
        }

        let mut aggregates = self.aggregates.lock().unwrap();
        let Some(current) = aggregates.values().find(|&aggregate| matches(aggregate)) else {
            return Err(RepositoryError::NotFound {
                key: key.to_string(),
            }
            .into());
        };

        let mut updated = current.clone();
        let outbound = update(&mut updated)?;
        self.outbox
            .append(&self.bus, &outbound)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        aggregates.insert(updated.aggregate_id().to_string(), updated.clone());
        Ok(updated)
    }
}

impl<A: Aggregate> AggregateRepository<A> for InMemoryRepository<A> {
    async fn add(&self, aggregate: A) -> Result<(), RepositoryError> {
        let mut aggregates = self.aggregates.lock().unwrap();
        if aggregates.contains_key(aggregate.aggregate_id()) {
            return Ok(());
        }
        if aggregates
            .values()
            .any(|stored| stored.booking_id() == aggregate.booking_id())
        {
            return Err(RepositoryError::DuplicateBookingId {
                booking_id: aggregate.booking_id().to_string(),
            });
        }

        self.outbox
            .append(&self.bus, &aggregate.created())
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        aggregates.insert(aggregate.aggregate_id().to_string(), aggregate);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<A, RepositoryError> {
        self.find(id, |aggregate| aggregate.aggregate_id() == id)
    }

    async fn get_by_booking_id(&self, booking_id: &str) -> Result<A, RepositoryError> {
        self.find(booking_id, |aggregate| aggregate.booking_id() == booking_id)
    }

    async fn update_by_id<F, E>(&self, id: &str, update: F) -> Result<A, E>
    where
        F: FnOnce(&mut A) -> Result<Vec<Outbound>, E> + Send,
        E: From<RepositoryError> + Send,
    {
        self.update_matching(id, |aggregate| aggregate.aggregate_id() == id, update)
    }

    async fn update_by_booking_id<F, E>(&self, booking_id: &str, update: F) -> Result<A, E>
    where
        F: FnOnce(&mut A) -> Result<Vec<Outbound>, E> + Send,
        E: From<RepositoryError> + Send,
    {
        self.update_matching(
            booking_id,
            |aggregate| aggregate.booking_id() == booking_id,
            update,
        )
    }
}

/// In-memory [`DataLake`].
#[derive(Clone, Default)]
pub struct InMemoryDataLake {
    events: Arc<Mutex<Vec<DataLakeEvent>>>,
}

impl InMemoryDataLake {
    /// Create an empty data lake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Whether nothing was stored yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a raw event directly, bypassing the writer handler.
    pub fn insert(
        &self,
        event_id: &str,
        event_name: &str,
        published_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) {
        let event = DataLakeEvent {
            event_id: event_id.to_string(),
            published_at,
            event_name: event_name.to_string(),
            event_payload: serde_json::to_vec(payload).unwrap(),
        };
        let mut events = self.events.lock().unwrap();
        if !events.iter().any(|stored| stored.event_id == event.event_id) {
            events.push(event);
        }
    }
}

impl DataLake for InMemoryDataLake {
    fn store<'a>(
        &'a self,
        event: &'a DataLakeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), DataLakeError>> + Send + 'a>> {
        Box::pin(async move {
            let mut events = self.events.lock().unwrap();
            if !events.iter().any(|stored| stored.event_id == event.event_id) {
                events.push(event.clone());
            }
            Ok(())
        })
    }

    fn events(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DataLakeEvent>, DataLakeError>> + Send + '_>>
    {
        Box::pin(async move {
            let mut events = self.events.lock().unwrap().clone();
            events.sort_by_key(|event| event.published_at);
            Ok(events)
        })
    }
}
