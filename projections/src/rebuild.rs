//! Rebuilding a read model from the data lake.
//!
//! The data lake holds every external event ever published, ordered by `published_at`. A
//! rebuild resets the projection and replays the events it handles. Events stored under a
//! legacy `_v0` name are upcast to their `_v1` schema first; the two versions share their
//! JSON shape, so upcasting is a rename.

use thiserror::Error;
use ticketflow_core::data_lake::{DataLake, DataLakeError, DataLakeEvent};
use ticketflow_core::event::{Event, EventError, EventName};
use ticketflow_core::projection::{Projection, ProjectionError};

/// Errors that abort a rebuild.
#[derive(Error, Debug)]
pub enum RebuildError {
    /// The data lake could not be read
    #[error(transparent)]
    DataLake(#[from] DataLakeError),

    /// A stored event the projection handles could not be decoded
    #[error("Could not decode event {event_id} ({event_name}): {source}")]
    Decode {
        /// Data lake ID of the event
        event_id: String,
        /// Stored name
        event_name: String,
        /// Decoder error
        source: EventError,
    },

    /// The projection could not be cleared
    #[error("Could not reset projection: {0}")]
    Reset(ProjectionError),

    /// The projection rejected an event
    #[error("Could not apply event {event_id}: {source}")]
    Apply {
        /// Data lake ID of the event
        event_id: String,
        /// Projection error
        source: ProjectionError,
    },
}

/// Resolve a stored name, mapping legacy `_v0` names to `_v1`.
///
/// Returns `None` for names outside the closed event set.
#[must_use]
pub fn upcast_name(stored: &str) -> Option<EventName> {
    let current = stored
        .strip_suffix("_v0")
        .map_or_else(|| stored.to_string(), |base| format!("{base}_v1"));
    EventName::parse(&current).ok()
}

fn decode(stored: &DataLakeEvent, name: EventName) -> Result<Event, RebuildError> {
    Event::from_payload(name, &stored.event_payload).map_err(|source| RebuildError::Decode {
        event_id: stored.event_id.clone(),
        event_name: stored.event_name.clone(),
        source,
    })
}

/// Reset `projection` and replay the data lake into it.
///
/// Returns the number of events applied.
///
/// # Errors
///
/// Returns [`RebuildError`] on the first event that cannot be read, decoded or applied.
pub async fn rebuild<P: Projection>(
    lake: &dyn DataLake,
    projection: &P,
) -> Result<usize, RebuildError> {
    let events = lake.events().await?;
    tracing::info!(
        projection = projection.name(),
        events_count = events.len(),
        "Rebuilding read model"
    );

    projection.reset().await.map_err(RebuildError::Reset)?;

    let handled = projection.handled_events();
    let mut applied = 0;

    for stored in &events {
        let Some(name) = upcast_name(&stored.event_name).filter(|name| handled.contains(name))
        else {
            continue;
        };

        let event = decode(stored, name)?;
        projection
            .apply_event(&event)
            .await
            .map_err(|source| RebuildError::Apply {
                event_id: stored.event_id.clone(),
                source,
            })?;

        applied += 1;
        tracing::debug!(event_id = %stored.event_id, event_name = %stored.event_name, "Event replayed");
    }

    tracing::info!(projection = projection.name(), applied, "Read model rebuilt");
    Ok(applied)
}
