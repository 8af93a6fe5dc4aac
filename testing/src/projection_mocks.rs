//! In-memory read model store.
//!
//! Provides fast, deterministic storage for projection tests:
//! - [`InMemoryOpsBookingStore`]: `BTreeMap`-backed [`OpsBookingStore`]

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use ticketflow_core::projection::{ProjectionError, Result};
use ticketflow_projections::{OpsBooking, OpsBookingStore};

/// In-memory ops bookings store for fast, deterministic testing.
///
/// Clones share the same documents, so a test can keep one handle for assertions while the
/// projection owns another.
///
/// # Example
///
/// ```
/// use ticketflow_testing::InMemoryOpsBookingStore;
/// use ticketflow_projections::OpsBookingStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryOpsBookingStore::new();
/// assert!(store.get("booking-1").await?.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryOpsBookingStore {
    bookings: Arc<RwLock<BTreeMap<String, OpsBooking>>>,
}

impl InMemoryOpsBookingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bookings.read().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bookings.read().unwrap().is_empty()
    }

    fn update_where<F>(
        &self,
        key: &str,
        matches: impl Fn(&OpsBooking) -> bool,
        update: F,
    ) -> Result<OpsBooking>
    where
        F: FnOnce(&mut OpsBooking),
    {
        let mut bookings = self.bookings.write().unwrap();
        let booking = bookings
            .values_mut()
            .find(|booking| matches(&**booking))
            .ok_or_else(|| {
                ProjectionError::NotYetAvailable(format!("ops booking for {key} does not exist yet"))
            })?;

        update(booking);
        Ok(booking.clone())
    }
}

impl OpsBookingStore for InMemoryOpsBookingStore {
    async fn create(&self, booking: OpsBooking) -> Result<()> {
        self.bookings
            .write()
            .unwrap()
            .entry(booking.booking_id.clone())
            .or_insert(booking);
        Ok(())
    }

    async fn update_by_booking_id<F>(&self, booking_id: &str, update: F) -> Result<OpsBooking>
    where
        F: FnOnce(&mut OpsBooking) + Send,
    {
        self.update_where(booking_id, |b| b.booking_id == booking_id, update)
    }

    async fn update_by_ticket_id<F>(&self, ticket_id: &str, update: F) -> Result<OpsBooking>
    where
        F: FnOnce(&mut OpsBooking) + Send,
    {
        self.update_where(ticket_id, |b| b.tickets.contains_key(ticket_id), update)
    }

    async fn get(&self, booking_id: &str) -> Result<Option<OpsBooking>> {
        Ok(self.bookings.read().unwrap().get(booking_id).cloned())
    }

    async fn all(&self, receipt_issue_date: Option<NaiveDate>) -> Result<Vec<OpsBooking>> {
        Ok(self
            .bookings
            .read()
            .unwrap()
            .values()
            .filter(|booking| receipt_issue_date.is_none_or(|date| booking.has_receipt_issued_on(date)))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.bookings.write().unwrap().clear();
        Ok(())
    }
}
