//! # Ticketflow Testing
//!
//! Testing utilities for the ticket service crates.
//!
//! This crate provides:
//! - In-memory aggregate repository, outbox and data lake
//! - In-memory ops bookings store
//! - A publisher wrapper that fails on demand
//! - Deterministic clocks and a test tracing subscriber
//!
//! ## Example
//!
//! ```ignore
//! use ticketflow_testing::{InMemoryRepository, test_clock};
//!
//! #[tokio::test]
//! async fn test_bundle_flow() {
//!     let repo = InMemoryRepository::<VipBundle>::new(BusConfig::new("svc-tickets"));
//!     repo.add(bundle).await?;
//!
//!     assert_eq!(repo.outbox().commands().len(), 0);
//! }
//! ```

use chrono::{DateTime, Utc};
use ticketflow_core::environment::Clock;

mod memory;
mod projection_mocks;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ticketflow_core::bus::{BusError, Publisher};
    use ticketflow_core::message::Message;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use ticketflow_testing::mocks::FixedClock;
    /// use ticketflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Publisher that fails a given number of publishes before delegating.
    #[derive(Clone)]
    pub struct FlakyPublisher {
        inner: Arc<dyn Publisher>,
        remaining_failures: Arc<AtomicUsize>,
        attempts: Arc<AtomicUsize>,
    }

    impl FlakyPublisher {
        /// Wrap `inner`, failing the first `failures` publishes.
        #[must_use]
        pub fn new(inner: Arc<dyn Publisher>, failures: usize) -> Self {
            Self {
                inner,
                remaining_failures: Arc::new(AtomicUsize::new(failures)),
                attempts: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Number of publish calls so far, failed ones included.
        #[must_use]
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Publisher for FlakyPublisher {
        fn publish<'a>(
            &'a self,
            topic: &'a str,
            messages: Vec<Message>,
        ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let fail = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            if fail {
                return Box::pin(async move {
                    Err(BusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: "injected failure".to_string(),
                    })
                });
            }
            self.inner.publish(topic, messages)
        }
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs the subscriber.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ticketflow=debug")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use memory::{InMemoryDataLake, InMemoryOutbox, InMemoryRepository};
pub use mocks::{FixedClock, FlakyPublisher, test_clock};
pub use projection_mocks::InMemoryOpsBookingStore;
pub use ticketflow_runtime::InProcessBus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }
}
