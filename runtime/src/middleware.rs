//! Handler middleware: recoverer, retry and poison queue.
//!
//! ```text
//! message ──► recover(handler) ──► retry (bounded backoff) ──► ok
//!                                       │ exhausted / not retryable
//!                                       ▼
//!                                 PoisonQueue (+ reason)
//! ```
//!
//! A message is either processed, or copied to the poison topic with the failure reason.
//! It is never dropped silently.

use crate::handler::MessageHandler;
use crate::retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use ticketflow_core::bus::Publisher;
use ticketflow_core::handler::HandlerError;
use ticketflow_core::message::{
    Message, POISONED_HANDLER_KEY, POISONED_TOPIC_KEY, REASON_KEY,
};

/// Run a handler, converting a panic into [`HandlerError::Panicked`].
async fn recover(handler: &dyn MessageHandler, message: &Message) -> Result<(), HandlerError> {
    AssertUnwindSafe(handler.handle(message))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Middleware chain shared by all routes of a router.
pub(crate) struct Middleware {
    pub(crate) retry: RetryPolicy,
    pub(crate) publisher: Arc<dyn Publisher>,
    pub(crate) poison_topic: String,
}

impl Middleware {
    /// Process a message to completion: handled, or poisoned.
    pub(crate) async fn process(
        &self,
        handler_name: &str,
        topic: &str,
        handler: &Arc<dyn MessageHandler>,
        message: Message,
    ) {
        let result = retry_with_predicate(
            self.retry.clone(),
            || recover(handler.as_ref(), &message),
            HandlerError::is_retryable,
        )
        .await;

        match result {
            Ok(()) => {
                metrics::counter!("router.messages.handled", "handler" => handler_name.to_string())
                    .increment(1);
            }
            Err(err) => self.poison(handler_name, topic, message, &err).await,
        }
    }

    async fn poison(&self, handler_name: &str, topic: &str, message: Message, err: &HandlerError) {
        let message_id = message.id.clone();
        let poisoned = message
            .with_metadata(REASON_KEY, err.to_string())
            .with_metadata(POISONED_TOPIC_KEY, topic)
            .with_metadata(POISONED_HANDLER_KEY, handler_name);

        tracing::error!(
            handler = handler_name,
            topic,
            message_id = %message_id,
            error = %err,
            "Diverting message to poison queue"
        );

        let published = retry_with_backoff(self.retry.clone(), || {
            self.publisher
                .publish(&self.poison_topic, vec![poisoned.clone()])
        })
        .await;

        match published {
            Ok(()) => {
                metrics::counter!("router.messages.poisoned", "handler" => handler_name.to_string())
                    .increment(1);
            }
            Err(publish_err) => {
                tracing::error!(
                    handler = handler_name,
                    message_id = %message_id,
                    payload = %String::from_utf8_lossy(&poisoned.payload),
                    reason = %err,
                    error = %publish_err,
                    "Poison queue unreachable, message logged here only"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::in_process::InProcessBus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        error: HandlerError,
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl MessageHandler for Panics {
        async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
            panic!("boom");
        }
    }

    fn middleware(bus: &InProcessBus) -> Middleware {
        Middleware {
            retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(2))
                .build(),
            publisher: Arc::new(bus.clone()),
            poison_topic: "PoisonQueue".to_string(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let bus = InProcessBus::recording();
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 2,
            error: HandlerError::Transient("db".into()),
        });
        let handler: Arc<dyn MessageHandler> = flaky.clone();

        middleware(&bus)
            .process("h", "events.X", &handler, Message::new(Vec::new()))
            .await;

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert!(bus.published("PoisonQueue").is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_poison_with_reason() {
        let bus = InProcessBus::recording();
        let handler: Arc<dyn MessageHandler> = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
            error: HandlerError::NotYetAvailable("booking b-1".into()),
        });
        let message = Message::new(b"payload".to_vec());

        middleware(&bus)
            .process("ops_read_model", "events.X", &handler, message.clone())
            .await;

        let poisoned = bus.published("PoisonQueue");
        assert_eq!(poisoned.len(), 1);
        assert_eq!(poisoned[0].payload, message.payload);
        assert_eq!(poisoned[0].id, message.id);
        assert_eq!(
            poisoned[0].metadata(REASON_KEY),
            Some("not yet available: booking b-1")
        );
        assert_eq!(poisoned[0].metadata(POISONED_HANDLER_KEY), Some("ops_read_model"));
        assert_eq!(poisoned[0].metadata(POISONED_TOPIC_KEY), Some("events.X"));
    }

    #[tokio::test]
    async fn rejected_messages_skip_retries() {
        let bus = InProcessBus::recording();
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
            error: HandlerError::Rejected("illegal".into()),
        });
        let handler: Arc<dyn MessageHandler> = flaky.clone();

        middleware(&bus)
            .process("h", "t", &handler, Message::new(Vec::new()))
            .await;

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.published("PoisonQueue").len(), 1);
    }

    #[tokio::test]
    async fn panics_are_recovered_and_poisoned() {
        let bus = InProcessBus::recording();
        let handler: Arc<dyn MessageHandler> = Arc::new(Panics);

        middleware(&bus)
            .process("h", "t", &handler, Message::new(Vec::new()))
            .await;

        let poisoned = bus.published("PoisonQueue");
        assert_eq!(poisoned[0].metadata(REASON_KEY), Some("handler panicked: boom"));
    }
}
