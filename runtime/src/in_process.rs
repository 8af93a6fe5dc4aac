//! In-process transport.
//!
//! [`InProcessBus`] implements both [`Publisher`] and [`Subscriber`] on top of unbounded tokio
//! channels. Every consumer group subscribed to a topic receives its own copy of each message
//! published after it subscribed. A bus built with [`InProcessBus::recording`] also keeps a log
//! of everything published, which tests use to assert on outgoing commands and events.
//!
//! Messages published to a topic with no subscribers are dropped, or only logged when recording.

use futures::future;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use ticketflow_core::bus::{BusError, MessageStream, Publisher, Subscriber};
use ticketflow_core::message::Message;
use tokio::sync::mpsc;

#[derive(Default)]
struct Inner {
    // topic -> consumer group -> sender
    subscriptions: HashMap<String, HashMap<String, mpsc::UnboundedSender<Message>>>,
    // Only set when recording; a long-running bus must not retain what it delivers.
    log: Option<Vec<(String, Message)>>,
    closed: bool,
}

/// Channel-backed transport living inside one process.
#[derive(Clone, Default)]
pub struct InProcessBus {
    inner: Arc<Mutex<Inner>>,
}

impl InProcessBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bus that logs every published message.
    #[must_use]
    pub fn recording() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                log: Some(Vec::new()),
                ..Inner::default()
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BusError> {
        self.inner
            .lock()
            .map_err(|_| BusError::ConnectionFailed("in-process bus lock poisoned".to_string()))
    }

    /// Messages published to `topic` so far, in publish order. Empty unless recording.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.log()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m)
            .collect()
    }

    /// Every published `(topic, message)` pair, in publish order. Empty unless recording.
    #[must_use]
    pub fn log(&self) -> Vec<(String, Message)> {
        self.lock()
            .ok()
            .and_then(|inner| inner.log.clone())
            .unwrap_or_default()
    }

    /// End every open subscription stream and reject further publishes.
    pub fn close(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.closed = true;
            inner.subscriptions.clear();
        }
    }
}

impl Publisher for InProcessBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        messages: Vec<Message>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>> {
        let result = self.lock().and_then(|mut inner| {
            if inner.closed {
                return Err(BusError::Closed);
            }

            if let Some(groups) = inner.subscriptions.get_mut(topic) {
                groups.retain(|group, sender| {
                    messages.iter().all(|message| sender.send(message.clone()).is_ok()) || {
                        tracing::debug!(topic, group = %group, "Dropping closed subscription");
                        false
                    }
                });
            }

            if let Some(log) = inner.log.as_mut() {
                log.extend(messages.into_iter().map(|message| (topic.to_string(), message)));
            }
            Ok(())
        });

        Box::pin(future::ready(result))
    }
}

impl Subscriber for InProcessBus {
    fn subscribe<'a>(
        &'a self,
        consumer_group: &'a str,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + 'a>> {
        let result = self.lock().and_then(|mut inner| {
            if inner.closed {
                return Err(BusError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: "bus closed".to_string(),
                });
            }

            let (sender, mut receiver) = mpsc::unbounded_channel();
            inner
                .subscriptions
                .entry(topic.to_string())
                .or_default()
                .insert(consumer_group.to_string(), sender);

            let stream: MessageStream = Box::pin(async_stream::stream! {
                while let Some(message) = receiver.recv().await {
                    yield Ok(message);
                }
            });
            Ok(stream)
        });

        Box::pin(future::ready(result))
    }
}
