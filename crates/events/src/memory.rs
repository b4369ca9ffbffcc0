//! In-process relay backed by one `tokio::sync::broadcast` channel per topic.
//!
//! [`MemoryRelay`] is both a [`RelayPublisher`] and a [`RelayConnector`].
//! It is designed to be cloned freely; clones share the same topics.
//! Connections can be severed on demand and the relay can be marked
//! unreachable, which is how the gateway's reconnection path is exercised
//! without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rarcrack_core::job_events::JobEvent;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::relay::{
    RelayConnector, RelayEnvelope, RelayError, RelayMessage, RelayPublisher, RelaySubscription,
    Topic,
};

/// Default buffer capacity for each topic channel.
const DEFAULT_CAPACITY: usize = 256;

struct Link {
    /// Cancelled to sever every connection opened before the cut.
    severed: CancellationToken,
    available: bool,
}

struct Inner {
    capacity: usize,
    topics: Mutex<HashMap<Topic, broadcast::Sender<String>>>,
    link: Mutex<Link>,
}

impl Inner {
    fn topics(&self) -> MutexGuard<'_, HashMap<Topic, broadcast::Sender<String>>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn receiver_for(&self, topic: &Topic) -> broadcast::Receiver<String> {
        self.topics()
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop the channel of a topic nobody listens to anymore.
    fn prune(&self, topic: &Topic) {
        let mut topics = self.topics();
        if topics.get(topic).is_some_and(|tx| tx.receiver_count() == 0) {
            topics.remove(topic);
        }
    }
}

/// In-process fan-out relay.
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<Inner>,
}

impl MemoryRelay {
    /// Create a relay with a specific per-topic buffer capacity.
    ///
    /// Slow subscribers that fall more than `capacity` messages behind
    /// lose the oldest ones.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                topics: Mutex::new(HashMap::new()),
                link: Mutex::new(Link {
                    severed: CancellationToken::new(),
                    available: true,
                }),
            }),
        }
    }

    /// Number of live subscriptions to `topic` across all connections.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .topics()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of topics with at least one live subscription.
    pub fn active_topic_count(&self) -> usize {
        self.inner
            .topics()
            .values()
            .filter(|tx| tx.receiver_count() > 0)
            .count()
    }

    /// Break every connection opened so far. Their `next_message` calls
    /// return [`RelayError::Disconnected`].
    pub fn sever_connections(&self) {
        let mut link = self.inner.link();
        link.severed.cancel();
        link.severed = CancellationToken::new();
    }

    /// Make subsequent `connect` calls fail (`false`) or succeed (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.link().available = available;
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl RelayPublisher for MemoryRelay {
    async fn publish(&self, event: &JobEvent) -> Result<(), RelayError> {
        let topic = Topic::for_job(event.job_id());
        let payload = RelayEnvelope::new(event.clone()).encode()?;

        if let Some(tx) = self.inner.topics().get(&topic) {
            // A SendError only means there are zero receivers.
            let _ = tx.send(payload);
        }
        Ok(())
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self) -> Result<Box<dyn RelaySubscription>, RelayError> {
        let link = self.inner.link();
        if !link.available {
            return Err(RelayError::Connect("memory relay is unavailable".into()));
        }
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            streams: StreamMap::new(),
            severed: link.severed.clone(),
        }))
    }
}

/// A connection to a [`MemoryRelay`].
pub struct MemorySubscription {
    inner: Arc<Inner>,
    streams: StreamMap<Topic, BroadcastStream<String>>,
    severed: CancellationToken,
}

impl MemorySubscription {
    fn ensure_connected(&self) -> Result<(), RelayError> {
        if self.severed.is_cancelled() {
            return Err(RelayError::Disconnected("memory relay severed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RelaySubscription for MemorySubscription {
    async fn subscribe(&mut self, topic: &Topic) -> Result<(), RelayError> {
        self.ensure_connected()?;
        if !self.streams.contains_key(topic) {
            let rx = self.inner.receiver_for(topic);
            self.streams.insert(topic.clone(), BroadcastStream::new(rx));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), RelayError> {
        self.ensure_connected()?;
        if self.streams.remove(topic).is_some() {
            self.inner.prune(topic);
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Result<RelayMessage, RelayError> {
        let severed = &self.severed;
        let streams = &mut self.streams;

        loop {
            tokio::select! {
                _ = severed.cancelled() => {
                    return Err(RelayError::Disconnected("memory relay severed".into()));
                }
                item = streams.next(), if !streams.is_empty() => match item {
                    Some((topic, Ok(payload))) => return Ok(RelayMessage { topic, payload }),
                    Some((topic, Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                        tracing::warn!(%topic, skipped, "Relay subscriber lagged, messages dropped");
                    }
                    // Senders live as long as the relay, so streams do not end.
                    None => {}
                },
            }
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let topics: Vec<Topic> = self.streams.keys().cloned().collect();
        self.streams.clear();
        for topic in &topics {
            self.inner.prune(topic);
        }
    }
}
