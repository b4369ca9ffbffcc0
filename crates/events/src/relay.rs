//! Relay seams: topics, the wire envelope, and the publish/subscribe traits.

use std::fmt;

use async_trait::async_trait;
use rarcrack_core::job_events::JobEvent;
use rarcrack_core::types::DbId;
use serde::{Deserialize, Serialize};

/// Prefix of every job topic name.
const TOPIC_PREFIX: &str = "rarcrack_job_";

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// Relay routing key. There is exactly one topic per job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn for_job(job_id: DbId) -> Self {
        Self(format!("{TOPIC_PREFIX}{job_id}"))
    }

    /// Rebuild a topic from a raw channel name received from the backend.
    pub fn from_channel(channel: &str) -> Self {
        Self(channel.to_string())
    }

    /// The job this topic routes, if the name is well formed.
    pub fn job_id(&self) -> Option<DbId> {
        self.0.strip_prefix(TOPIC_PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Payload carried on the wire: the event plus the job it was published
/// for, so receivers can reject misrouted messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub job_id: DbId,
    pub event: JobEvent,
}

impl RelayEnvelope {
    pub fn new(event: JobEvent) -> Self {
        Self {
            job_id: event.job_id(),
            event,
        }
    }

    pub fn encode(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Codec(e.to_string()))
    }
}

/// A raw message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    pub topic: Topic,
    pub payload: String,
}

impl RelayMessage {
    /// Decode the envelope and check it was published for this topic.
    pub fn decode(&self) -> Result<JobEvent, RelayError> {
        let envelope: RelayEnvelope =
            serde_json::from_str(&self.payload).map_err(|e| RelayError::Codec(e.to_string()))?;

        if self.topic.job_id() != Some(envelope.job_id)
            || envelope.event.job_id() != envelope.job_id
        {
            return Err(RelayError::TopicMismatch {
                topic: self.topic.clone(),
                job_id: envelope.job_id,
            });
        }
        Ok(envelope.event)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by relay backends.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Establishing a subscriber connection failed.
    #[error("Relay connection failed: {0}")]
    Connect(String),

    /// An established subscriber connection dropped.
    #[error("Relay connection lost: {0}")]
    Disconnected(String),

    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: Topic, reason: String },

    #[error("Failed to (un)subscribe {topic}: {reason}")]
    Subscribe { topic: Topic, reason: String },

    #[error("Relay payload could not be encoded or decoded: {0}")]
    Codec(String),

    #[error("Message on {topic} was published for job {job_id}")]
    TopicMismatch { topic: Topic, job_id: DbId },
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Publishing side of the relay. One publisher instance may serve many jobs.
#[async_trait]
pub trait RelayPublisher: Send + Sync {
    /// Publish an event on the topic of its job.
    async fn publish(&self, event: &JobEvent) -> Result<(), RelayError>;
}

/// Opens subscriber connections. Used again after every disconnect.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RelaySubscription>, RelayError>;
}

/// One live subscriber connection.
///
/// `next_message` must be cancel-safe: the gateway races it against its
/// command channel and drops the pending future when a command arrives.
#[async_trait]
pub trait RelaySubscription: Send {
    /// Start receiving messages for `topic`. Subscribing twice is a no-op.
    async fn subscribe(&mut self, topic: &Topic) -> Result<(), RelayError>;

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), RelayError>;

    /// Wait for the next message on any subscribed topic.
    ///
    /// An error means the connection is broken and must be replaced.
    async fn next_message(&mut self) -> Result<RelayMessage, RelayError>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn topic_round_trips_job_id() {
        let topic = Topic::for_job(42);
        assert_eq!(topic.as_str(), "rarcrack_job_42");
        assert_eq!(topic.job_id(), Some(42));
        assert_eq!(Topic::from_channel("other_42").job_id(), None);
    }

    #[test]
    fn decode_accepts_matching_envelope() {
        let event = JobEvent::completed(5, Some("pw".into()), Duration::from_secs(2));
        let message = RelayMessage {
            topic: Topic::for_job(5),
            payload: RelayEnvelope::new(event.clone()).encode().unwrap(),
        };
        assert_eq!(message.decode().unwrap(), event);
    }

    #[test]
    fn decode_rejects_misrouted_envelope() {
        let event = JobEvent::failed(6, "boom", Duration::ZERO);
        let message = RelayMessage {
            topic: Topic::for_job(5),
            payload: RelayEnvelope::new(event).encode().unwrap(),
        };
        assert_matches!(
            message.decode(),
            Err(RelayError::TopicMismatch { job_id: 6, .. })
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        let message = RelayMessage {
            topic: Topic::for_job(1),
            payload: "not json".into(),
        };
        assert_matches!(message.decode(), Err(RelayError::Codec(_)));
    }
}
