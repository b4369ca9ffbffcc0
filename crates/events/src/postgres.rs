//! Cross-process relay over PostgreSQL `NOTIFY` / `LISTEN`.
//!
//! Workers publish with `pg_notify(topic, envelope)`; the API server holds
//! one dedicated [`PgListener`] connection and `LISTEN`s on the topics of
//! jobs that currently have WebSocket clients. PostgreSQL delivers a
//! notification to every listening session and keeps nothing for sessions
//! that were not listening, which is exactly the relay's at-most-once
//! fan-out contract.

use async_trait::async_trait;
use rarcrack_core::job_events::JobEvent;
use sqlx::postgres::PgListener;
use sqlx::PgPool;

use crate::relay::{
    RelayConnector, RelayEnvelope, RelayError, RelayMessage, RelayPublisher, RelaySubscription,
    Topic,
};

/// Publishes job events with `pg_notify`.
#[derive(Clone)]
pub struct PgRelayPublisher {
    pool: PgPool,
}

impl PgRelayPublisher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelayPublisher for PgRelayPublisher {
    async fn publish(&self, event: &JobEvent) -> Result<(), RelayError> {
        let topic = Topic::for_job(event.job_id());
        let payload = RelayEnvelope::new(event.clone()).encode()?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic.as_str())
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Publish {
                topic,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Opens dedicated `LISTEN` connections from a pool's connect options.
#[derive(Clone)]
pub struct PgRelayConnector {
    pool: PgPool,
}

impl PgRelayConnector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelayConnector for PgRelayConnector {
    async fn connect(&self) -> Result<Box<dyn RelaySubscription>, RelayError> {
        let listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        tracing::debug!("Opened PostgreSQL relay listener");
        Ok(Box::new(PgSubscription { listener }))
    }
}

/// One `LISTEN` session.
pub struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl RelaySubscription for PgSubscription {
    async fn subscribe(&mut self, topic: &Topic) -> Result<(), RelayError> {
        self.listener
            .listen(topic.as_str())
            .await
            .map_err(|e| RelayError::Subscribe {
                topic: topic.clone(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), RelayError> {
        self.listener
            .unlisten(topic.as_str())
            .await
            .map_err(|e| RelayError::Subscribe {
                topic: topic.clone(),
                reason: e.to_string(),
            })
    }

    async fn next_message(&mut self) -> Result<RelayMessage, RelayError> {
        // `try_recv` yields `None` when the session was lost. The listener
        // would silently reconnect on the next call; the gateway replaces
        // the whole subscription instead so the outage is visible.
        match self.listener.try_recv().await {
            Ok(Some(notification)) => Ok(RelayMessage {
                topic: Topic::from_channel(notification.channel()),
                payload: notification.payload().to_string(),
            }),
            Ok(None) => Err(RelayError::Disconnected(
                "PostgreSQL listener connection closed".into(),
            )),
            Err(e) => Err(RelayError::Disconnected(e.to_string())),
        }
    }
}
