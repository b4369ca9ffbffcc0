//! Per-job WebSocket fan-out on top of the relay.
//!
//! Two background tasks back a [`SubscriptionGateway`]:
//!
//! * the **listener** owns the one relay connection. It applies
//!   subscribe/unsubscribe commands, forwards received messages, and when
//!   the connection breaks runs the `connected -> reconnecting -> connected`
//!   cycle with exponential backoff, resubscribing every tracked topic.
//! * the **delivery** task decodes relay messages and fans them out to the
//!   connections attached to the job.
//!
//! The registry (job id -> connections) sits behind one async mutex.
//! `attach`/`detach` hold it while waiting for the listener to acknowledge
//! a (un)subscribe. The listener never takes the lock, so this cannot
//! deadlock, and a job's first subscription completes before any second
//! connection for that job is admitted.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use axum::body::Bytes;
use axum::extract::ws::Message;
use rarcrack_core::types::DbId;
use rarcrack_events::{
    Backoff, ReconnectConfig, RelayConnector, RelayError, RelayMessage, RelaySubscription, Topic,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// Health of the gateway's relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connected,
    /// Waiting to retry; `attempt` counts failed reconnects in this outage.
    Reconnecting { attempt: u32 },
    /// The gateway was shut down.
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Subscription gateway is shut down")]
    Stopped,
}

/// A registered connection. `receiver` yields the frames to write to the
/// client socket; it ends when the gateway drops the connection.
#[derive(Debug)]
pub struct Attachment {
    pub job_id: DbId,
    pub conn_id: String,
    pub receiver: mpsc::UnboundedReceiver<Message>,
}

enum Command {
    Subscribe(Topic, oneshot::Sender<()>),
    Unsubscribe(Topic, oneshot::Sender<()>),
}

/// Job id -> (connection id -> sender).
type Registry = HashMap<DbId, HashMap<String, WsSender>>;

struct Workers {
    listener: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

/// Routes relay events for a job to every WebSocket attached to that job.
pub struct SubscriptionGateway {
    registry: Arc<Mutex<Registry>>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<RelayState>,
    cancel: CancellationToken,
    workers: StdMutex<Option<Workers>>,
}

impl SubscriptionGateway {
    /// Spawn the listener and delivery tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(connector: Arc<dyn RelayConnector>, reconnect: ReconnectConfig) -> Self {
        let registry: Arc<Mutex<Registry>> = Arc::default();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RelayState::Reconnecting { attempt: 0 });
        let cancel = CancellationToken::new();

        let listener = tokio::spawn(
            Listener {
                connector,
                reconnect,
                commands: commands_rx,
                messages: messages_tx,
                state: state_tx,
                cancel: cancel.clone(),
                tracked: BTreeSet::new(),
            }
            .run(),
        );
        let delivery = tokio::spawn(deliver(
            Arc::clone(&registry),
            commands_tx.clone(),
            messages_rx,
        ));

        Self {
            registry,
            commands: commands_tx,
            state: state_rx,
            cancel,
            workers: StdMutex::new(Some(Workers { listener, delivery })),
        }
    }

    /// Register a new connection for `job_id`.
    ///
    /// The first connection of a job subscribes the job's topic before
    /// this returns.
    pub async fn attach(&self, job_id: DbId) -> Result<Attachment, GatewayError> {
        let mut registry = self.registry.lock().await;
        if self.cancel.is_cancelled() {
            return Err(GatewayError::Stopped);
        }

        if !registry.contains_key(&job_id) {
            request(&self.commands, Command::Subscribe, Topic::for_job(job_id)).await?;
            tracing::debug!(job_id, "Subscribed job topic");
        }

        let conn_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .entry(job_id)
            .or_default()
            .insert(conn_id.clone(), tx);

        Ok(Attachment {
            job_id,
            conn_id,
            receiver: rx,
        })
    }

    /// Remove a connection. The last connection of a job unsubscribes the
    /// job's topic. Unknown ids are a no-op.
    pub async fn detach(&self, job_id: DbId, conn_id: &str) {
        let mut registry = self.registry.lock().await;
        let Some(conns) = registry.get_mut(&job_id) else {
            return;
        };
        conns.remove(conn_id);
        if conns.is_empty() {
            registry.remove(&job_id);
            release(&self.commands, job_id).await;
        }
    }

    /// Number of attached connections across all jobs.
    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.values().map(HashMap::len).sum()
    }

    /// Number of jobs with at least one attached connection; equal to the
    /// number of subscribed topics.
    pub async fn tracked_job_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub fn relay_state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Watch relay state transitions.
    pub fn watch_relay_state(&self) -> watch::Receiver<RelayState> {
        self.state.clone()
    }

    /// Send a Ping frame to every attached connection.
    pub async fn ping_all(&self) {
        let registry = self.registry.lock().await;
        for sender in registry.values().flat_map(|conns| conns.values()) {
            let _ = sender.send(Message::Ping(Bytes::new()));
        }
    }

    /// Close every connection, drop every subscription, and stop the
    /// background tasks. Later `attach` calls fail with
    /// [`GatewayError::Stopped`].
    pub async fn shutdown(&self) {
        {
            let mut registry = self.registry.lock().await;
            let count: usize = registry.values().map(HashMap::len).sum();
            for sender in registry.values().flat_map(|conns| conns.values()) {
                let _ = sender.send(Message::Close(None));
            }
            registry.clear();
            self.cancel.cancel();
            tracing::info!(count, "Closed all WebSocket subscriptions");
        }

        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(Workers { listener, delivery }) = workers {
            if let Err(e) = listener.await {
                tracing::error!(error = %e, "Relay listener task failed");
            }
            if let Err(e) = delivery.await {
                tracing::error!(error = %e, "Delivery task failed");
            }
        }
    }
}

impl Drop for SubscriptionGateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Send a command to the listener and wait until it has been applied.
async fn request(
    commands: &mpsc::UnboundedSender<Command>,
    make: fn(Topic, oneshot::Sender<()>) -> Command,
    topic: Topic,
) -> Result<(), GatewayError> {
    let (ack_tx, ack_rx) = oneshot::channel();
    commands
        .send(make(topic, ack_tx))
        .map_err(|_| GatewayError::Stopped)?;
    ack_rx.await.map_err(|_| GatewayError::Stopped)
}

/// Unsubscribe the topic of a job nobody watches anymore.
async fn release(commands: &mpsc::UnboundedSender<Command>, job_id: DbId) {
    // A stopped listener has already dropped every subscription.
    if request(commands, Command::Unsubscribe, Topic::for_job(job_id))
        .await
        .is_ok()
    {
        tracing::debug!(job_id, "Unsubscribed job topic");
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Decode a relay message into the job it targets and the client frame.
fn render(message: &RelayMessage) -> Option<(DbId, String)> {
    let event = match message.decode() {
        Ok(event) => event,
        Err(e @ RelayError::TopicMismatch { .. }) => {
            tracing::error!(error = %e, "Dropping misrouted relay message");
            return None;
        }
        Err(e) => {
            tracing::warn!(topic = %message.topic, error = %e, "Dropping undecodable relay message");
            return None;
        }
    };

    match serde_json::to_string(&event) {
        Ok(text) => Some((event.job_id(), text)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize job event");
            None
        }
    }
}

async fn deliver(
    registry: Arc<Mutex<Registry>>,
    commands: mpsc::UnboundedSender<Command>,
    mut messages: mpsc::UnboundedReceiver<RelayMessage>,
) {
    while let Some(message) = messages.recv().await {
        let Some((job_id, text)) = render(&message) else {
            continue;
        };

        let mut registry = registry.lock().await;
        let Some(conns) = registry.get_mut(&job_id) else {
            continue;
        };

        let frame = Message::Text(text.into());
        let mut broken = Vec::new();
        for (conn_id, sender) in conns.iter() {
            if sender.send(frame.clone()).is_err() {
                broken.push(conn_id.clone());
            }
        }

        for conn_id in &broken {
            conns.remove(conn_id);
            tracing::debug!(job_id, conn_id = %conn_id, "Detached broken connection");
        }
        if conns.is_empty() {
            registry.remove(&job_id);
            release(&commands, job_id).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

enum Step {
    Stop,
    Command(Command),
    Message(RelayMessage),
    Broken(RelayError),
    Retry,
}

struct Listener {
    connector: Arc<dyn RelayConnector>,
    reconnect: ReconnectConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    messages: mpsc::UnboundedSender<RelayMessage>,
    state: watch::Sender<RelayState>,
    cancel: CancellationToken,
    /// Topics that must be subscribed whenever a connection exists.
    tracked: BTreeSet<Topic>,
}

impl Listener {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.reconnect.clone());
        // Deadline of the next reconnect attempt; only meaningful while `link` is `None`.
        let mut retry_at = Instant::now() + backoff.delay();
        let mut link = match self.connect().await {
            Ok(sub) => Some(sub),
            Err(e) => {
                tracing::warn!(error = %e, "Relay unavailable at startup, will retry");
                None
            }
        };

        loop {
            let step = match link.as_mut() {
                Some(sub) => tokio::select! {
                    _ = self.cancel.cancelled() => Step::Stop,
                    cmd = self.commands.recv() => cmd.map_or(Step::Stop, Step::Command),
                    msg = sub.next_message() => match msg {
                        Ok(message) => Step::Message(message),
                        Err(e) => Step::Broken(e),
                    },
                },
                None => tokio::select! {
                    _ = self.cancel.cancelled() => Step::Stop,
                    cmd = self.commands.recv() => cmd.map_or(Step::Stop, Step::Command),
                    _ = tokio::time::sleep_until(retry_at) => Step::Retry,
                },
            };

            match step {
                Step::Stop => break,
                Step::Message(message) => {
                    let _ = self.messages.send(message);
                }
                Step::Command(cmd) => {
                    if let Err(e) = self.apply(cmd, link.as_mut()).await {
                        tracing::warn!(error = %e, "Relay connection lost");
                        link = None;
                        backoff = Backoff::new(self.reconnect.clone());
                        retry_at = Instant::now() + backoff.delay();
                        self.state.send_replace(RelayState::Reconnecting { attempt: 0 });
                    }
                }
                Step::Broken(e) => {
                    tracing::warn!(error = %e, "Relay connection lost");
                    link = None;
                    backoff = Backoff::new(self.reconnect.clone());
                    retry_at = Instant::now() + backoff.delay();
                    self.state.send_replace(RelayState::Reconnecting { attempt: 0 });
                }
                Step::Retry => match self.connect().await {
                    Ok(sub) => {
                        tracing::info!(
                            attempt = backoff.attempt() + 1,
                            topics = self.tracked.len(),
                            "Relay reconnected, topics resubscribed",
                        );
                        link = Some(sub);
                    }
                    Err(e) => {
                        backoff.fail();
                        retry_at = Instant::now() + backoff.delay();
                        tracing::warn!(
                            attempt = backoff.attempt(),
                            retry_in_ms = backoff.delay().as_millis() as u64,
                            error = %e,
                            "Relay reconnect failed",
                        );
                        self.state.send_replace(RelayState::Reconnecting {
                            attempt: backoff.attempt(),
                        });
                    }
                },
            }
        }

        if let Some(mut sub) = link {
            for topic in &self.tracked {
                if let Err(e) = sub.unsubscribe(topic).await {
                    tracing::debug!(%topic, error = %e, "Unsubscribe during shutdown failed");
                    break;
                }
            }
        }
        self.tracked.clear();
        self.state.send_replace(RelayState::Stopped);
        tracing::info!("Relay listener stopped");
    }

    /// Open a connection and subscribe every tracked topic on it.
    async fn connect(&self) -> Result<Box<dyn RelaySubscription>, RelayError> {
        let mut sub = self.connector.connect().await?;
        for topic in &self.tracked {
            sub.subscribe(topic).await?;
        }
        self.state.send_replace(RelayState::Connected);
        Ok(sub)
    }

    /// Update the tracked set and mirror the change on the live connection.
    ///
    /// The command is acknowledged either way: a tracked topic is picked up
    /// by the next successful reconnect. An error means the connection
    /// broke.
    async fn apply(
        &mut self,
        cmd: Command,
        link: Option<&mut Box<dyn RelaySubscription>>,
    ) -> Result<(), RelayError> {
        let (result, ack) = match cmd {
            Command::Subscribe(topic, ack) => {
                let result = match link {
                    Some(sub) => sub.subscribe(&topic).await,
                    None => Ok(()),
                };
                self.tracked.insert(topic);
                (result, ack)
            }
            Command::Unsubscribe(topic, ack) => {
                let result = match link {
                    Some(sub) => sub.unsubscribe(&topic).await,
                    None => Ok(()),
                };
                self.tracked.remove(&topic);
                (result, ack)
            }
        };
        let _ = ack.send(());
        result
    }
}
