//! Progress reporting: persist first, then publish.
//!
//! Reporting is best effort. Store and relay failures are logged and never
//! unwind into the search, with one exception: terminal writes are retried
//! so a job is not stranded in a non-terminal status.

use std::sync::Arc;
use std::time::Duration;

use rarcrack_core::job_events::JobEvent;
use rarcrack_core::store::{StoreError, TaskStore};
use rarcrack_core::task::TaskUpdate;
use rarcrack_core::types::DbId;
use rarcrack_events::RelayPublisher;
use tokio::runtime::Handle;

use crate::enumerator::{ProgressSink, ProgressUpdate};

/// Attempts made for a terminal store write before giving up.
pub const TERMINAL_WRITE_ATTEMPTS: u32 = 3;

/// Pause between two terminal write attempts.
pub const TERMINAL_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Writes task updates to the store and publishes the matching events.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn TaskStore>,
    relay: Arc<dyn RelayPublisher>,
    terminal_attempts: u32,
    retry_delay: Duration,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn TaskStore>, relay: Arc<dyn RelayPublisher>) -> Self {
        Self {
            store,
            relay,
            terminal_attempts: TERMINAL_WRITE_ATTEMPTS,
            retry_delay: TERMINAL_RETRY_DELAY,
        }
    }

    /// Override the terminal write retry policy. `attempts` is at least 1.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.terminal_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Apply `update` to the task, then publish `event` on the job's topic.
    ///
    /// Never fails. The event is published even when the store write did
    /// not go through.
    pub async fn report(&self, job_id: DbId, update: TaskUpdate, event: JobEvent) {
        self.persist(job_id, &update).await;
        self.announce(&event).await;
    }

    /// Publish `event` without touching the store.
    pub async fn announce(&self, event: &JobEvent) {
        if let Err(e) = self.relay.publish(event).await {
            tracing::warn!(
                job_id = event.job_id(),
                kind = event.kind(),
                error = %e,
                "Failed to publish job event",
            );
        }
    }

    async fn persist(&self, job_id: DbId, update: &TaskUpdate) {
        let attempts = if update.status.is_terminal() {
            self.terminal_attempts
        } else {
            1
        };

        for attempt in 1..=attempts {
            match self.store.update(job_id, update).await {
                Ok(true) => return,
                Ok(false) => {
                    tracing::warn!(
                        job_id,
                        status = %update.status,
                        "Task already terminal, update ignored",
                    );
                    return;
                }
                Err(StoreError::NotFound(_)) => {
                    tracing::error!(job_id, "Task vanished from the store, update dropped");
                    return;
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        job_id,
                        attempt,
                        error = %e,
                        "Terminal task write failed, retrying",
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        job_id,
                        status = %update.status,
                        attempts,
                        error = %e,
                        "Failed to persist task update",
                    );
                }
            }
        }
    }

    pub async fn started(&self, job_id: DbId, charset_size: usize, max_length: u8) {
        let event = JobEvent::Started {
            job_id,
            charset_size,
            max_length,
        };
        self.report(job_id, TaskUpdate::running(0), event).await;
    }

    pub async fn progress(&self, job_id: DbId, update: ProgressUpdate) {
        let task_update = TaskUpdate::running(update.progress);
        let event = JobEvent::Progress {
            job_id,
            progress: update.progress,
            current_candidate: update.current_candidate,
            candidates_per_second: update.candidates_per_second,
        };
        self.report(job_id, task_update, event).await;
    }

    pub async fn completed(&self, job_id: DbId, password: Option<String>, elapsed: Duration) {
        let event = JobEvent::completed(job_id, password.clone(), elapsed);
        self.report(job_id, TaskUpdate::completed(password), event)
            .await;
    }

    pub async fn failed(&self, job_id: DbId, error: &str, elapsed: Duration) {
        let event = JobEvent::failed(job_id, error, elapsed);
        self.report(job_id, TaskUpdate::failed(error), event).await;
    }
}

/// [`ProgressSink`] for an enumerator running on a blocking thread.
///
/// Each callback blocks the search thread until the report is written,
/// which keeps store updates in call order.
pub struct BlockingReporter {
    handle: Handle,
    reporter: ProgressReporter,
    job_id: DbId,
}

impl BlockingReporter {
    /// Must be called from outside the runtime's async context, e.g. inside
    /// `spawn_blocking`.
    pub fn new(handle: Handle, reporter: ProgressReporter, job_id: DbId) -> Self {
        Self {
            handle,
            reporter,
            job_id,
        }
    }
}

impl ProgressSink for BlockingReporter {
    fn started(&mut self, charset_size: usize, max_length: u8) {
        self.handle
            .block_on(self.reporter.started(self.job_id, charset_size, max_length));
    }

    fn progress(&mut self, update: ProgressUpdate) {
        self.handle
            .block_on(self.reporter.progress(self.job_id, update));
    }

    fn completed(&mut self, password: Option<&str>, elapsed: Duration) {
        self.handle.block_on(self.reporter.completed(
            self.job_id,
            password.map(str::to_string),
            elapsed,
        ));
    }

    fn failed(&mut self, error: &str, elapsed: Duration) {
        self.handle
            .block_on(self.reporter.failed(self.job_id, error, elapsed));
    }
}
