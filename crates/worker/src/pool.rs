//! Background worker pool.
//!
//! Polls the store for pending tasks every `poll_interval` and runs up to
//! `concurrency` searches at once. Claiming goes through
//! [`TaskStore::claim_next_pending`], so several worker processes can share
//! one store without double-running a job.
//!
//! Claims are leases. Every `lease_timeout / 3` the pool renews the claims
//! of its running searches and fails any task whose claim has not been
//! renewed within `lease_timeout`: its worker died without a terminal
//! report.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rarcrack_core::job_events::JobEvent;
use rarcrack_core::store::{StoreError, TaskStore};
use rarcrack_core::types::DbId;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::runner::JobRunner;

/// Default polling interval for the claim loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default time after which an unrenewed claim is considered abandoned.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Result stored on tasks whose worker disappeared.
pub const STALE_CLAIM_MESSAGE: &str = "Search abandoned: worker stopped responding";

/// Ids of tasks this pool is running.
#[derive(Clone, Default)]
struct Leases(Arc<Mutex<HashSet<DbId>>>);

impl Leases {
    fn lock(&self) -> MutexGuard<'_, HashSet<DbId>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hold(&self, id: DbId) -> LeaseGuard {
        self.lock().insert(id);
        LeaseGuard {
            leases: self.clone(),
            id,
        }
    }

    fn ids(&self) -> Vec<DbId> {
        self.lock().iter().copied().collect()
    }
}

/// Releases the lease when the job task ends, including on panic.
struct LeaseGuard {
    leases: Leases,
    id: DbId,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.id);
    }
}

/// Claims pending tasks and runs them with bounded parallelism.
pub struct WorkerPool {
    store: Arc<dyn TaskStore>,
    runner: JobRunner,
    concurrency: usize,
    poll_interval: Duration,
    lease_timeout: Duration,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn TaskStore>, runner: JobRunner, concurrency: usize) -> Self {
        Self {
            store,
            runner,
            concurrency: concurrency.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Run the claim loop until `cancel` fires, then cancel in-flight
    /// searches and wait for their terminal reports.
    pub async fn run(&self, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut running: JoinSet<()> = JoinSet::new();
        let leases = Leases::default();
        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut lease_ticker =
            tokio::time::interval((self.lease_timeout / 3).max(Duration::from_millis(1)));

        tracing::info!(
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            lease_timeout_ms = self.lease_timeout.as_millis() as u64,
            "Worker pool started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(in_flight = running.len(), "Worker pool shutting down");
                    break;
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Job task aborted");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .claim_available(&permits, &leases, &mut running, &cancel)
                        .await
                    {
                        tracing::error!(error = %e, "Claim cycle failed");
                    }
                }
                _ = lease_ticker.tick() => {
                    self.maintain_leases(&leases).await;
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Job task aborted during shutdown");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    /// Claim tasks while there are free permits and pending work.
    async fn claim_available(
        &self,
        permits: &Arc<Semaphore>,
        leases: &Leases,
        running: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        loop {
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                return Ok(());
            };
            let Some(task) = self.store.claim_next_pending().await? else {
                return Ok(());
            };

            tracing::info!(job_id = task.id, "Task claimed");

            let lease = leases.hold(task.id);
            let runner = self.runner.clone();
            let job_cancel = cancel.child_token();
            running.spawn(async move {
                // Errors are already reported and logged by the runner.
                let _ = runner.run(task, job_cancel).await;
                drop(lease);
                drop(permit);
            });
        }
    }

    /// Renew our own claims, then fail tasks abandoned by dead workers.
    async fn maintain_leases(&self, leases: &Leases) {
        let held = leases.ids();
        if let Err(e) = self.store.renew_claims(&held).await {
            tracing::warn!(held = held.len(), error = %e, "Failed to renew task claims");
        }

        let stale = match self
            .store
            .fail_stale_claims(self.lease_timeout, STALE_CLAIM_MESSAGE)
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                tracing::error!(error = %e, "Stale claim sweep failed");
                return;
            }
        };

        for task in stale {
            tracing::warn!(job_id = task.id, "Failed task abandoned by its worker");
            let elapsed = (task.updated_at - task.created_at)
                .to_std()
                .unwrap_or_default();
            let event = JobEvent::failed(task.id, STALE_CLAIM_MESSAGE, elapsed);
            self.runner.reporter().announce(&event).await;
        }
    }
}
