//! The task store seam.
//!
//! The API server and the worker pool never share memory; they coordinate
//! only through a [`TaskStore`] (and the relay). The durable implementation
//! lives in `rarcrack-db`; [`MemoryTaskStore`] backs tests and
//! single-process setups.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::task::{NewTask, Task, TaskStatus, TaskUpdate, PROGRESS_COMPLETE};
use crate::types::DbId;

/// Errors surfaced by a task store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Task {0} not found")]
    NotFound(DbId),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Create/read/update-by-id access to task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task in `pending` status.
    async fn create(&self, input: &NewTask) -> Result<Task, StoreError>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<Task>, StoreError>;

    /// Atomically claim the oldest unclaimed pending task.
    ///
    /// The task stays `pending`; the claim only guarantees that no other
    /// worker picks it up.
    async fn claim_next_pending(&self) -> Result<Option<Task>, StoreError>;

    /// Apply an update to a non-terminal task.
    ///
    /// Progress never decreases. Terminal updates pin progress to 100 and
    /// set `result`. Returns `Ok(false)` when the task is already terminal
    /// and the write was ignored.
    async fn update(&self, id: DbId, update: &TaskUpdate) -> Result<bool, StoreError>;

    /// Refresh the claim timestamp of tasks the caller is still running.
    ///
    /// Terminal and unknown ids are skipped.
    async fn renew_claims(&self, ids: &[DbId]) -> Result<(), StoreError>;

    /// Fail every non-terminal task whose claim is older than `lease`.
    ///
    /// Such a task was claimed by a worker that stopped renewing it. Each
    /// one is moved to `failed` with `reason` as its result; the updated
    /// tasks are returned.
    async fn fail_stale_claims(&self, lease: Duration, reason: &str)
        -> Result<Vec<Task>, StoreError>;
}

struct Entry {
    task: Task,
    claimed_at: Option<Instant>,
}

/// In-process [`TaskStore`] backed by a `BTreeMap`.
#[derive(Default)]
pub struct MemoryTaskStore {
    entries: RwLock<BTreeMap<DbId, Entry>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, input: &NewTask) -> Result<Task, StoreError> {
        let mut entries = self.entries.write().await;
        let id = entries.keys().next_back().map_or(1, |last| last + 1);
        let now = chrono::Utc::now();
        let task = Task {
            id,
            charset: input.charset.clone(),
            max_length: input.max_length,
            artifact_path: input.artifact_path.clone(),
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            created_at: now,
            updated_at: now,
        };
        entries.insert(
            id,
            Entry {
                task: task.clone(),
                claimed_at: None,
            },
        );
        Ok(task)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Task>, StoreError> {
        Ok(self.entries.read().await.get(&id).map(|e| e.task.clone()))
    }

    async fn claim_next_pending(&self) -> Result<Option<Task>, StoreError> {
        let mut entries = self.entries.write().await;
        let next = entries
            .values_mut()
            .find(|e| e.claimed_at.is_none() && e.task.status == TaskStatus::Pending);
        Ok(next.map(|entry| {
            entry.claimed_at = Some(Instant::now());
            entry.task.clone()
        }))
    }

    async fn update(&self, id: DbId, update: &TaskUpdate) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let task = &mut entry.task;

        if task.status.is_terminal() {
            return Ok(false);
        }

        task.status = update.status;
        if update.status.is_terminal() {
            task.progress = PROGRESS_COMPLETE;
            task.result = update.result.clone();
        } else {
            task.progress = task.progress.max(update.progress);
        }
        task.updated_at = chrono::Utc::now();
        Ok(true)
    }

    async fn renew_claims(&self, ids: &[DbId]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        for id in ids {
            if let Some(entry) = entries.get_mut(id) {
                if entry.claimed_at.is_some() && !entry.task.status.is_terminal() {
                    entry.claimed_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn fail_stale_claims(
        &self,
        lease: Duration,
        reason: &str,
    ) -> Result<Vec<Task>, StoreError> {
        let mut entries = self.entries.write().await;
        let mut failed = Vec::new();
        for entry in entries.values_mut() {
            let stale = entry.claimed_at.is_some_and(|at| at.elapsed() > lease);
            if !stale || entry.task.status.is_terminal() {
                continue;
            }
            let task = &mut entry.task;
            task.status = TaskStatus::Failed;
            task.progress = PROGRESS_COMPLETE;
            task.result = Some(reason.to_string());
            task.updated_at = chrono::Utc::now();
            failed.push(task.clone());
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn new_task(charset: &str) -> NewTask {
        NewTask {
            charset: charset.to_string(),
            max_length: 2,
            artifact_path: "/tmp/a.rar".to_string(),
        }
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids_in_pending() {
        let store = MemoryTaskStore::new();
        let a = store.create(&new_task("ab")).await.unwrap();
        let b = store.create(&new_task("cd")).await.unwrap();

        assert!(b.id > a.id);
        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(a.progress, 0);
        assert!(a.result.is_none());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let store = MemoryTaskStore::new();
        let task = store.create(&new_task("ab")).await.unwrap();

        store.update(task.id, &TaskUpdate::running(40)).await.unwrap();
        store.update(task.id, &TaskUpdate::running(10)).await.unwrap();

        let found = store.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Running);
        assert_eq!(found.progress, 40);
    }

    #[tokio::test]
    async fn terminal_status_is_final() {
        let store = MemoryTaskStore::new();
        let task = store.create(&new_task("ab")).await.unwrap();

        let applied = store
            .update(task.id, &TaskUpdate::completed(Some("ba".into())))
            .await
            .unwrap();
        assert!(applied);

        let ignored = store
            .update(task.id, &TaskUpdate::failed("late failure"))
            .await
            .unwrap();
        assert!(!ignored);

        let found = store.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Completed);
        assert_eq!(found.progress, 100);
        assert_eq!(found.result.as_deref(), Some("ba"));
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let store = MemoryTaskStore::new();
        assert_matches!(
            store.update(99, &TaskUpdate::running(1)).await,
            Err(StoreError::NotFound(99))
        );
    }

    #[tokio::test]
    async fn claim_hands_out_each_pending_task_once() {
        let store = MemoryTaskStore::new();
        let first = store.create(&new_task("ab")).await.unwrap();
        let second = store.create(&new_task("cd")).await.unwrap();

        let c1 = store.claim_next_pending().await.unwrap().unwrap();
        let c2 = store.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(c1.id, first.id);
        assert_eq!(c2.id, second.id);
        assert!(store.claim_next_pending().await.unwrap().is_none());

        // Claiming does not change the status.
        let found = store.find_by_id(first.id).await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn stale_claims_are_failed_once() {
        let store = MemoryTaskStore::new();
        let abandoned = store.create(&new_task("ab")).await.unwrap();
        let unclaimed = store.create(&new_task("cd")).await.unwrap();
        store.claim_next_pending().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let failed = store
            .fail_stale_claims(Duration::from_millis(10), "worker lost")
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, abandoned.id);
        assert_eq!(failed[0].status, TaskStatus::Failed);
        assert_eq!(failed[0].progress, 100);
        assert_eq!(failed[0].result.as_deref(), Some("worker lost"));

        let untouched = store.find_by_id(unclaimed.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, TaskStatus::Pending);

        let again = store
            .fail_stale_claims(Duration::from_millis(10), "worker lost")
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn renewed_claims_survive_the_sweep() {
        let store = MemoryTaskStore::new();
        let task = store.create(&new_task("ab")).await.unwrap();
        store.claim_next_pending().await.unwrap();
        store.update(task.id, &TaskUpdate::running(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        store.renew_claims(&[task.id, 404]).await.unwrap();
        let failed = store
            .fail_stale_claims(Duration::from_millis(50), "worker lost")
            .await
            .unwrap();

        assert!(failed.is_empty());
        let found = store.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn finished_tasks_are_never_swept() {
        let store = MemoryTaskStore::new();
        let task = store.create(&new_task("ab")).await.unwrap();
        store.claim_next_pending().await.unwrap();
        store
            .update(task.id, &TaskUpdate::completed(Some("ba".into())))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let failed = store.fail_stale_claims(Duration::ZERO, "worker lost").await.unwrap();

        assert!(failed.is_empty());
        let found = store.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Completed);
    }
}
