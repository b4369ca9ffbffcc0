//! [`TaskStore`] backed by PostgreSQL.

use std::time::Duration;

use async_trait::async_trait;
use rarcrack_core::store::{StoreError, TaskStore};
use rarcrack_core::task::{NewTask, Task, TaskUpdate};
use rarcrack_core::types::DbId;

use crate::repositories::TaskRepo;
use crate::DbPool;

/// Durable task store. Cheap to clone (the pool is reference counted).
#[derive(Clone)]
pub struct PgTaskStore {
    pool: DbPool,
}

impl PgTaskStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, input: &NewTask) -> Result<Task, StoreError> {
        let row = TaskRepo::create(&self.pool, input).await.map_err(backend)?;
        Task::try_from(row)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Task>, StoreError> {
        TaskRepo::find_by_id(&self.pool, id)
            .await
            .map_err(backend)?
            .map(Task::try_from)
            .transpose()
    }

    async fn claim_next_pending(&self) -> Result<Option<Task>, StoreError> {
        TaskRepo::claim_next(&self.pool)
            .await
            .map_err(backend)?
            .map(Task::try_from)
            .transpose()
    }

    async fn update(&self, id: DbId, update: &TaskUpdate) -> Result<bool, StoreError> {
        let applied = if update.status.is_terminal() {
            TaskRepo::finish(&self.pool, id, update.status, update.result.as_deref()).await
        } else {
            TaskRepo::update_progress(&self.pool, id, update.status, i16::from(update.progress))
                .await
        }
        .map_err(backend)?;

        if applied {
            return Ok(true);
        }

        // Nothing matched: either the row is gone or it is already terminal.
        if TaskRepo::exists(&self.pool, id).await.map_err(backend)? {
            tracing::debug!(task_id = id, status = %update.status, "Ignored write to terminal task");
            Ok(false)
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    async fn renew_claims(&self, ids: &[DbId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        TaskRepo::renew_claims(&self.pool, ids)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn fail_stale_claims(
        &self,
        lease: Duration,
        reason: &str,
    ) -> Result<Vec<Task>, StoreError> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        TaskRepo::fail_stale_claims(&self.pool, lease_ms, reason)
            .await
            .map_err(backend)?
            .into_iter()
            .map(Task::try_from)
            .collect()
    }
}
