//! Repository for the `tasks` table.
//!
//! Uses `TaskStatus` ids for every status literal. All status writes are
//! guarded by `status_id IN (pending, running)` so a terminal row is never
//! rewritten.

use rarcrack_core::task::{NewTask, TaskStatus};
use rarcrack_core::types::DbId;
use sqlx::PgPool;

use crate::models::task::TaskRow;

/// Column list for `tasks` queries.
const COLUMNS: &str = "\
    id, charset, max_length, artifact_path, status_id, progress, result, \
    claimed_at, created_at, updated_at";

/// Provides create/read/update-by-id for search tasks.
pub struct TaskRepo;

impl TaskRepo {
    /// Insert a new task in `pending` status with zero progress.
    pub async fn create(pool: &PgPool, input: &NewTask) -> Result<TaskRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO tasks (charset, max_length, artifact_path, status_id, progress) \
             VALUES ($1, $2, $3, $4, 0) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(&input.charset)
            .bind(i16::from(input.max_length))
            .bind(&input.artifact_path)
            .bind(TaskStatus::Pending.id())
            .fetch_one(pool)
            .await
    }

    /// Find a task by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<TaskRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM tasks WHERE id = $1");
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Atomically claim the oldest unclaimed pending task.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent worker processes
    /// never claim the same row. The status stays `pending` until the
    /// first progress report.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<TaskRow>, sqlx::Error> {
        let query = format!(
            "UPDATE tasks \
             SET claimed_at = NOW(), updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM tasks \
                 WHERE status_id = $1 AND claimed_at IS NULL \
                 ORDER BY created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(TaskStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Record intermediate progress. Progress only moves forward.
    ///
    /// Returns `false` if the task is missing or already terminal.
    pub async fn update_progress(
        pool: &PgPool,
        id: DbId,
        status: TaskStatus,
        progress: i16,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status_id = $2, progress = GREATEST(progress, $3), updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($4, $5)",
        )
        .bind(id)
        .bind(status.id())
        .bind(progress)
        .bind(TaskStatus::Pending.id())
        .bind(TaskStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a task to a terminal status, pinning progress to 100.
    ///
    /// Returns `false` if the task is missing or already terminal.
    pub async fn finish(
        pool: &PgPool,
        id: DbId,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE tasks \
             SET status_id = $2, progress = 100, result = $3, updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($4, $5)",
        )
        .bind(id)
        .bind(status.id())
        .bind(result)
        .bind(TaskStatus::Pending.id())
        .bind(TaskStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Refresh `claimed_at` on the given non-terminal tasks.
    pub async fn renew_claims(pool: &PgPool, ids: &[DbId]) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET claimed_at = NOW() \
             WHERE id = ANY($1) AND claimed_at IS NOT NULL AND status_id IN ($2, $3)",
        )
        .bind(ids)
        .bind(TaskStatus::Pending.id())
        .bind(TaskStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Fail non-terminal tasks whose claim is older than `lease_ms`.
    pub async fn fail_stale_claims(
        pool: &PgPool,
        lease_ms: i64,
        reason: &str,
    ) -> Result<Vec<TaskRow>, sqlx::Error> {
        let query = format!(
            "UPDATE tasks \
             SET status_id = $1, progress = 100, result = $2, updated_at = NOW() \
             WHERE status_id IN ($3, $4) \
               AND claimed_at IS NOT NULL \
               AND claimed_at < NOW() - ($5::BIGINT * INTERVAL '1 millisecond') \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(TaskStatus::Failed.id())
            .bind(reason)
            .bind(TaskStatus::Pending.id())
            .bind(TaskStatus::Running.id())
            .bind(lease_ms)
            .fetch_all(pool)
            .await
    }

    /// Whether a task row exists.
    pub async fn exists(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
            .bind(id)
            .fetch_one(pool)
            .await
    }
}
