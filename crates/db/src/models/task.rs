//! Row model for the `tasks` table.

use rarcrack_core::store::StoreError;
use rarcrack_core::task::{Task, TaskStatus};
use rarcrack_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A row from the `tasks` table.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: DbId,
    pub charset: String,
    pub max_length: i16,
    pub artifact_path: String,
    pub status_id: i16,
    pub progress: i16,
    pub result: Option<String>,
    /// Set once a worker has taken ownership of the task.
    pub claimed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_id(row.status_id).ok_or_else(|| {
            StoreError::Backend(format!(
                "Task {} has unknown status_id {}",
                row.id, row.status_id
            ))
        })?;

        Ok(Task {
            id: row.id,
            charset: row.charset,
            max_length: u8::try_from(row.max_length).map_err(|_| {
                StoreError::Backend(format!(
                    "Task {} has out-of-range max_length {}",
                    row.id, row.max_length
                ))
            })?,
            artifact_path: row.artifact_path,
            status,
            progress: row.progress.clamp(0, 100) as u8,
            result: row.result,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status_id: i16) -> TaskRow {
        let now = chrono::Utc::now();
        TaskRow {
            id: 7,
            charset: "ab".into(),
            max_length: 2,
            artifact_path: "/tmp/x.rar".into(),
            status_id,
            progress: 55,
            result: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn converts_known_status() {
        let task = Task::try_from(row(2)).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.progress, 55);
        assert_eq!(task.max_length, 2);
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(Task::try_from(row(42)).is_err());
    }
}
