//! Password-recovery task record, status machine, and submission rules.
//!
//! A task is created `pending` by the submission path, moved to `running`
//! by the first progress report, and finishes in exactly one terminal
//! status. Once terminal, `progress` is frozen at 100 and `result` is
//! never rewritten.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Hard cap on candidate length.
pub const MAX_PASSWORD_LENGTH: u8 = 8;

/// Maximum number of characters a charset may contain.
pub const MAX_CHARSET_LEN: usize = 256;

/// Charset used when the submitter does not provide one.
pub const DEFAULT_CHARSET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";

/// Candidate length used when the submitter does not provide one.
pub const DEFAULT_MAX_LENGTH: u8 = 5;

/// Progress value every terminal task carries.
pub const PROGRESS_COMPLETE: u8 = 100;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
///
/// Discriminants match the seed order of the `task_statuses` lookup table.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending = 1,
    Running = 2,
    Completed = 3,
    Failed = 4,
}

impl TaskStatus {
    /// Return the database status ID.
    pub fn id(self) -> i16 {
        self as i16
    }

    /// Map a database status ID back to a status.
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Self::Pending),
            2 => Some(Self::Running),
            3 => Some(Self::Completed),
            4 => Some(Self::Failed),
            _ => None,
        }
    }

    /// `completed` and `failed` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A single brute-force search job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: DbId,
    /// Ordered characters the candidates are drawn from.
    pub charset: String,
    pub max_length: u8,
    /// Location of the uploaded archive the verifier inspects.
    pub artifact_path: String,
    pub status: TaskStatus,
    /// Completion percentage (0-100).
    pub progress: u8,
    /// Found password on `completed`, error summary on `failed`.
    pub result: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Task {
    /// The public status view of this task.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.id,
            status: self.status,
            progress: self.progress,
            result: self.result.clone(),
        }
    }
}

/// Response body of the status query boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: DbId,
    pub status: TaskStatus,
    pub progress: u8,
    pub result: Option<String>,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Parameters for creating a new task in `pending` status.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub charset: String,
    pub max_length: u8,
    pub artifact_path: String,
}

/// A status/progress/result write applied to an existing task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub progress: u8,
    pub result: Option<String>,
}

impl TaskUpdate {
    /// Intermediate progress; moves the task to `running`.
    pub fn running(progress: u8) -> Self {
        Self {
            status: TaskStatus::Running,
            progress: progress.min(PROGRESS_COMPLETE),
            result: None,
        }
    }

    pub fn completed(result: Option<String>) -> Self {
        Self {
            status: TaskStatus::Completed,
            progress: PROGRESS_COMPLETE,
            result,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            progress: PROGRESS_COMPLETE,
            result: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a charset.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_CHARSET_LEN` characters.
pub fn validate_charset(charset: &str) -> Result<(), CoreError> {
    if charset.is_empty() {
        return Err(CoreError::Validation(
            "Charset must not be empty".to_string(),
        ));
    }
    let len = charset.chars().count();
    if len > MAX_CHARSET_LEN {
        return Err(CoreError::Validation(format!(
            "Charset must not exceed {MAX_CHARSET_LEN} characters (got {len})"
        )));
    }
    Ok(())
}

/// Validate the maximum candidate length (1..=`MAX_PASSWORD_LENGTH`).
pub fn validate_max_length(max_length: i64) -> Result<u8, CoreError> {
    if max_length < 1 || max_length > i64::from(MAX_PASSWORD_LENGTH) {
        return Err(CoreError::Validation(format!(
            "max_length must be between 1 and {MAX_PASSWORD_LENGTH} (got {max_length})"
        )));
    }
    Ok(max_length as u8)
}

/// Validate every field of a new task.
pub fn validate_new_task(input: &NewTask) -> Result<(), CoreError> {
    validate_charset(&input.charset)?;
    validate_max_length(i64::from(input.max_length))?;
    if input.artifact_path.trim().is_empty() {
        return Err(CoreError::Validation(
            "Artifact path must not be empty".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
