//! Live notification events for a running search job.
//!
//! Events are transient: they are relayed to whoever is subscribed at
//! publish time and never persisted. The `type` tag doubles as the
//! WebSocket message type seen by clients.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::DbId;

/// Search started (charset size + max length).
pub const MSG_TYPE_JOB_STARTED: &str = "job_started";

/// Progress update during enumeration.
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";

/// Search finished; `result` is null when the space was exhausted.
pub const MSG_TYPE_JOB_COMPLETED: &str = "job_completed";

/// Search aborted by a verifier error or cancellation.
pub const MSG_TYPE_JOB_FAILED: &str = "job_failed";

/// A notification produced by the progress reporter of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    #[serde(rename = "job_started")]
    Started {
        job_id: DbId,
        charset_size: usize,
        max_length: u8,
    },

    #[serde(rename = "job_progress")]
    Progress {
        job_id: DbId,
        /// Completion percentage (0-100).
        progress: u8,
        /// Most recently tested candidate.
        current_candidate: String,
        /// Candidates tested per second since the previous report.
        candidates_per_second: f64,
    },

    #[serde(rename = "job_completed")]
    Completed {
        job_id: DbId,
        result: Option<String>,
        /// Wall-clock search time as `HH:MM:SS`.
        elapsed: String,
        elapsed_ms: u64,
    },

    #[serde(rename = "job_failed")]
    Failed {
        job_id: DbId,
        error: String,
        elapsed: String,
        elapsed_ms: u64,
    },
}

impl JobEvent {
    pub fn completed(job_id: DbId, result: Option<String>, elapsed: Duration) -> Self {
        Self::Completed {
            job_id,
            result,
            elapsed: format_elapsed(elapsed),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn failed(job_id: DbId, error: impl Into<String>, elapsed: Duration) -> Self {
        Self::Failed {
            job_id,
            error: error.into(),
            elapsed: format_elapsed(elapsed),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// The job this event belongs to.
    pub fn job_id(&self) -> DbId {
        match self {
            Self::Started { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }

    /// Message type tag, identical to the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => MSG_TYPE_JOB_STARTED,
            Self::Progress { .. } => MSG_TYPE_JOB_PROGRESS,
            Self::Completed { .. } => MSG_TYPE_JOB_COMPLETED,
            Self::Failed { .. } => MSG_TYPE_JOB_FAILED,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Format a duration as `HH:MM:SS`. Hours are not wrapped at 24.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
