//! Runs one claimed task from start to terminal report.

use std::sync::Arc;
use std::time::Instant;

use rarcrack_core::task::Task;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::enumerator::{EnumerationError, Enumerator, SearchJob, SearchOutcome};
use crate::reporter::{BlockingReporter, ProgressReporter};
use crate::verifier::ArchiveVerifier;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),

    /// The search thread panicked or was aborted before reporting.
    #[error("Search thread crashed: {0}")]
    Crashed(String),
}

/// Executes searches on the blocking thread pool.
#[derive(Clone)]
pub struct JobRunner {
    reporter: ProgressReporter,
    verifier: Arc<dyn ArchiveVerifier>,
    enumerator: Enumerator,
}

impl JobRunner {
    pub fn new(
        reporter: ProgressReporter,
        verifier: Arc<dyn ArchiveVerifier>,
        enumerator: Enumerator,
    ) -> Self {
        Self {
            reporter,
            verifier,
            enumerator,
        }
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    /// Search `task` to completion.
    ///
    /// Whatever happens, the task receives a terminal report.
    pub async fn run(&self, task: Task, cancel: CancellationToken) -> Result<SearchOutcome, JobError> {
        let job = SearchJob::from(&task);
        let job_id = job.job_id;
        let started_at = Instant::now();

        let sink = BlockingReporter::new(Handle::current(), self.reporter.clone(), job_id);
        let verifier = Arc::clone(&self.verifier);
        let enumerator = self.enumerator.clone();

        tracing::info!(
            job_id,
            charset_size = job.charset.chars().count(),
            max_length = job.max_length,
            "Search started",
        );

        let joined = tokio::task::spawn_blocking(move || {
            let mut sink = sink;
            enumerator.run(&job, verifier.as_ref(), &mut sink, &cancel)
        })
        .await;

        match joined {
            Ok(Ok(outcome)) => {
                tracing::info!(
                    job_id,
                    found = outcome.password().is_some(),
                    tested = outcome.tested(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Search finished",
                );
                Ok(outcome)
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id, error = %e, "Search failed");
                Err(e.into())
            }
            Err(e) => {
                let message = format!("Search thread crashed: {e}");
                tracing::error!(job_id, error = %e, "Search thread crashed");
                self.reporter
                    .failed(job_id, &message, started_at.elapsed())
                    .await;
                Err(JobError::Crashed(e.to_string()))
            }
        }
    }
}
