//! Brute-force search over one job's candidate space.
//!
//! The enumerator is synchronous and single threaded per job: it calls the
//! verifier once per candidate and talks to the outside world only through
//! a [`ProgressSink`]. It never touches the store or relay directly.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use rarcrack_core::task::{Task, PROGRESS_COMPLETE};
use rarcrack_core::types::DbId;
use tokio_util::sync::CancellationToken;

use crate::candidates::{search_space_size, CandidateSpace};
use crate::verifier::{ArchiveVerifier, VerifyError};

/// Default minimum spacing between two progress reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Error text reported when a run is cancelled.
pub const CANCELLED_MESSAGE: &str = "Search cancelled: worker shutting down";

#[derive(Debug, Clone)]
pub struct EnumeratorConfig {
    /// Progress is considered for reporting once this much wall-clock time
    /// has passed since the previous report.
    pub report_interval: Duration,
}

impl Default for EnumeratorConfig {
    fn default() -> Self {
        Self {
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

/// Parameters of one search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchJob {
    pub job_id: DbId,
    pub charset: String,
    pub max_length: u8,
    pub artifact_path: PathBuf,
}

impl From<&Task> for SearchJob {
    fn from(task: &Task) -> Self {
        Self {
            job_id: task.id,
            charset: task.charset.clone(),
            max_length: task.max_length,
            artifact_path: PathBuf::from(&task.artifact_path),
        }
    }
}

/// One throttled progress sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Truncated completion percentage.
    pub progress: u8,
    /// Most recently tested candidate.
    pub current_candidate: String,
    /// Candidates tested since the previous report per elapsed second.
    pub candidates_per_second: f64,
}

/// Receives the lifecycle callbacks of one run, in call order.
pub trait ProgressSink {
    fn started(&mut self, charset_size: usize, max_length: u8);

    fn progress(&mut self, update: ProgressUpdate);

    /// `password` is `None` when the space was exhausted.
    fn completed(&mut self, password: Option<&str>, elapsed: Duration);

    fn failed(&mut self, error: &str, elapsed: Duration);
}

/// How a search that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found { password: String, tested: u64 },
    Exhausted { tested: u64 },
}

impl SearchOutcome {
    pub fn tested(&self) -> u64 {
        match self {
            Self::Found { tested, .. } | Self::Exhausted { tested } => *tested,
        }
    }

    pub fn password(&self) -> Option<&str> {
        match self {
            Self::Found { password, .. } => Some(password),
            Self::Exhausted { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnumerationError {
    #[error("Verifier failed on candidate {candidate:?}: {source}")]
    Verifier {
        candidate: String,
        #[source]
        source: VerifyError,
    },

    #[error("Search cancelled after {tested} candidates")]
    Cancelled { tested: u64 },
}

/// Throttling state: ticks drive cancellation checks and sampling, reports
/// only go out when the percentage moves.
struct Cadence {
    interval: Duration,
    total: u128,
    tick_at: Instant,
    report_at: Instant,
    report_tested: u64,
    last_percent: Option<u8>,
}

impl Cadence {
    fn new(interval: Duration, total: u128, now: Instant) -> Self {
        Self {
            interval,
            total,
            tick_at: now,
            report_at: now,
            report_tested: 0,
            last_percent: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        now.duration_since(self.tick_at) >= self.interval
    }

    /// Build a report if the truncated percentage moved since the last one.
    ///
    /// The rate covers everything tested since the previous report, not
    /// just the last tick.
    fn sample(&mut self, now: Instant, tested: u64, candidate: &str) -> Option<ProgressUpdate> {
        self.tick_at = now;

        let percent = (u128::from(tested) * u128::from(PROGRESS_COMPLETE) / self.total) as u8;
        if self.last_percent == Some(percent) {
            return None;
        }

        let secs = now.duration_since(self.report_at).as_secs_f64();
        let delta = tested - self.report_tested;
        self.report_at = now;
        self.report_tested = tested;
        self.last_percent = Some(percent);

        Some(ProgressUpdate {
            progress: percent,
            current_candidate: candidate.to_string(),
            candidates_per_second: if secs > 0.0 { delta as f64 / secs } else { 0.0 },
        })
    }
}

/// Runs searches; one instance can serve any number of jobs.
#[derive(Debug, Clone, Default)]
pub struct Enumerator {
    config: EnumeratorConfig,
}

impl Enumerator {
    pub fn new(config: EnumeratorConfig) -> Self {
        Self { config }
    }

    /// Search `job`'s space shortest first and stop at the first match.
    ///
    /// Exactly one terminal callback (`completed` or `failed`) reaches the
    /// sink. `cancel` is polled on every cadence tick.
    pub fn run(
        &self,
        job: &SearchJob,
        verifier: &dyn ArchiveVerifier,
        sink: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome, EnumerationError> {
        let charset: Vec<char> = job.charset.chars().collect();
        let total = search_space_size(charset.len(), job.max_length).max(1);
        let started_at = Instant::now();
        let mut cadence = Cadence::new(self.config.report_interval, total, started_at);
        let mut tested: u64 = 0;

        sink.started(charset.len(), job.max_length);

        for candidate in CandidateSpace::new(&charset, job.max_length) {
            let matched = match verifier.verify(&job.artifact_path, &candidate) {
                Ok(matched) => matched,
                Err(source) => {
                    let err = EnumerationError::Verifier { candidate, source };
                    sink.failed(&err.to_string(), started_at.elapsed());
                    return Err(err);
                }
            };
            tested += 1;

            if matched {
                sink.completed(Some(&candidate), started_at.elapsed());
                return Ok(SearchOutcome::Found {
                    password: candidate,
                    tested,
                });
            }

            let now = Instant::now();
            if cadence.is_due(now) {
                if cancel.is_cancelled() {
                    let err = EnumerationError::Cancelled { tested };
                    sink.failed(CANCELLED_MESSAGE, started_at.elapsed());
                    return Err(err);
                }
                if let Some(update) = cadence.sample(now, tested, &candidate) {
                    sink.progress(update);
                }
            }
        }

        sink.completed(None, started_at.elapsed());
        Ok(SearchOutcome::Exhausted { tested })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Call {
        Started(usize, u8),
        Progress(u8),
        Completed(Option<String>),
        Failed(String),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        updates: Vec<ProgressUpdate>,
    }

    impl ProgressSink for Recorder {
        fn started(&mut self, charset_size: usize, max_length: u8) {
            self.calls.push(Call::Started(charset_size, max_length));
        }

        fn progress(&mut self, update: ProgressUpdate) {
            self.calls.push(Call::Progress(update.progress));
            self.updates.push(update);
        }

        fn completed(&mut self, password: Option<&str>, _elapsed: Duration) {
            self.calls.push(Call::Completed(password.map(str::to_string)));
        }

        fn failed(&mut self, error: &str, _elapsed: Duration) {
            self.calls.push(Call::Failed(error.to_string()));
        }
    }

    /// Verifier accepting one password and remembering what it saw.
    struct Target {
        password: &'static str,
        seen: Mutex<Vec<String>>,
    }

    impl Target {
        fn new(password: &'static str) -> Self {
            Self {
                password,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ArchiveVerifier for Target {
        fn verify(&self, _artifact: &Path, candidate: &str) -> Result<bool, VerifyError> {
            self.seen.lock().unwrap().push(candidate.to_string());
            Ok(candidate == self.password)
        }
    }

    fn job(charset: &str, max_length: u8) -> SearchJob {
        SearchJob {
            job_id: 1,
            charset: charset.to_string(),
            max_length,
            artifact_path: PathBuf::from("/tmp/target.rar"),
        }
    }

    fn every_tick() -> Enumerator {
        Enumerator::new(EnumeratorConfig {
            report_interval: Duration::ZERO,
        })
    }

    #[test]
    fn finds_shortest_then_earliest_candidate() {
        let target = Target::new("ba");
        let mut sink = Recorder::default();

        let outcome = Enumerator::default()
            .run(&job("ab", 2), &target, &mut sink, &CancellationToken::new())
            .unwrap();

        assert_eq!(
            outcome,
            SearchOutcome::Found {
                password: "ba".into(),
                tested: 5
            }
        );
        assert_eq!(target.seen(), ["a", "b", "aa", "ab", "ba"]);
        assert_eq!(sink.calls.first(), Some(&Call::Started(2, 2)));
        assert_eq!(sink.calls.last(), Some(&Call::Completed(Some("ba".into()))));
    }

    #[test]
    fn single_symbol_space_tests_exactly_one_candidate() {
        let target = Target::new("0");
        let mut sink = Recorder::default();

        let outcome = Enumerator::default()
            .run(&job("0", 1), &target, &mut sink, &CancellationToken::new())
            .unwrap();

        assert_eq!(outcome.password(), Some("0"));
        assert_eq!(outcome.tested(), 1);
    }

    #[test]
    fn exhausted_space_completes_without_result() {
        let target = Target::new("z");
        let mut sink = Recorder::default();

        let outcome = Enumerator::default()
            .run(&job("xy", 1), &target, &mut sink, &CancellationToken::new())
            .unwrap();

        assert_eq!(outcome, SearchOutcome::Exhausted { tested: 2 });
        assert_eq!(sink.calls.last(), Some(&Call::Completed(None)));
        assert!(!sink.calls.iter().any(|c| matches!(c, Call::Failed(_))));
    }

    #[test]
    fn progress_is_reported_only_when_percent_changes() {
        // 10 + 100 candidates; every tick is due, but percent moves slower.
        let target = Target::new("none");
        let mut sink = Recorder::default();

        every_tick()
            .run(&job("0123456789", 2), &target, &mut sink, &CancellationToken::new())
            .unwrap();

        let percents: Vec<u8> = sink.updates.iter().map(|u| u.progress).collect();
        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] < w[1]), "{percents:?}");
        assert!(percents.iter().all(|&p| p <= 100));
        assert!(sink.updates.iter().all(|u| u.candidates_per_second >= 0.0));
    }

    #[test]
    fn progress_carries_most_recent_candidate() {
        let target = Target::new("none");
        let mut sink = Recorder::default();

        every_tick()
            .run(&job("ab", 1), &target, &mut sink, &CancellationToken::new())
            .unwrap();

        assert_eq!(sink.updates[0].current_candidate, "a");
        assert_eq!(sink.updates[0].progress, 50);
        assert_eq!(sink.updates[1].current_candidate, "b");
        assert_eq!(sink.updates[1].progress, 100);
    }

    #[test]
    fn long_interval_suppresses_progress() {
        let target = Target::new("none");
        let mut sink = Recorder::default();
        let enumerator = Enumerator::new(EnumeratorConfig {
            report_interval: Duration::from_secs(3600),
        });

        enumerator
            .run(&job("abc", 2), &target, &mut sink, &CancellationToken::new())
            .unwrap();

        assert!(sink.updates.is_empty());
        assert_eq!(sink.calls.len(), 2);
    }

    #[test]
    fn verifier_error_aborts_with_failed_report() {
        let failing = |_: &Path, candidate: &str| {
            if candidate == "b" {
                Err(VerifyError::Unreadable {
                    path: PathBuf::from("/tmp/target.rar"),
                    reason: "corrupt header".into(),
                })
            } else {
                Ok(false)
            }
        };
        let mut sink = Recorder::default();

        let result = Enumerator::default().run(
            &job("abc", 2),
            &failing,
            &mut sink,
            &CancellationToken::new(),
        );

        assert_matches!(result, Err(EnumerationError::Verifier { ref candidate, .. }) if candidate == "b");
        assert_matches!(sink.calls.last(), Some(Call::Failed(msg)) if msg.contains("corrupt header"));
        assert!(!sink.calls.iter().any(|c| matches!(c, Call::Completed(_))));
    }

    #[test]
    fn cancellation_is_observed_on_cadence_tick() {
        let target = Target::new("none");
        let mut sink = Recorder::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = every_tick().run(&job("abc", 3), &target, &mut sink, &cancel);

        assert_matches!(result, Err(EnumerationError::Cancelled { tested: 1 }));
        assert_eq!(target.seen().len(), 1);
        assert_eq!(sink.calls.last(), Some(&Call::Failed(CANCELLED_MESSAGE.into())));
    }

    #[test]
    fn rate_spans_silent_ticks_since_last_report() {
        let t0 = Instant::now();
        let second = Duration::from_secs(1);
        let mut cadence = Cadence::new(second, 1000, t0);

        let first = cadence.sample(t0 + second, 10, "aa").unwrap();
        assert_eq!(first.progress, 1);
        assert_eq!(first.candidates_per_second, 10.0);

        // The verifier slows down; the percentage does not move.
        assert!(cadence.sample(t0 + second * 2, 15, "ab").is_none());
        assert!(!cadence.is_due(t0 + second * 2));

        // Then speeds up: 20 candidates over the 2s since the first report.
        let second_report = cadence.sample(t0 + second * 3, 30, "ac").unwrap();
        assert_eq!(second_report.progress, 3);
        assert_eq!(second_report.candidates_per_second, 10.0);
    }
}
