//! Search worker: claims pending tasks, enumerates candidate passwords,
//! and reports progress through the task store and the relay.

pub mod candidates;
pub mod config;
pub mod enumerator;
pub mod pool;
pub mod reporter;
pub mod runner;
pub mod verifier;

pub use enumerator::{Enumerator, EnumeratorConfig, SearchOutcome};
pub use pool::WorkerPool;
pub use reporter::ProgressReporter;
pub use runner::JobRunner;
pub use verifier::{ArchiveVerifier, UnrarVerifier, VerifyError};
