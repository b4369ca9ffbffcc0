use std::time::Duration;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string (required).
    pub database_url: String,
    /// Maximum number of searches running at once (default: number of CPUs).
    pub concurrency: usize,
    /// Delay between claim attempts in milliseconds (default: `1000`).
    pub poll_interval_ms: u64,
    /// Minimum spacing of progress reports in milliseconds (default: `1000`).
    pub report_interval_ms: u64,
    /// Path or name of the `unrar` binary (default: `unrar`).
    pub unrar_path: String,
    /// Seconds without a claim renewal before a task is failed as abandoned
    /// (default: `60`).
    pub lease_timeout_secs: u64,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var              | Default          |
    /// |----------------------|------------------|
    /// | `DATABASE_URL`       | (required)       |
    /// | `WORKER_CONCURRENCY` | number of CPUs   |
    /// | `POLL_INTERVAL_MS`   | `1000`           |
    /// | `REPORT_INTERVAL_MS` | `1000`           |
    /// | `UNRAR_PATH`         | `unrar`          |
    /// | `LEASE_TIMEOUT_SECS` | `60`             |
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

        let concurrency: usize = match std::env::var("WORKER_CONCURRENCY") {
            Ok(value) => value
                .parse()
                .expect("WORKER_CONCURRENCY must be a valid usize"),
            Err(_) => std::thread::available_parallelism().map_or(1, |n| n.get()),
        };

        let poll_interval_ms: u64 = std::env::var("POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .expect("POLL_INTERVAL_MS must be a valid u64");

        let report_interval_ms: u64 = std::env::var("REPORT_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .expect("REPORT_INTERVAL_MS must be a valid u64");

        let unrar_path = std::env::var("UNRAR_PATH").unwrap_or_else(|_| "unrar".into());

        let lease_timeout_secs: u64 = std::env::var("LEASE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".into())
            .parse()
            .expect("LEASE_TIMEOUT_SECS must be a valid u64");

        Self {
            database_url,
            concurrency: concurrency.max(1),
            poll_interval_ms,
            report_interval_ms,
            unrar_path,
            lease_timeout_secs: lease_timeout_secs.max(1),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}
