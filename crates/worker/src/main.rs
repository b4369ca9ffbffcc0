use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rarcrack_db::PgTaskStore;
use rarcrack_events::PgRelayPublisher;
use rarcrack_worker::config::WorkerConfig;
use rarcrack_worker::{
    Enumerator, EnumeratorConfig, JobRunner, ProgressReporter, UnrarVerifier, WorkerPool,
};

/// Upper bound on waiting for in-flight jobs after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rarcrack_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env();
    tracing::info!(
        concurrency = config.concurrency,
        unrar = %config.unrar_path,
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = rarcrack_db::create_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    rarcrack_db::health_check(&pool)
        .await
        .expect("Database health check failed");

    rarcrack_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database ready");

    // --- Pipeline ---
    let store = Arc::new(PgTaskStore::new(pool.clone()));
    let relay = Arc::new(PgRelayPublisher::new(pool));
    let reporter = ProgressReporter::new(store.clone(), relay);
    let enumerator = Enumerator::new(EnumeratorConfig {
        report_interval: config.report_interval(),
    });
    let runner = JobRunner::new(
        reporter,
        Arc::new(UnrarVerifier::new(config.unrar_path.clone())),
        enumerator,
    );
    let worker_pool = WorkerPool::new(store, runner, config.concurrency)
        .with_poll_interval(config.poll_interval())
        .with_lease_timeout(config.lease_timeout());

    // --- Run until signalled ---
    let cancel = CancellationToken::new();
    let pool_cancel = cancel.clone();
    let mut pool_handle = tokio::spawn(async move {
        worker_pool.run(pool_cancel).await;
    });

    tokio::select! {
        _ = shutdown_signal() => {
            cancel.cancel();
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut pool_handle).await.is_err() {
                tracing::warn!("In-flight jobs did not finish in time, exiting anyway");
                pool_handle.abort();
            }
        }
        joined = &mut pool_handle => {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker pool task ended unexpectedly");
            }
        }
    }

    tracing::info!("Worker shutdown complete");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
