use std::sync::Arc;
use std::time::Duration;

use crate::ws::gateway::SubscriptionGateway;

/// Interval between heartbeat pings (in seconds).
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Spawn a background task that sends periodic Ping frames to every
/// attached WebSocket client.
///
/// The task runs until aborted through the returned `JoinHandle`.
pub fn start_heartbeat(gateway: Arc<SubscriptionGateway>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));

        loop {
            interval.tick().await;
            let count = gateway.connection_count().await;
            tracing::debug!(count, "WebSocket heartbeat ping");
            gateway.ping_all().await;
        }
    })
}
