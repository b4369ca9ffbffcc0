use std::sync::Arc;

use rarcrack_core::store::TaskStore;

use crate::config::ServerConfig;
use crate::ws::SubscriptionGateway;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Task records; the only state shared with the workers.
    pub store: Arc<dyn TaskStore>,
    pub config: Arc<ServerConfig>,
    /// Live job event fan-out to WebSocket clients.
    pub gateway: Arc<SubscriptionGateway>,
}
