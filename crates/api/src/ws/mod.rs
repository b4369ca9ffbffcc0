//! WebSocket infrastructure for live job progress.
//!
//! Provides the subscription gateway, heartbeat monitoring, and the HTTP
//! upgrade handler used by Axum routes.

pub mod gateway;
mod handler;
mod heartbeat;

pub use gateway::{Attachment, GatewayError, RelayState, SubscriptionGateway};
pub use handler::task_ws_handler;
pub use heartbeat::start_heartbeat;
