//! Job notification relay.
//!
//! The relay carries [`JobEvent`](rarcrack_core::job_events::JobEvent)s
//! from the worker process that produces them to the API process that
//! fans them out to WebSocket clients. It has at-most-once, fan-out
//! semantics: every subscriber of a topic receives every event published
//! while it is subscribed, and nothing is replayed.
//!
//! - [`relay`]: topic naming, the wire envelope, and the
//!   [`RelayPublisher`] / [`RelayConnector`] / [`RelaySubscription`] seams.
//! - [`memory`]: in-process relay backed by `tokio::sync::broadcast`.
//! - [`postgres`]: cross-process relay over PostgreSQL `NOTIFY`/`LISTEN`.
//! - [`reconnect`]: exponential backoff used when a subscription drops.

pub mod memory;
pub mod postgres;
pub mod reconnect;
pub mod relay;

pub use memory::MemoryRelay;
pub use postgres::{PgRelayConnector, PgRelayPublisher};
pub use reconnect::{next_delay, Backoff, ReconnectConfig};
pub use relay::{
    RelayConnector, RelayEnvelope, RelayError, RelayMessage, RelayPublisher, RelaySubscription,
    Topic,
};
