//! Upstream connection management: sessions, clients, and the manager.

pub mod client;
pub mod manager;
pub mod session;

use serde::{Deserialize, Serialize};
use strum::Display;

pub use client::{ReconnectPolicy, UpstreamClient};
pub use manager::{ConnectSummary, UpstreamManager, UpstreamStatus};
pub use session::{RmcpSessionFactory, SessionEvent, SessionFactory, SessionHandle, UpstreamSession};

/// Connection status of one upstream client.
///
/// `Error` is terminal until an explicit reconnect; `Disconnected` is
/// transient and may self-heal via the reconnect timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Health as seen by the periodic ping loop. Orthogonal to connection
/// status: a client can be connected and unhealthy at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Event delivered to status observers on every transition.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub previous: ConnectionStatus,
    pub current: ConnectionStatus,
    pub error: Option<String>,
}
