//! Per-agent WhatsApp session instances.
//!
//! An instance is one agent's session. The lifecycle controller
//! ([`SessionManager`]) owns the session client behind each instance; the
//! [`InstanceRegistry`] only ever holds plain state. Reconnection after a
//! dropped session is decided by the [`ReconnectCoordinator`] and timed by
//! the [`ReconnectScheduler`], both under the global [`RateWindow`].

mod coordinator;
mod manager;
mod rate_limit;
mod registry;
mod scheduler;

pub use coordinator::{ReconnectCoordinator, ReconnectEvent};
pub use manager::{SessionManager, session_name};
pub use rate_limit::RateWindow;
pub use registry::{InstancePatch, InstanceRegistry};
pub use scheduler::{PendingReconnect, ReconnectScheduler, calculate_backoff_delay};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Disconnected,
    QrReady,
    Connected,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Disconnected => "disconnected",
            InstanceStatus::QrReady => "qr_ready",
            InstanceStatus::Connected => "connected",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(InstanceStatus::Disconnected),
            "qr_ready" => Ok(InstanceStatus::QrReady),
            "connected" => Ok(InstanceStatus::Connected),
            _ => Err(format!("unknown instance status '{}'", s)),
        }
    }
}

/// In-memory state of one agent's session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instance {
    pub agent_id: String,
    pub display_name: String,
    pub status: InstanceStatus,
    /// Present only while `status` is `QrReady`.
    pub qr_payload: Option<String>,
    pub phone_number: Option<String>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub qr_regeneration_attempts: u32,
    pub max_qr_regenerations: u32,
    pub is_reconnecting: bool,
    pub has_been_connected: bool,
    pub first_qr_generated: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Set while a session client is being created for this entry.
    #[serde(skip)]
    pub(crate) is_starting: bool,
    /// Identifies the session client currently bound to this entry.
    #[serde(skip)]
    pub(crate) generation: u64,
}

impl Instance {
    /// A fresh, disconnected instance with default limits.
    pub fn new(agent_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            display_name: display_name.into(),
            status: InstanceStatus::Disconnected,
            qr_payload: None,
            phone_number: None,
            reconnect_attempts: 0,
            max_reconnect_attempts: 3,
            qr_regeneration_attempts: 0,
            max_qr_regenerations: 10,
            is_reconnecting: false,
            has_been_connected: false,
            first_qr_generated: false,
            last_connected_at: None,
            is_starting: false,
            generation: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == InstanceStatus::Connected
    }

    pub fn reconnect_attempts_left(&self) -> bool {
        self.reconnect_attempts < self.max_reconnect_attempts
    }
}
