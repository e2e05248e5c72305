use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Transient state while a disconnect is in progress
    Disconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Error => "ERROR",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, target) {
            (Disconnected, Connecting) | (Error, Connecting) => true,
            (Connecting, Connected) | (Connecting, Error) => true,
            (Connected, Disconnecting) | (Error, Disconnecting) => true,
            (Disconnecting, Disconnected) => true,
            // a liveness probe can find a silently dropped session
            (Connected, Error) => true,
            // an abandoned disconnect leaves the session in an unknown state
            (Disconnecting, Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable snapshot of the broker connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub host: String,
    pub port: u16,
    pub retry_count: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// State transition event (for logging/observation)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionTransition {
    pub fn new(from: ConnectionState, to: ConnectionState, reason: Option<String>) -> Self {
        Self {
            from,
            to,
            reason,
            timestamp: Utc::now(),
        }
    }
}
