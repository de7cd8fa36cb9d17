//! Connection state machine for the shared broker connection

use serde::Serialize;
use std::fmt;

/// Where the single broker connection is in its lifecycle.
///
/// `connected` and `connecting` are never true together because they are one
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// A disconnect was requested; cleared by the next connect
    Closing,
}

impl ConnectionState {
    /// A new connection may be opened only when neither connected nor connecting
    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Closing)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    /// State after the transport reports the network connection closed
    pub fn on_closed(self) -> Self {
        match self {
            ConnectionState::Connected | ConnectionState::Connecting => ConnectionState::Idle,
            other => other,
        }
    }
}

/// Status broadcast to every consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Idle | ConnectionState::Closing => ConnectionStatus::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Connected => f.write_str("connected"),
        }
    }
}
