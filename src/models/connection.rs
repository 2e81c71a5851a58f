// src/models/connection.rs
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        write!(f, "{}", name)
    }
}

/// What the device's network stack reports. Fed to the supervisor by the
/// platform's reachability listener.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct NetworkStatus {
    pub reachable: bool,
    pub transport: TransportKind,
}

impl NetworkStatus {
    pub fn offline() -> Self {
        Self {
            reachable: false,
            transport: TransportKind::None,
        }
    }

    pub fn wifi() -> Self {
        Self {
            reachable: true,
            transport: TransportKind::Wifi,
        }
    }

    pub fn cellular(generation: u8) -> Self {
        Self {
            reachable: true,
            transport: TransportKind::Cellular { generation },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Wifi,
    Cellular { generation: u8 },
    None,
}

/// Coarse quality bucket shown to the rider ("weak connection" banner).
/// Informational only - control flow never branches on it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Good,
    Poor,
    Offline,
}

impl ConnectionQuality {
    /// Wifi and 4G+ count as good; 2G/3G as poor; no reachability as offline.
    pub fn from_network(status: &NetworkStatus) -> Self {
        if !status.reachable {
            return ConnectionQuality::Offline;
        }
        match status.transport {
            TransportKind::Wifi => ConnectionQuality::Good,
            TransportKind::Cellular { generation } if generation >= 4 => ConnectionQuality::Good,
            TransportKind::Cellular { .. } => ConnectionQuality::Poor,
            TransportKind::None => ConnectionQuality::Offline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_buckets() {
        assert_eq!(
            ConnectionQuality::from_network(&NetworkStatus::wifi()),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::from_network(&NetworkStatus::cellular(5)),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::from_network(&NetworkStatus::cellular(3)),
            ConnectionQuality::Poor
        );
        assert_eq!(
            ConnectionQuality::from_network(&NetworkStatus::offline()),
            ConnectionQuality::Offline
        );
    }

    #[test]
    fn unreachable_wins_over_transport() {
        let status = NetworkStatus {
            reachable: false,
            transport: TransportKind::Wifi,
        };
        assert_eq!(
            ConnectionQuality::from_network(&status),
            ConnectionQuality::Offline
        );
    }
}
