//! # Fan-out Envelope
//!
//! Event kinds, the channels they are delivered on, and the `{type, data, timestamp, id}`
//! envelope every dashboard message is wrapped in.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BridgeError;

/// Named delivery channel a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Devices,
    Alerts,
    System,
    Scan,
    Tak,
}

impl Channel {
    pub const ALL: [Channel; 5] =
        [Channel::Devices, Channel::Alerts, Channel::System, Channel::Scan, Channel::Tak];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Devices => "devices",
            Channel::Alerts => "alerts",
            Channel::System => "system",
            Channel::Scan => "scan",
            Channel::Tak => "tak",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "devices" => Ok(Channel::Devices),
            "alerts" => Ok(Channel::Alerts),
            "system" => Ok(Channel::System),
            "scan" => Ok(Channel::Scan),
            "tak" => Ok(Channel::Tak),
            other => Err(BridgeError::Protocol(format!("unknown channel '{}'", other))),
        }
    }
}

/// Type tag of an outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    DeviceUpdate,
    AlertNew,
    SystemStatus,
    ScanStatus,
    Heartbeat,
    Connected,
    Disconnected,
    ConnectionFailed,
    TakStatus,
    TakMessage,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DeviceUpdate => "device:update",
            EventKind::AlertNew => "alert:new",
            EventKind::SystemStatus => "system:status",
            EventKind::ScanStatus => "scan:status",
            EventKind::Heartbeat => "system:heartbeat",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::ConnectionFailed => "connectionFailed",
            EventKind::TakStatus => "tak:status",
            EventKind::TakMessage => "tak:message",
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            EventKind::DeviceUpdate => Channel::Devices,
            EventKind::AlertNew => Channel::Alerts,
            EventKind::ScanStatus => Channel::Scan,
            EventKind::TakStatus | EventKind::TakMessage => Channel::Tak,
            EventKind::SystemStatus
            | EventKind::Heartbeat
            | EventKind::Connected
            | EventKind::Disconnected
            | EventKind::ConnectionFailed => Channel::System,
        }
    }

    /// Kinds that pass through the per-type throttle gate.
    pub fn is_throttled(&self) -> bool {
        matches!(
            self,
            EventKind::DeviceUpdate
                | EventKind::SystemStatus
                | EventKind::ScanStatus
                | EventKind::TakStatus
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// # Envelope
///
/// The unit a dashboard client receives. `id` has the form `dev-<ms>-<9 base36 chars>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: i64,
    pub id: String,
}

impl Envelope {
    pub fn new(kind: &str, data: Value, timestamp_ms: i64) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            timestamp: timestamp_ms,
            id: envelope_id(timestamp_ms),
        }
    }
}

fn envelope_id(timestamp_ms: i64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("dev-{}-{}", timestamp_ms, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        assert_eq!("tak".parse::<Channel>().unwrap(), Channel::Tak);
        assert!("spectrum".parse::<Channel>().is_err());
    }

    #[test]
    fn test_kind_channel_mapping() {
        assert_eq!(EventKind::DeviceUpdate.channel(), Channel::Devices);
        assert_eq!(EventKind::ConnectionFailed.channel(), Channel::System);
        assert_eq!(EventKind::TakMessage.channel(), Channel::Tak);
        assert!(!EventKind::AlertNew.is_throttled());
    }

    #[test]
    fn test_envelope_id_shape() {
        let envelope = Envelope::new("device:update", Value::Null, 1_700_000_000_000);
        let re = regex::Regex::new(r"^dev-1700000000000-[0-9a-z]{9}$").unwrap();
        assert!(re.is_match(&envelope.id), "unexpected id {}", envelope.id);

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "device:update");
    }
}
