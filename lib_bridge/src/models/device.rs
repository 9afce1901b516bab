//! # Device Records
//!
//! The typed form of a Wi-Fi device observed by Kismet, plus the history samples the cache keeps
//! for it. Records are produced only by [`crate::models::raw::parse_device`].

use serde::{Deserialize, Serialize};

/// Coarse role of a Wi-Fi device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "AP")]
    AccessPoint,
    Client,
    #[default]
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::AccessPoint => "AP",
            DeviceType::Client => "Client",
            DeviceType::Unknown => "Unknown",
        }
    }

    /// Case-insensitive parse used by query filters.
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "ap" => Some(DeviceType::AccessPoint),
            "client" => Some(DeviceType::Client),
            "unknown" => Some(DeviceType::Unknown),
            _ => None,
        }
    }
}

/// A position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    /// Meters above the ellipsoid, when reported.
    pub alt: Option<f64>,
    /// Horizontal accuracy in meters, when reported.
    pub accuracy: Option<f64>,
}

/// Packet counters as reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketCounters {
    pub total: u64,
    pub data: u64,
    pub retry: u64,
}

/// # Device Record
///
/// One device as of the latest poll. `id` is the MAC address and is unique within the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    /// SSID when advertised, otherwise Kismet's device name.
    pub name: String,
    /// Advertised SSID, if any. Kept apart from `name` for broadcast filtering.
    pub ssid: Option<String>,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub channel: u32,
    /// Center frequency in kHz.
    pub frequency: u64,
    /// Last signal in dBm.
    pub signal: i32,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub location: Option<GeoLocation>,
    pub packets: PacketCounters,
    pub manufacturer: Option<String>,
    pub encryption: Option<String>,
}

impl DeviceRecord {
    /// A bare record with sensible defaults, for callers that fill in fields themselves.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ssid: None,
            device_type: DeviceType::Unknown,
            channel: 0,
            frequency: 0,
            signal: -100,
            first_seen_ms: 0,
            last_seen_ms: 0,
            location: None,
            packets: PacketCounters::default(),
            manufacturer: None,
            encryption: None,
        }
    }

    pub fn latitude(&self) -> Option<f64> {
        self.location.map(|l| l.lat)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.location.map(|l| l.lon)
    }

    /// The record's history sample at its last-seen time.
    pub fn sample(&self) -> HistorySample {
        HistorySample {
            signal: self.signal,
            location: self.location,
            timestamp_ms: self.last_seen_ms,
        }
    }
}

/// One entry of a device's history ring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySample {
    pub signal: i32,
    pub location: Option<GeoLocation>,
    pub timestamp_ms: i64,
}
