//! # Alerts and System Status
//!
//! Kismet alerts, their severity levels, and the system-status snapshot with the scan summary
//! derived from it.

use serde::{Deserialize, Serialize};

/// Named severity level of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityLevel {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityLevel {
    const ANCHORS: [(u32, SeverityLevel); 5] = [
        (0, SeverityLevel::Info),
        (5, SeverityLevel::Low),
        (10, SeverityLevel::Medium),
        (15, SeverityLevel::High),
        (20, SeverityLevel::Critical),
    ];

    /// Nearest anchor among 0/5/10/15/20. Ties resolve to the lower level.
    pub fn from_ordinal(ordinal: u32) -> Self {
        let mut best = SeverityLevel::Info;
        let mut best_distance = u32::MAX;
        for (anchor, level) in Self::ANCHORS {
            let distance = anchor.abs_diff(ordinal);
            if distance < best_distance {
                best_distance = distance;
                best = level;
            }
        }
        best
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityLevel::Info => "info",
            SeverityLevel::Low => "low",
            SeverityLevel::Medium => "medium",
            SeverityLevel::High => "high",
            SeverityLevel::Critical => "critical",
        }
    }
}

/// One Kismet alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    /// `kismet-<timestamp>`.
    pub id: String,
    pub class: String,
    pub header: String,
    pub severity: u32,
    pub level: SeverityLevel,
    pub message: String,
    pub timestamp_ms: i64,
    /// Key of the device that raised the alert, if any.
    pub device_key: Option<String>,
}

/// Kismet system status, reduced to what the dashboard shows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub devices_count: u64,
    pub packets_rate: u64,
    pub channels: Vec<String>,
    pub memory_rss: Option<u64>,
    pub battery_percentage: Option<i64>,
}

impl SystemStatus {
    /// The scan summary the dashboard's scan panel consumes.
    pub fn scan_status(&self) -> ScanStatus {
        ScanStatus {
            scanning: true,
            devices_found: self.devices_count,
            packets_processed: self.packets_rate,
            errors: 0,
            current_channel: self.channels.first().and_then(|c| c.trim().parse().ok()),
        }
    }
}

/// Summary published on the `scan` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatus {
    pub scanning: bool,
    pub devices_found: u64,
    pub packets_processed: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_channel: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_nearest_match() {
        assert_eq!(SeverityLevel::from_ordinal(0), SeverityLevel::Info);
        assert_eq!(SeverityLevel::from_ordinal(4), SeverityLevel::Low);
        assert_eq!(SeverityLevel::from_ordinal(11), SeverityLevel::Medium);
        assert_eq!(SeverityLevel::from_ordinal(13), SeverityLevel::High);
        assert_eq!(SeverityLevel::from_ordinal(99), SeverityLevel::Critical);
        // Equidistant between 5 and 10.
        assert_eq!(SeverityLevel::from_ordinal(7), SeverityLevel::Low);
    }

    #[test]
    fn test_scan_status_takes_first_channel() {
        let status = SystemStatus {
            devices_count: 12,
            packets_rate: 40,
            channels: vec!["6".into(), "11".into()],
            ..Default::default()
        };
        let scan = status.scan_status();
        assert_eq!(scan.devices_found, 12);
        assert_eq!(scan.current_channel, Some(6));

        let empty = SystemStatus::default().scan_status();
        assert_eq!(empty.current_channel, None);
    }
}
