//! # Bridge Configuration
//!
//! The configuration surface of the bridge: Kismet polling, cache bounds, per-event throttle
//! intervals, batching, and the TAK target with its CoT encoding options.
//!
//! Every struct is `#[serde(default)]`, so the defaults below apply field by field:
//!
//! | Setting | Default |
//! |---|---|
//! | `source.pollIntervalMs` | 2000 |
//! | `source.heartbeatIntervalMs` | 30000 |
//! | `source.maxRetries` | 5 |
//! | `source.retryDelayMs` / `maxRetryDelayMs` | 5000 / 60000 |
//! | `cache.maxDevices` | 1000 |
//! | `cache.ttlMs` | 3600000 |
//! | `batch.batchSize` / `batchIntervalMs` / `maxQueueSize` | 50 / 100 / 1000 |
//! | `tak.server` | UDP multicast 239.2.3.1:6969 |

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, Result};

/// Root of the configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Kismet REST source and its retry policy.
    pub source: SourceConfig,
    /// Device cache bounds and eviction.
    pub cache: CacheConfig,
    /// Per-event-type throttle intervals.
    pub throttle: ThrottleConfig,
    /// Outbound batch queue.
    pub batch: BatchConfig,
    /// TAK target, CoT encoding and broadcast filter.
    pub tak: TakConfig,
}

impl BridgeConfig {
    /// Parses a JSON5 document. Missing fields take their defaults.
    pub fn from_json5_str(text: &str) -> Result<Self> {
        let config: BridgeConfig = json5::from_str(text)
            .map_err(|e| BridgeError::Config(format!("invalid JSON5: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON5 configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json5_str(&text)
    }

    /// Rejects values the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.source.poll_interval_ms == 0 {
            return Err(BridgeError::Config("source.pollIntervalMs must be > 0".into()));
        }
        if self.source.heartbeat_interval_ms == 0 {
            return Err(BridgeError::Config("source.heartbeatIntervalMs must be > 0".into()));
        }
        if self.source.max_retries == 0 {
            return Err(BridgeError::Config("source.maxRetries must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.source.jitter_ratio) {
            return Err(BridgeError::Config("source.jitterRatio must be within 0..=1".into()));
        }
        if self.cache.max_devices == 0 {
            return Err(BridgeError::Config("cache.maxDevices must be > 0".into()));
        }
        if self.cache.max_history_per_device == 0 {
            return Err(BridgeError::Config("cache.maxHistoryPerDevice must be > 0".into()));
        }
        if self.cache.cleanup_interval_ms == 0 {
            return Err(BridgeError::Config("cache.cleanupIntervalMs must be > 0".into()));
        }
        let ratios_ok = self.cache.target_ratio > 0.0
            && self.cache.target_ratio < self.cache.high_water_ratio
            && self.cache.high_water_ratio <= 1.0;
        if !ratios_ok {
            return Err(BridgeError::Config(
                "cache ratios must satisfy 0 < targetRatio < highWaterRatio <= 1".into(),
            ));
        }
        if self.batch.batch_size == 0 || self.batch.max_queue_size == 0 {
            return Err(BridgeError::Config(
                "batch.batchSize and batch.maxQueueSize must be > 0".into(),
            ));
        }
        if self.batch.batch_interval_ms == 0 {
            return Err(BridgeError::Config("batch.batchIntervalMs must be > 0".into()));
        }
        if self.tak.cot.stale_after_ms == 0 {
            return Err(BridgeError::Config("tak.cot.staleAfterMs must be > 0".into()));
        }
        if self.tak.server.port == 0 {
            return Err(BridgeError::Config("tak.server.port must be > 0".into()));
        }
        if self.tak.server.connect_timeout_ms == 0 || self.tak.server.send_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "tak.server.connectTimeoutMs and tak.server.sendTimeoutMs must be > 0".into(),
            ));
        }
        if self.tak.server.max_queue_size == 0 {
            return Err(BridgeError::Config("tak.server.maxQueueSize must be > 0".into()));
        }
        Ok(())
    }
}

/// Kismet REST source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceConfig {
    /// Base URL of the Kismet REST API.
    pub api_url: String,
    /// Value for the `KISMET` auth header, if the server requires one.
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Consecutive poll failures before the source is declared disconnected.
    pub max_retries: u32,
    /// Base delay of the exponential backoff.
    pub retry_delay_ms: u64,
    /// Cap of the exponential backoff.
    pub max_retry_delay_ms: u64,
    /// Fraction of the backoff delay added as random jitter.
    pub jitter_ratio: f64,
    pub request_timeout_ms: u64,
    /// Only devices active within this window are requested.
    pub device_window_secs: u64,
    /// How many recent alerts are requested per poll.
    pub alert_lookback: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:2501".to_string(),
            api_key: None,
            poll_interval_ms: 2_000,
            heartbeat_interval_ms: 30_000,
            max_retries: 5,
            retry_delay_ms: 5_000,
            max_retry_delay_ms: 60_000,
            jitter_ratio: 0.2,
            request_timeout_ms: 10_000,
            device_window_secs: 300,
            alert_lookback: 10,
        }
    }
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Device cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub max_devices: usize,
    pub max_history_per_device: usize,
    /// Entries not observed for this long are swept.
    pub ttl_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Occupancy above which a warning is logged on sweep.
    pub warning_ratio: f64,
    /// Occupancy above which the oldest entries are force-evicted.
    pub high_water_ratio: f64,
    /// Occupancy the forced eviction trims down to.
    pub target_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_devices: 1_000,
            max_history_per_device: 100,
            ttl_ms: 3_600_000,
            cleanup_interval_ms: 300_000,
            warning_ratio: 0.8,
            high_water_ratio: 0.95,
            target_ratio: 0.7,
        }
    }
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// What happens to the last update suppressed inside a throttle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingEdge {
    /// Suppressed updates are discarded.
    #[default]
    Drop,
    /// The most recent suppressed update is delivered once the window closes.
    Replay,
}

/// Per-event-type throttle intervals, keyed by event type (`device:update`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThrottleConfig {
    pub intervals_ms: BTreeMap<String, u64>,
    /// Interval for throttled types missing from `intervals_ms`.
    pub default_interval_ms: u64,
    pub trailing_edge: TrailingEdge,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        let intervals_ms = [
            ("device:update", 500),
            ("system:status", 2_000),
            ("scan:status", 1_000),
            ("signal:update", 250),
            ("tak:status", 1_000),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            intervals_ms,
            default_interval_ms: 1_000,
            trailing_edge: TrailingEdge::Drop,
        }
    }
}

/// Outbound batch queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    /// A type's queue is flushed as soon as it holds this many messages.
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    /// Hard capacity across all types.
    pub max_queue_size: usize,
    /// Serialized batches larger than this are deflated and base64 encoded.
    pub compression_threshold: usize,
    /// Messages with a priority above this flush immediately.
    pub priority_threshold: u8,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_interval_ms: 100,
            max_queue_size: 1_000,
            compression_threshold: 1_024,
            priority_threshold: 5,
        }
    }
}

impl BatchConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

/// Transport used to reach the TAK target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TakProtocol {
    Tcp,
    Udp,
}

impl TakProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TakProtocol::Tcp => "TCP",
            TakProtocol::Udp => "UDP",
        }
    }
}

/// TAK target and broadcaster behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TakServerConfig {
    pub host: String,
    pub port: u16,
    pub protocol: TakProtocol,
    /// Send to `multicast_group` instead of `host` (UDP only).
    pub multicast: bool,
    pub multicast_group: String,
    pub multicast_ttl: u32,
    /// A TCP link idle for this long is recycled.
    pub tcp_idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// A single write that takes longer fails the link.
    pub send_timeout_ms: u64,
    /// Delay between a transport error and the reconnect attempt.
    pub reconnect_delay_ms: u64,
    /// Messages held while disconnected; the oldest is dropped when full.
    pub max_queue_size: usize,
}

impl Default for TakServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6969,
            protocol: TakProtocol::Udp,
            multicast: true,
            multicast_group: "239.2.3.1".to_string(),
            multicast_ttl: 1,
            tcp_idle_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            send_timeout_ms: 5_000,
            reconnect_delay_ms: 5_000,
            max_queue_size: 500,
        }
    }
}

impl TakServerConfig {
    /// Host the datagrams or stream are addressed to.
    pub fn target_host(&self) -> &str {
        if self.protocol == TakProtocol::Udp && self.multicast {
            &self.multicast_group
        } else {
            &self.host
        }
    }
}

/// Antenna characteristics used for altitude offset and signal compensation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AntennaConfig {
    /// Sensor height above the reported altitude, in meters.
    pub height_m: f64,
    /// `standard`, `alfa_card`, `high_gain`, `rpi_internal` or `custom`.
    pub sensitivity: String,
    /// Multiplier used when `sensitivity` is `custom`.
    pub custom_factor: Option<f64>,
}

impl Default for AntennaConfig {
    fn default() -> Self {
        Self {
            height_m: 0.0,
            sensitivity: "standard".to_string(),
            custom_factor: None,
        }
    }
}

/// Compensated-signal thresholds, in dBm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalThresholds {
    /// Strictly above this the device is classified hostile.
    pub hostile_dbm: i32,
    pub red_dbm: i32,
    pub orange_dbm: i32,
    pub yellow_dbm: i32,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            hostile_dbm: -50,
            red_dbm: -50,
            orange_dbm: -70,
            yellow_dbm: -85,
        }
    }
}

/// CoT encoding options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CotConfig {
    pub uid_prefix: String,
    pub stale_after_ms: u64,
    /// `ce`/`le` used when the device reports no accuracy.
    pub default_accuracy_m: f64,
    pub antenna: AntennaConfig,
    pub thresholds: SignalThresholds,
}

impl Default for CotConfig {
    fn default() -> Self {
        Self {
            uid_prefix: "WIGLE".to_string(),
            stale_after_ms: 300_000,
            default_accuracy_m: 10.0,
            antenna: AntennaConfig::default(),
            thresholds: SignalThresholds::default(),
        }
    }
}

/// Which devices reach the TAK target, and with which color.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TakFilter {
    /// SSIDs that are never broadcast.
    pub excluded_ssids: BTreeSet<String>,
    /// MAC addresses that are never broadcast.
    pub excluded_macs: BTreeSet<String>,
    /// ARGB color overrides keyed by SSID or MAC.
    pub color_overrides: BTreeMap<String, i64>,
    /// Skip devices that report no position.
    pub require_location: bool,
}

impl Default for TakFilter {
    fn default() -> Self {
        Self {
            excluded_ssids: BTreeSet::new(),
            excluded_macs: BTreeSet::new(),
            color_overrides: BTreeMap::new(),
            require_location: true,
        }
    }
}

/// TAK broadcasting as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TakConfig {
    pub enabled: bool,
    pub server: TakServerConfig,
    pub cot: CotConfig,
    pub filter: TakFilter,
}

impl Default for TakConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: TakServerConfig::default(),
            cot: CotConfig::default(),
            filter: TakFilter::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.source.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.throttle.intervals_ms.get("device:update"), Some(&500));
        assert_eq!(config.tak.server.target_host(), "239.2.3.1");
    }

    #[test]
    fn test_partial_json5_keeps_other_defaults() {
        let text = r#"{
            // only the fields we care about
            cache: { maxDevices: 10 },
            tak: {
                server: { protocol: "TCP", host: "10.0.0.5", port: 8087 },
                cot: { antenna: { heightM: 2 } },
            },
        }"#;
        let config = BridgeConfig::from_json5_str(text).unwrap();
        assert_eq!(config.cache.max_devices, 10);
        assert_eq!(config.cache.ttl_ms, 3_600_000);
        assert_eq!(config.tak.server.protocol, TakProtocol::Tcp);
        assert_eq!(config.tak.server.target_host(), "10.0.0.5");
        assert_eq!(config.tak.cot.antenna.height_m, 2.0);
        assert_eq!(config.tak.cot.uid_prefix, "WIGLE");
    }

    #[test]
    fn test_invalid_ratios_rejected() {
        let text = r#"{ cache: { highWaterRatio: 0.5, targetRatio: 0.7 } }"#;
        let err = BridgeConfig::from_json5_str(text).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_trailing_edge_parses_lowercase() {
        let text = r#"{ throttle: { trailingEdge: "replay" } }"#;
        let config = BridgeConfig::from_json5_str(text).unwrap();
        assert_eq!(config.throttle.trailing_edge, TrailingEdge::Replay);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ source: {{ apiUrl: 'http://kismet:2501', maxRetries: 3 }} }}").unwrap();
        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.source.api_url, "http://kismet:2501");
        assert_eq!(config.source.max_retries, 3);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = BridgeConfig::load(Path::new("/definitely/not/here.json5")).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
