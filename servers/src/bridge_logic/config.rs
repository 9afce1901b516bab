use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use anyhow::{Context, Result};
use lib_bridge::configs::TakProtocol;
use lib_bridge::BridgeConfig;

/// Process-level options. Every field is optional so layers can be merged: defaults, then the
/// values below taken from env/CLI. Engine tuning lives in the JSON5 file at `config_path`.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Kismet to TAK telemetry bridge with a WebSocket dashboard feed", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "BRIDGE_PORT", help = "Port to listen on for dashboard clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "BRIDGE_BIND", help = "Address to bind the dashboard server to.")]
    pub bind_address: Option<String>,

    #[clap(long, env = "BRIDGE_CONFIG_PATH", help = "Path to the JSON5 bridge configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "BRIDGE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "BRIDGE_LOG_LEVEL", help = "Logging level (trace, debug, info and so on).")]
    pub log_level: Option<String>,

    #[clap(long, env = "KISMET_API_URL", help = "Base URL of the Kismet REST API.")]
    pub kismet_url: Option<String>,

    #[clap(long, env = "KISMET_API_KEY", help = "Kismet API key, sent as the KISMET header.")]
    pub kismet_api_key: Option<String>,

    #[clap(long, env = "KISMET_POLL_INTERVAL_MS", help = "Milliseconds between Kismet polls.")]
    pub poll_interval_ms: Option<u64>,

    #[clap(long, env = "TAK_ENABLED", help = "Broadcast CoT to the TAK target (true/false).")]
    pub tak_enabled: Option<bool>,

    #[clap(
        long,
        env = "TAK_SERVER_HOST",
        help = "TAK server host, or the multicast group in multicast mode."
    )]
    pub tak_host: Option<String>,

    #[clap(long, env = "TAK_SERVER_PORT", help = "TAK server port.")]
    pub tak_port: Option<u16>,

    #[clap(long, env = "TAK_PROTOCOL", help = "TAK transport: TCP or UDP.")]
    pub tak_protocol: Option<String>,

    #[clap(long, env = "TAK_MULTICAST", help = "Use UDP multicast instead of unicast.")]
    pub tak_multicast: Option<bool>,

    #[clap(long, env = "ANTENNA_HEIGHT_M", help = "Antenna height in meters above the ground.")]
    pub antenna_height_m: Option<f64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            bind_address: other.bind_address.or(self.bind_address),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            kismet_url: other.kismet_url.or(self.kismet_url),
            kismet_api_key: other.kismet_api_key.or(self.kismet_api_key),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            tak_enabled: other.tak_enabled.or(self.tak_enabled),
            tak_host: other.tak_host.or(self.tak_host),
            tak_port: other.tak_port.or(self.tak_port),
            tak_protocol: other.tak_protocol.or(self.tak_protocol),
            tak_multicast: other.tak_multicast.or(self.tak_multicast),
            antenna_height_m: other.antenna_height_m.or(self.antenna_height_m),
        }
    }

    pub fn defaults() -> Config {
        Config {
            port: Some(8092),
            bind_address: Some("0.0.0.0".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    /// # Bridge Config
    ///
    /// Builds the engine configuration: library defaults, then the JSON5 file (if any), then the
    /// overrides carried by `self`. The result is validated.
    pub fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut bridge = match &self.config_path {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("loading bridge config from {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some(url) = &self.kismet_url {
            bridge.source.api_url = url.clone();
        }
        if let Some(key) = &self.kismet_api_key {
            bridge.source.api_key = Some(key.clone());
        }
        if let Some(ms) = self.poll_interval_ms {
            bridge.source.poll_interval_ms = ms;
        }
        if let Some(enabled) = self.tak_enabled {
            bridge.tak.enabled = enabled;
        }
        if let Some(host) = &self.tak_host {
            bridge.tak.server.host = host.clone();
            // A multicast target is addressed through its group.
            bridge.tak.server.multicast_group = host.clone();
        }
        if let Some(port) = self.tak_port {
            bridge.tak.server.port = port;
        }
        if let Some(protocol) = &self.tak_protocol {
            bridge.tak.server.protocol = match protocol.to_ascii_uppercase().as_str() {
                "TCP" => TakProtocol::Tcp,
                "UDP" => TakProtocol::Udp,
                other => anyhow::bail!("unknown TAK protocol '{}', expected TCP or UDP", other),
            };
        }
        if let Some(multicast) = self.tak_multicast {
            bridge.tak.server.multicast = multicast;
        }
        if let Some(height) = self.antenna_height_m {
            bridge.tak.cot.antenna.height_m = height;
        }

        bridge.validate().context("invalid bridge configuration")?;
        Ok(bridge)
    }
}

/// Defaults overridden by env/CLI.
pub fn load_config() -> Config {
    resolve(Config::parse())
}

fn resolve(cli: Config) -> Config {
    Config::defaults().merge(cli)
}
