//! # Kismet Polling Ingestor
//!
//! A [`SnapshotSource`] over the Kismet REST API. One poll cycle issues:
//!
//! 1. `POST devices/views/all/devices.json` with a field projection, an `IEEE802.11` phy filter
//!    and a `last_time` window, giving the full list of recently seen Wi-Fi devices,
//! 2. `GET alerts/last/<n>.json` for the most recent alerts,
//! 3. `GET system/status.json` for the status panel.
//!
//! Only the device request decides whether the cycle succeeded; alert and status failures are
//! logged and leave their part of the snapshot empty. Scheduling, retries across cycles and
//! backoff belong to the caller.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{PollSnapshot, SnapshotSource};
use crate::configs::SourceConfig;
use crate::errors::{BridgeError, Result};
use crate::models::raw::DEVICE_FIELDS;
use crate::retrieve::ApiClient;

const DEVICES_PATH: &str = "devices/views/all/devices.json";
const STATUS_PATH: &str = "system/status.json";

#[derive(Debug, Serialize)]
struct FieldRegex {
    field: &'static str,
    regex: &'static str,
}

/// Body of the device view request.
#[derive(Debug, Serialize)]
struct DeviceViewRequest {
    fields: &'static [&'static str],
    regex: [FieldRegex; 1],
    last_time: i64,
}

impl DeviceViewRequest {
    fn since(last_time: i64) -> Self {
        Self {
            fields: &DEVICE_FIELDS,
            regex: [FieldRegex { field: "kismet.device.base.phyname", regex: "IEEE802.11" }],
            last_time,
        }
    }
}

/// # Kismet Polling Source
pub struct KismetPollingSource {
    client: ApiClient,
    device_window_secs: i64,
    alerts_path: String,
}

impl KismetPollingSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        // Retries across cycles are the bridge's job; one quick in-request retry absorbs blips.
        let client = ApiClient::new(
            &config.api_url,
            config.api_key.as_deref(),
            config.request_timeout(),
            1,
        )?;
        Ok(Self {
            client,
            device_window_secs: config.device_window_secs as i64,
            alerts_path: format!("alerts/last/{}.json", config.alert_lookback.max(1)),
        })
    }

    async fn fetch_devices(&self) -> Result<Vec<Value>> {
        let since = Utc::now().timestamp() - self.device_window_secs;
        let body = DeviceViewRequest::since(since);
        match self.client.post_json::<Value, _>(DEVICES_PATH, &body).await? {
            Value::Array(devices) => Ok(devices),
            other => Err(BridgeError::Protocol(format!(
                "device view returned {} instead of an array",
                json_kind(&other)
            ))),
        }
    }

    async fn fetch_alerts(&self) -> Vec<Value> {
        match self.client.get_json::<Value>(&self.alerts_path).await {
            Ok(Value::Array(alerts)) => alerts,
            Ok(other) => {
                warn!(kind = json_kind(&other), "Alert list is not an array, ignored");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Failed to poll alerts");
                Vec::new()
            }
        }
    }

    async fn fetch_status(&self) -> Option<Value> {
        match self.client.get_json::<Value>(STATUS_PATH).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "Failed to poll system status");
                None
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl SnapshotSource for KismetPollingSource {
    async fn poll(&self) -> Result<PollSnapshot> {
        let started = Instant::now();
        let devices = self.fetch_devices().await?;
        let (alerts, status) = tokio::join!(self.fetch_alerts(), self.fetch_status());
        debug!(
            devices = devices.len(),
            alerts = alerts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Kismet poll complete"
        );
        Ok(PollSnapshot { devices, alerts, status })
    }

    async fn probe(&self) -> Result<()> {
        self.client.get_json::<Value>(STATUS_PATH).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Requests = Arc<Mutex<Vec<String>>>;

    const DEVICES_ROUTE: &str = "/devices/views/all/devices.json";

    /// Minimal HTTP/1.1 responder: one request per connection, routed by path prefix.
    async fn serve(routes: Vec<(&'static str, u16, String)>) -> (String, Requests) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Requests = Arc::default();
        let seen = requests.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let routes = routes.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let head_end = loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    let length = head
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower.strip_prefix("content-length:").map(|v| v.trim().to_string())
                        })
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    while buf.len() < head_end + length {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    let request = String::from_utf8_lossy(&buf).to_string();
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    seen.lock().unwrap().push(request);

                    let (status, body) = routes
                        .iter()
                        .find(|(prefix, _, _)| path.starts_with(prefix))
                        .map(|(_, s, b)| (*s, b.clone()))
                        .unwrap_or((404, "{}".to_string()));
                    let response = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\n\
                         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (format!("http://{}", addr), requests)
    }

    fn config(url: String) -> SourceConfig {
        SourceConfig { api_url: url, api_key: Some("secret".into()), ..SourceConfig::default() }
    }

    #[test]
    fn test_device_view_request_shape() {
        let body = serde_json::to_value(DeviceViewRequest::since(1_700_000_000)).unwrap();
        assert_eq!(body["last_time"], 1_700_000_000);
        assert_eq!(body["regex"][0]["regex"], "IEEE802.11");
        assert_eq!(body["fields"].as_array().unwrap().len(), DEVICE_FIELDS.len());
        assert!(body["fields"].as_array().unwrap().contains(&json!("kismet.device.base.macaddr")));
    }

    #[tokio::test]
    async fn test_poll_collects_devices_alerts_and_status() {
        let devices = json!([{ "kismet.device.base.macaddr": "AA:BB:CC:DD:EE:FF" }]).to_string();
        let alerts = json!([{ "kismet.alert.timestamp": 1.5 }]).to_string();
        let status = json!({ "kismet.system.devices.count": 1 }).to_string();
        let (url, requests) = serve(vec![
            (DEVICES_ROUTE, 200, devices),
            ("/alerts/last/10.json", 200, alerts),
            ("/system/status.json", 200, status),
        ])
        .await;

        let source = KismetPollingSource::new(&config(url)).unwrap();
        let snapshot = source.poll().await.unwrap();
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.alerts.len(), 1);
        assert_eq!(snapshot.status.unwrap()["kismet.system.devices.count"], 1);

        let requests = requests.lock().unwrap();
        let device_request = requests.iter().find(|r| r.starts_with("POST /devices")).unwrap();
        assert!(device_request.to_ascii_lowercase().contains("kismet: secret"));
        assert!(device_request.contains("\"last_time\""));
    }

    #[tokio::test]
    async fn test_alert_and_status_failures_do_not_fail_poll() {
        let (url, _) = serve(vec![(DEVICES_ROUTE, 200, "[]".to_string())]).await;
        let source = KismetPollingSource::new(&config(url)).unwrap();
        let snapshot = source.poll().await.unwrap();
        assert!(snapshot.devices.is_empty());
        assert!(snapshot.alerts.is_empty());
        assert!(snapshot.status.is_none());
        assert!(source.probe().await.is_err());
    }

    #[tokio::test]
    async fn test_device_failure_fails_poll() {
        let body = "{\"error\":\"auth\"}".to_string();
        let (url, _) = serve(vec![(DEVICES_ROUTE, 401, body)]).await;
        let source = KismetPollingSource::new(&config(url)).unwrap();
        assert!(matches!(source.poll().await, Err(BridgeError::Connection(_))));
    }

    #[tokio::test]
    async fn test_non_array_device_view_is_protocol_error() {
        let (url, _) = serve(vec![(DEVICES_ROUTE, 200, "{}".to_string())]).await;
        let source = KismetPollingSource::new(&config(url)).unwrap();
        assert!(matches!(source.poll().await, Err(BridgeError::Protocol(_))));
    }
}
