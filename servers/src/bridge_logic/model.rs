use serde::{Deserialize, Serialize};

use lib_bridge::core::DeviceQuery;
use lib_bridge::models::{Channel, DeviceType};

/// What a dashboard client may send: `{"subscribe": ["devices"]}`, `{"unsubscribe": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub subscribe: Option<Vec<String>>,
    pub unsubscribe: Option<Vec<String>>,
}

/// Control replies. Data frames are sent as the batch JSON itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<Channel>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerMessage {
    pub fn welcome(client_id: u64) -> Self {
        Self {
            r#type: "welcome".into(),
            client_id: Some(client_id),
            channels: Some(Channel::ALL.to_vec()),
            error: None,
        }
    }

    /// Current membership after a subscribe/unsubscribe.
    pub fn subscriptions(channels: Vec<Channel>) -> Self {
        Self {
            r#type: "subscriptions".into(),
            client_id: None,
            channels: Some(channels),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            r#type: "error".into(),
            client_id: None,
            channels: None,
            error: Some(message.into()),
        }
    }
}

/// Splits requested names into known channels and unknown names.
pub fn parse_channels(names: &[String]) -> (Vec<Channel>, Vec<String>) {
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for name in names {
        match name.trim().to_ascii_lowercase().parse::<Channel>() {
            Ok(channel) => known.push(channel),
            Err(_) => unknown.push(name.clone()),
        }
    }
    (known, unknown)
}

/// Query string of `GET /devices`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicesParams {
    pub max_age_ms: Option<i64>,
    pub min_signal: Option<i32>,
    pub r#type: Option<String>,
    pub ssid: Option<String>,
}

impl DevicesParams {
    pub fn into_query(self) -> Result<DeviceQuery, String> {
        let device_type = match self.r#type {
            Some(name) => Some(
                DeviceType::parse(&name)
                    .ok_or_else(|| format!("unknown device type '{}'", name))?,
            ),
            None => None,
        };
        Ok(DeviceQuery {
            max_age_ms: self.max_age_ms,
            min_signal: self.min_signal,
            device_type,
            ssid_contains: self.ssid,
        })
    }
}

/// Query string of `GET /devices/{id}/history`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channels_splits_unknown() {
        let names = vec!["devices".to_string(), " Alerts ".to_string(), "weather".to_string()];
        let (known, unknown) = parse_channels(&names);
        assert_eq!(known, vec![Channel::Devices, Channel::Alerts]);
        assert_eq!(unknown, vec!["weather".to_string()]);
    }

    #[test]
    fn test_client_message_accepts_either_field() {
        let msg: ClientMessage = serde_json::from_str(r#"{"unsubscribe":["tak"]}"#).unwrap();
        assert!(msg.subscribe.is_none());
        assert_eq!(msg.unsubscribe.unwrap(), vec!["tak"]);
    }

    #[test]
    fn test_devices_params_into_query() {
        let params = DevicesParams {
            r#type: Some("AP".into()),
            min_signal: Some(-80),
            ..Default::default()
        };
        let query = params.into_query().unwrap();
        assert_eq!(query.device_type, Some(DeviceType::AccessPoint));
        assert_eq!(query.min_signal, Some(-80));
        let unknown = DevicesParams { r#type: Some("toaster".into()), ..Default::default() };
        assert!(unknown.into_query().is_err());
    }

    #[test]
    fn test_welcome_serialization() {
        let json = serde_json::to_value(ServerMessage::welcome(7)).unwrap();
        assert_eq!(json["type"], "welcome");
        assert_eq!(json["clientId"], 7);
        assert!(json.get("error").is_none());
    }
}
