//! # Raw Attribute Parsing
//!
//! Kismet answers with flat, dotted-key JSON objects (`kismet.device.base.macaddr`, ...). This
//! module is the only place those keys are known; everything past it works on typed records.
//!
//! Defaults for absent or malformed optional fields:
//!
//! | Field | Default |
//! |---|---|
//! | name | SSID, else `kismet.device.base.name`, else the MAC |
//! | signal | -100 dBm (accepts a number or a `last_signal` object) |
//! | channel | 0 when missing or not numeric |
//! | frequency, packet counters | 0 |
//! | first/last seen | 0; seconds are converted to milliseconds |
//! | location | none when missing or reported as 0/0 |
//! | accuracy | the fix value when positive |
//! | encryption | `kismet.device.base.crypt`, else `dot11.device.beacon_info` |
//!
//! A record without a MAC address is a protocol error; the caller skips it.

use serde_json::{Map, Value};

use super::alert::{AlertRecord, SeverityLevel, SystemStatus};
use super::device::{DeviceRecord, DeviceType, GeoLocation, PacketCounters};
use crate::errors::{BridgeError, Result};

const MACADDR: &str = "kismet.device.base.macaddr";
const NAME: &str = "kismet.device.base.name";
const TYPE: &str = "kismet.device.base.type";
const CHANNEL: &str = "kismet.device.base.channel";
const FREQUENCY: &str = "kismet.device.base.frequency";
const SIGNAL: &str = "kismet.device.base.signal";
const FIRST_TIME: &str = "kismet.device.base.first_time";
const LAST_TIME: &str = "kismet.device.base.last_time";
const PACKETS_TOTAL: &str = "kismet.device.base.packets.total";
const PACKETS_DATA: &str = "kismet.device.base.packets.data";
const PACKETS_RETRY: &str = "kismet.device.base.packets.retry";
const LOCATION: &str = "kismet.device.base.location";
const MANUF: &str = "kismet.device.base.manuf";
const CRYPT: &str = "kismet.device.base.crypt";
const DOT11: &str = "dot11.device";

/// Device fields requested from Kismet on every poll.
pub const DEVICE_FIELDS: [&str; 17] = [
    "kismet.device.base.key",
    MACADDR,
    NAME,
    TYPE,
    "kismet.device.base.phyname",
    FREQUENCY,
    CHANNEL,
    SIGNAL,
    FIRST_TIME,
    LAST_TIME,
    PACKETS_TOTAL,
    PACKETS_DATA,
    PACKETS_RETRY,
    LOCATION,
    MANUF,
    CRYPT,
    DOT11,
];

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| BridgeError::Protocol(format!("{} record is not an object", what)))
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn f64_field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64)
}

fn u64_field(obj: &Map<String, Value>, key: &str) -> u64 {
    obj.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn seconds_to_ms(obj: &Map<String, Value>, key: &str) -> i64 {
    f64_field(obj, key).map(|s| (s * 1000.0) as i64).unwrap_or(0)
}

fn parse_signal(value: Option<&Value>) -> i32 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::Object(inner)) => inner
            .get("kismet.common.signal.last_signal")
            .or_else(|| inner.get("last_signal"))
            .and_then(Value::as_f64),
        _ => None,
    };
    match raw {
        // Kismet reports 0 when it has no reading.
        Some(dbm) if dbm != 0.0 => dbm.round() as i32,
        _ => -100,
    }
}

fn parse_channel(value: Option<&Value>) -> u32 {
    match value {
        Some(Value::String(s)) => s
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().map(|c| c as u32).unwrap_or(0),
        _ => 0,
    }
}

fn parse_location(value: Option<&Value>) -> Option<GeoLocation> {
    let obj = value?.as_object()?;
    // Newer Kismet nests the fix under `last`; older releases flatten it.
    let fix = obj
        .get("kismet.common.location.last")
        .and_then(Value::as_object)
        .unwrap_or(obj);

    let lat = f64_field(fix, "kismet.common.location.lat")?;
    let lon = f64_field(fix, "kismet.common.location.lon")?;
    if lat == 0.0 && lon == 0.0 {
        return None;
    }
    Some(GeoLocation {
        lat,
        lon,
        alt: f64_field(fix, "kismet.common.location.alt"),
        accuracy: f64_field(fix, "kismet.common.location.fix").filter(|f| *f > 0.0),
    })
}

/// AP when Kismet says so or an SSID is advertised; Client when Kismet says so or the device
/// has associated clients; otherwise Unknown.
fn detect_type(obj: &Map<String, Value>, dot11: Option<&Map<String, Value>>) -> DeviceType {
    let kind = str_field(obj, TYPE).unwrap_or_default();
    let ssid_len = dot11.map(|d| u64_field(d, "dot11.device.ssid_len")).unwrap_or(0);
    let has_clients = dot11
        .and_then(|d| d.get("dot11.device.client_map"))
        .and_then(Value::as_object)
        .is_some_and(|m| !m.is_empty());

    if kind == "Wi-Fi AP" || ssid_len > 0 {
        DeviceType::AccessPoint
    } else if kind == "Wi-Fi Client" || has_clients {
        DeviceType::Client
    } else {
        DeviceType::Unknown
    }
}

/// Parses one entry of the device snapshot.
pub fn parse_device(value: &Value) -> Result<DeviceRecord> {
    let obj = as_object(value, "device")?;
    let id = str_field(obj, MACADDR)
        .ok_or_else(|| BridgeError::Protocol(format!("device record without {}", MACADDR)))?
        .to_string();

    let dot11 = obj.get(DOT11).and_then(Value::as_object);
    let ssid = dot11
        .and_then(|d| str_field(d, "dot11.device.ssid"))
        .map(str::to_string);
    let name = ssid
        .clone()
        .or_else(|| str_field(obj, NAME).map(str::to_string))
        .unwrap_or_else(|| id.clone());
    let encryption = str_field(obj, CRYPT)
        .or_else(|| dot11.and_then(|d| str_field(d, "dot11.device.beacon_info")))
        .map(str::to_string);

    Ok(DeviceRecord {
        name,
        ssid,
        device_type: detect_type(obj, dot11),
        channel: parse_channel(obj.get(CHANNEL)),
        frequency: f64_field(obj, FREQUENCY).map(|f| f as u64).unwrap_or(0),
        signal: parse_signal(obj.get(SIGNAL)),
        first_seen_ms: seconds_to_ms(obj, FIRST_TIME),
        last_seen_ms: seconds_to_ms(obj, LAST_TIME),
        location: parse_location(obj.get(LOCATION)),
        packets: PacketCounters {
            total: u64_field(obj, PACKETS_TOTAL),
            data: u64_field(obj, PACKETS_DATA),
            retry: u64_field(obj, PACKETS_RETRY),
        },
        manufacturer: str_field(obj, MANUF).map(str::to_string),
        encryption,
        id,
    })
}

/// Parses one alert. The timestamp is required; it doubles as the alert id.
pub fn parse_alert(value: &Value) -> Result<AlertRecord> {
    let obj = as_object(value, "alert")?;
    let ts_secs = f64_field(obj, "kismet.alert.timestamp")
        .ok_or_else(|| BridgeError::Protocol("alert without kismet.alert.timestamp".into()))?;
    let severity = u64_field(obj, "kismet.alert.severity") as u32;
    let text = |key: &str| str_field(obj, key).unwrap_or_default().to_string();

    Ok(AlertRecord {
        id: format!("kismet-{}", ts_secs),
        class: text("kismet.alert.class"),
        header: text("kismet.alert.header"),
        severity,
        level: SeverityLevel::from_ordinal(severity),
        message: text("kismet.alert.text"),
        timestamp_ms: (ts_secs * 1000.0) as i64,
        device_key: str_field(obj, "kismet.alert.device_key").map(str::to_string),
    })
}

/// Parses the system-status document. Every field is optional.
pub fn parse_system_status(value: &Value) -> Result<SystemStatus> {
    let obj = as_object(value, "system status")?;
    let channels = obj
        .get("kismet.system.channels.channels")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|c| match c {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(SystemStatus {
        devices_count: u64_field(obj, "kismet.system.devices.count"),
        packets_rate: f64_field(obj, "kismet.system.packets.rate").map(|r| r as u64).unwrap_or(0),
        channels,
        memory_rss: obj.get("kismet.system.memory.rss").and_then(Value::as_u64),
        battery_percentage: obj.get("kismet.system.battery.percentage").and_then(Value::as_i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_access_point() {
        let raw = json!({
            "kismet.device.base.macaddr": "AA:BB:CC:DD:EE:FF",
            "kismet.device.base.name": "ignored-when-ssid",
            "kismet.device.base.type": "Wi-Fi AP",
            "kismet.device.base.channel": "6",
            "kismet.device.base.frequency": 2437000,
            "kismet.device.base.signal": { "kismet.common.signal.last_signal": -62 },
            "kismet.device.base.first_time": 1700000000,
            "kismet.device.base.last_time": 1700000042,
            "kismet.device.base.packets.total": 120,
            "kismet.device.base.manuf": "Acme",
            "kismet.device.base.location": {
                "kismet.common.location.last": {
                    "kismet.common.location.lat": 40.7128,
                    "kismet.common.location.lon": -74.006,
                    "kismet.common.location.alt": 100.0,
                    "kismet.common.location.fix": 3
                }
            },
            "dot11.device": {
                "dot11.device.ssid": "TestAP",
                "dot11.device.ssid_len": 6,
                "dot11.device.beacon_info": "WPA2"
            }
        });

        let device = parse_device(&raw).unwrap();
        assert_eq!(device.id, "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.name, "TestAP");
        assert_eq!(device.device_type, DeviceType::AccessPoint);
        assert_eq!(device.channel, 6);
        assert_eq!(device.signal, -62);
        assert_eq!(device.last_seen_ms, 1_700_000_042_000);
        assert_eq!(device.packets.total, 120);
        assert_eq!(device.encryption.as_deref(), Some("WPA2"));
        let location = device.location.unwrap();
        assert_eq!(location.alt, Some(100.0));
        assert_eq!(location.accuracy, Some(3.0));
    }

    #[test]
    fn test_parse_minimal_record_uses_defaults() {
        let raw = json!({
            "kismet.device.base.macaddr": "11:22:33:44:55:66",
            "kismet.device.base.channel": "bogus"
        });
        let device = parse_device(&raw).unwrap();
        assert_eq!(device.name, "11:22:33:44:55:66");
        assert_eq!(device.signal, -100);
        assert_eq!(device.channel, 0);
        assert_eq!(device.device_type, DeviceType::Unknown);
        assert!(device.location.is_none());
    }

    #[test]
    fn test_zero_location_is_absent() {
        let raw = json!({
            "kismet.device.base.macaddr": "11:22:33:44:55:66",
            "kismet.device.base.location": {
                "kismet.common.location.lat": 0.0,
                "kismet.common.location.lon": 0.0
            }
        });
        assert!(parse_device(&raw).unwrap().location.is_none());
    }

    #[test]
    fn test_client_detected_from_client_map() {
        let raw = json!({
            "kismet.device.base.macaddr": "11:22:33:44:55:66",
            "kismet.device.base.signal": -40,
            "dot11.device": { "dot11.device.client_map": { "x": {} } }
        });
        let device = parse_device(&raw).unwrap();
        assert_eq!(device.device_type, DeviceType::Client);
        assert_eq!(device.signal, -40);
    }

    #[test]
    fn test_missing_mac_is_protocol_error() {
        let err = parse_device(&json!({ "kismet.device.base.name": "x" })).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
        assert!(parse_device(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_parse_alert() {
        let raw = json!({
            "kismet.alert.timestamp": 1700000100,
            "kismet.alert.class": "DEAUTHFLOOD",
            "kismet.alert.header": "Deauth flood",
            "kismet.alert.severity": 15,
            "kismet.alert.text": "Deauth flood detected"
        });
        let alert = parse_alert(&raw).unwrap();
        assert_eq!(alert.id, "kismet-1700000100");
        assert_eq!(alert.level, SeverityLevel::High);
        assert_eq!(alert.timestamp_ms, 1_700_000_100_000);
        assert!(alert.device_key.is_none());
    }

    #[test]
    fn test_parse_system_status() {
        let raw = json!({
            "kismet.system.devices.count": 33,
            "kismet.system.packets.rate": 120.5,
            "kismet.system.channels.channels": ["11", "1"]
        });
        let status = parse_system_status(&raw).unwrap();
        assert_eq!(status.devices_count, 33);
        assert_eq!(status.packets_rate, 120);
        assert_eq!(status.scan_status().current_channel, Some(11));
    }
}
