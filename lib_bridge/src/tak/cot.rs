//! # Cursor-on-Target Encoding
//!
//! A pure transform from a [`DeviceRecord`] plus [`CotConfig`] into a [`TacticalMessage`], and
//! from there into CoT XML:
//!
//! ```text
//! <event version="2.0" uid="WIGLE-AABBCCDDEEFF" type="a-f-G-U-C-I" how="m-g" time=".." start=".." stale="..">
//!   <point lat=".." lon=".." hae=".." ce=".." le=".."/>
//!   <detail>..</detail>
//! </event>
//! ```
//!
//! The signal shown and used for classification is compensated for the antenna:
//! `round(raw + 10·log10(factor))`.

use std::fmt::Write as _;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, TimeZone, Utc};
use serde::Serialize;

use crate::configs::{AntennaConfig, CotConfig};
use crate::errors::{BridgeError, Result};
use crate::models::{DeviceRecord, DeviceType};

/// Named display colors and their RGB hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayColor {
    Red,
    Orange,
    Yellow,
    Green,
    Blue,
    Cyan,
    Gray,
}

impl DisplayColor {
    pub fn hex(&self) -> &'static str {
        match self {
            DisplayColor::Red => "FF0000",
            DisplayColor::Orange => "FF8C00",
            DisplayColor::Yellow => "FFFF00",
            DisplayColor::Green => "00FF00",
            DisplayColor::Blue => "0000FF",
            DisplayColor::Cyan => "00FFFF",
            DisplayColor::Gray => "808080",
        }
    }
}

/// Fill color of a marker: a named color, or an explicit ARGB value from an override list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerColor {
    Named(DisplayColor),
    Argb(i64),
}

impl MarkerColor {
    fn argb_attr(&self) -> String {
        match self {
            MarkerColor::Named(color) => format!("-1-{}", color.hex()),
            MarkerColor::Argb(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TacticalPoint {
    pub lat: f64,
    pub lon: f64,
    /// Height above ellipsoid, meters.
    pub hae: f64,
    /// Circular error, meters.
    pub ce: f64,
    /// Linear error, meters.
    pub le: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TacticalDetail {
    pub callsign: String,
    pub remarks: String,
    pub color: MarkerColor,
    pub stroke_color: DisplayColor,
    pub stroke_weight: u32,
    /// Extra `<name>value</name>` elements, in order.
    pub custom: Vec<(String, String)>,
}

/// # Tactical Message
///
/// One CoT event. Built per send and never retained past the broadcaster queue.
#[derive(Debug, Clone, PartialEq)]
pub struct TacticalMessage {
    pub uid: String,
    pub cot_type: String,
    pub how: String,
    pub time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub stale: DateTime<Utc>,
    pub point: TacticalPoint,
    pub detail: TacticalDetail,
}

impl TacticalMessage {
    /// A message whose `stale` is not strictly after `time`, or whose point is off the globe,
    /// must not be sent.
    pub fn validate(&self) -> Result<()> {
        if self.stale <= self.time {
            return Err(BridgeError::Protocol(format!(
                "CoT {} has stale {} not after time {}",
                self.uid, self.stale, self.time
            )));
        }
        let TacticalPoint { lat, lon, .. } = self.point;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(BridgeError::Protocol(format!(
                "CoT {} has out-of-range point {},{}",
                self.uid, self.point.lat, self.point.lon
            )));
        }
        Ok(())
    }

    /// Serializes to CoT XML after validating.
    pub fn to_xml(&self) -> Result<String> {
        self.validate()?;
        let ts = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut xml = String::with_capacity(768);
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            xml,
            "<event version=\"2.0\" uid=\"{}\" type=\"{}\" how=\"{}\" \
             time=\"{}\" start=\"{}\" stale=\"{}\">",
            escape_xml(&self.uid),
            escape_xml(&self.cot_type),
            escape_xml(&self.how),
            ts(&self.time),
            ts(&self.start),
            ts(&self.stale),
        );
        let p = &self.point;
        let _ = writeln!(
            xml,
            "  <point lat=\"{}\" lon=\"{}\" hae=\"{}\" ce=\"{}\" le=\"{}\"/>",
            p.lat, p.lon, p.hae, p.ce, p.le
        );

        let d = &self.detail;
        xml.push_str("  <detail>\n");
        let _ = writeln!(xml, "    <contact callsign=\"{}\"/>", escape_xml(&d.callsign));
        let _ = writeln!(xml, "    <remarks>{}</remarks>", escape_xml(&d.remarks));
        let _ = writeln!(
            xml,
            "    <color argb=\"{}\" strokeColor=\"{}\" strokeWeight=\"{}\"/>",
            d.color.argb_attr(),
            d.stroke_color.hex(),
            d.stroke_weight
        );
        for (name, value) in &d.custom {
            let _ = writeln!(xml, "    <{0}>{1}</{0}>", name, escape_xml(value));
        }
        xml.push_str("  </detail>\n</event>");
        Ok(xml)
    }
}

/// Escapes the five XML-reserved characters.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Antenna presets accepted at runtime.
pub const SENSITIVITY_PRESETS: [&str; 5] =
    ["standard", "alfa_card", "high_gain", "rpi_internal", "custom"];

/// Checks an antenna change before it replaces the running one.
pub fn validate_antenna(antenna: &AntennaConfig) -> Result<()> {
    if !antenna.height_m.is_finite() {
        return Err(BridgeError::Config("antenna height must be a finite number".into()));
    }
    if !SENSITIVITY_PRESETS.contains(&antenna.sensitivity.as_str()) {
        return Err(BridgeError::Config(format!(
            "unknown antenna sensitivity {:?}, expected one of {}",
            antenna.sensitivity,
            SENSITIVITY_PRESETS.join(", ")
        )));
    }
    if antenna.sensitivity == "custom"
        && !antenna.custom_factor.is_some_and(|f| f.is_finite() && f > 0.0)
    {
        return Err(BridgeError::Config("custom sensitivity needs a positive customFactor".into()));
    }
    Ok(())
}

/// The running antenna configuration and the factor derived from it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AntennaSettings {
    #[serde(flatten)]
    pub antenna: AntennaConfig,
    pub factor: f64,
}

/// Multiplier of an antenna preset. Unknown presets, and `custom` without a positive factor,
/// use 1.0.
pub fn sensitivity_factor(antenna: &AntennaConfig) -> f64 {
    match antenna.sensitivity.as_str() {
        "standard" => 1.0,
        "alfa_card" => 1.5,
        "high_gain" => 2.0,
        "rpi_internal" => 0.7,
        "custom" => antenna.custom_factor.filter(|f| f.is_finite() && *f > 0.0).unwrap_or(1.0),
        _ => 1.0,
    }
}

/// # CoT Encoder
#[derive(Debug, Clone)]
pub struct CotEncoder {
    config: CotConfig,
    factor: f64,
}

impl CotEncoder {
    pub fn new(config: CotConfig) -> Self {
        let factor = sensitivity_factor(&config.antenna);
        Self { config, factor }
    }

    pub fn config(&self) -> &CotConfig {
        &self.config
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn antenna_settings(&self) -> AntennaSettings {
        AntennaSettings { antenna: self.config.antenna.clone(), factor: self.factor }
    }

    /// Same encoder with another antenna.
    pub fn with_antenna(&self, antenna: AntennaConfig) -> Self {
        Self::new(CotConfig { antenna, ..self.config.clone() })
    }

    /// `round(raw + 10·log10(factor))`.
    pub fn compensate(&self, raw_dbm: i32) -> i32 {
        (raw_dbm as f64 + 10.0 * self.factor.log10()).round() as i32
    }

    /// `<PREFIX>-<id without separators>`.
    pub fn uid_for(&self, device_id: &str) -> String {
        let stripped: String =
            device_id.chars().filter(|c| !matches!(c, ':' | '-' | '.')).collect();
        format!("{}-{}", self.config.uid_prefix, stripped)
    }

    fn classify(&self, device: &DeviceRecord, compensated: i32) -> &'static str {
        if compensated > self.config.thresholds.hostile_dbm {
            return "a-h-G";
        }
        match device.device_type {
            DeviceType::AccessPoint => "a-f-G-U-C-I",
            DeviceType::Client => "a-f-G-U-C",
            DeviceType::Unknown => "a-u-G",
        }
    }

    fn fill_color(&self, compensated: i32) -> DisplayColor {
        let t = &self.config.thresholds;
        if compensated >= t.red_dbm {
            DisplayColor::Red
        } else if compensated >= t.orange_dbm {
            DisplayColor::Orange
        } else if compensated >= t.yellow_dbm {
            DisplayColor::Yellow
        } else {
            DisplayColor::Green
        }
    }

    fn stroke_color(device_type: DeviceType) -> DisplayColor {
        match device_type {
            DeviceType::AccessPoint => DisplayColor::Blue,
            DeviceType::Client => DisplayColor::Cyan,
            DeviceType::Unknown => DisplayColor::Gray,
        }
    }

    fn remarks(&self, device: &DeviceRecord, compensated: i32) -> String {
        let mut parts = Vec::with_capacity(8);
        if let Some(ssid) = &device.ssid {
            parts.push(format!("SSID: {}", ssid));
        }
        parts.push(format!("MAC: {}", device.id));
        if let Some(manufacturer) = &device.manufacturer {
            parts.push(format!("Manufacturer: {}", manufacturer));
        }
        parts.push(format!("Signal: {} dBm (raw: {} dBm)", compensated, device.signal));
        if device.channel > 0 {
            parts.push(format!("Channel: {}", device.channel));
        }
        if let Some(encryption) = &device.encryption {
            parts.push(format!("Encryption: {}", encryption));
        }
        if let Some(last_seen) = Utc.timestamp_millis_opt(device.last_seen_ms).single() {
            let stamp = last_seen.to_rfc3339_opts(SecondsFormat::Secs, true);
            parts.push(format!("Last seen: {}", stamp));
        }
        if device.packets.total > 0 {
            parts.push(format!("Packets: {}", device.packets.total));
        }
        parts.join(" | ")
    }

    /// # Encode
    ///
    /// Maps a device to a tactical message stamped `now`. Devices without a fix are placed at
    /// 0,0; callers that broadcast filter those out beforehand.
    pub fn encode(&self, device: &DeviceRecord, now: DateTime<Utc>) -> Result<TacticalMessage> {
        let compensated = self.compensate(device.signal);
        let location = device.location;
        let accuracy = location
            .and_then(|l| l.accuracy)
            .filter(|a| *a > 0.0)
            .unwrap_or(self.config.default_accuracy_m);

        let point = TacticalPoint {
            lat: location.map_or(0.0, |l| l.lat),
            lon: location.map_or(0.0, |l| l.lon),
            hae: location.and_then(|l| l.alt).unwrap_or(0.0) + self.config.antenna.height_m,
            ce: accuracy,
            le: accuracy,
        };

        let mut custom = Vec::with_capacity(5);
        if let Some(manufacturer) = &device.manufacturer {
            custom.push(("manufacturer".to_string(), manufacturer.clone()));
        }
        custom.push(("signal".to_string(), compensated.to_string()));
        custom.push(("signalRaw".to_string(), device.signal.to_string()));
        if device.channel > 0 {
            custom.push(("channel".to_string(), device.channel.to_string()));
        }
        if let Some(encryption) = &device.encryption {
            custom.push(("encryption".to_string(), encryption.clone()));
        }

        let message = TacticalMessage {
            uid: self.uid_for(&device.id),
            cot_type: self.classify(device, compensated).to_string(),
            how: "m-g".to_string(),
            time: now,
            start: now,
            stale: now + ChronoDuration::milliseconds(self.config.stale_after_ms as i64),
            point,
            detail: TacticalDetail {
                callsign: device.ssid.clone().unwrap_or_else(|| device.id.clone()),
                remarks: self.remarks(device, compensated),
                color: MarkerColor::Named(self.fill_color(compensated)),
                stroke_color: Self::stroke_color(device.device_type),
                stroke_weight: 2,
                custom,
            },
        };
        message.validate()?;
        Ok(message)
    }
}
