//! Which devices reach the TAK target, and with which marker color.

use serde::Deserialize;

use crate::configs::TakFilter;
use crate::errors::{BridgeError, Result};
use crate::models::DeviceRecord;

/// Normalizes a MAC for comparison: upper-case, separators removed.
fn mac_key(mac: &str) -> String {
    mac.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// One runtime edit of the broadcast filter.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FilterChange {
    ExcludeSsid { ssid: String },
    IncludeSsid { ssid: String },
    ExcludeMac { mac: String },
    IncludeMac { mac: String },
    /// Marker color for a device, keyed by SSID or MAC.
    SetColor { key: String, argb: i64 },
    ClearColor { key: String },
}

impl FilterChange {
    /// Applies the edit. Removing an entry that is not there is a config error.
    pub fn apply(self, filter: &mut TakFilter) -> Result<()> {
        let missing = |what: &str, key: &str| {
            BridgeError::Config(format!("{} {} is not in the filter", what, key))
        };
        match self {
            FilterChange::ExcludeSsid { ssid } => {
                filter.excluded_ssids.insert(ssid);
            }
            FilterChange::IncludeSsid { ssid } => {
                if !filter.excluded_ssids.remove(&ssid) {
                    return Err(missing("SSID", &ssid));
                }
            }
            FilterChange::ExcludeMac { mac } => {
                filter.excluded_macs.insert(mac);
            }
            FilterChange::IncludeMac { mac } => {
                let key = mac_key(&mac);
                let before = filter.excluded_macs.len();
                filter.excluded_macs.retain(|m| mac_key(m) != key);
                if filter.excluded_macs.len() == before {
                    return Err(missing("MAC", &mac));
                }
            }
            FilterChange::SetColor { key, argb } => {
                filter.color_overrides.insert(key, argb);
            }
            FilterChange::ClearColor { key } => {
                if filter.color_overrides.remove(&key).is_none() {
                    return Err(missing("color override", &key));
                }
            }
        }
        Ok(())
    }
}

/// Compiled form of [`TakFilter`].
#[derive(Debug, Clone, Default)]
pub struct BroadcastFilter {
    excluded_ssids: Vec<String>,
    excluded_macs: Vec<String>,
    overrides: Vec<(String, i64)>,
    require_location: bool,
}

impl BroadcastFilter {
    pub fn new(config: &TakFilter) -> Self {
        Self {
            excluded_ssids: config.excluded_ssids.iter().cloned().collect(),
            excluded_macs: config.excluded_macs.iter().map(|m| mac_key(m)).collect(),
            overrides: config.color_overrides.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            require_location: config.require_location,
        }
    }

    /// Whether a device may be broadcast.
    pub fn admits(&self, device: &DeviceRecord) -> bool {
        if self.require_location && device.location.is_none() {
            return false;
        }
        if let Some(ssid) = &device.ssid {
            if self.excluded_ssids.iter().any(|s| s == ssid) {
                return false;
            }
        }
        let mac = mac_key(&device.id);
        !self.excluded_macs.iter().any(|m| *m == mac)
    }

    /// ARGB override for a device, looked up by SSID first, then MAC.
    pub fn color_override(&self, device: &DeviceRecord) -> Option<i64> {
        let mac = mac_key(&device.id);
        let by_ssid = device
            .ssid
            .as_ref()
            .and_then(|ssid| self.overrides.iter().find(|(k, _)| k == ssid));
        by_ssid
            .or_else(|| self.overrides.iter().find(|(k, _)| mac_key(k) == mac))
            .map(|(_, argb)| *argb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GeoLocation;

    fn located(id: &str, ssid: Option<&str>) -> DeviceRecord {
        let mut d = DeviceRecord::new(id);
        d.ssid = ssid.map(str::to_string);
        d.location = Some(GeoLocation { lat: 1.0, lon: 1.0, alt: None, accuracy: None });
        d
    }

    #[test]
    fn test_exclusions_and_location_requirement() {
        let mut config = TakFilter::default();
        config.excluded_ssids.insert("HomeNet".into());
        config.excluded_macs.insert("aa-bb-cc-dd-ee-ff".into());
        let filter = BroadcastFilter::new(&config);

        assert!(!filter.admits(&located("11:11:11:11:11:11", Some("HomeNet"))));
        assert!(!filter.admits(&located("AA:BB:CC:DD:EE:FF", None)));
        assert!(filter.admits(&located("22:22:22:22:22:22", Some("Cafe"))));
        assert!(!filter.admits(&DeviceRecord::new("33:33:33:33:33:33")));
    }

    #[test]
    fn test_color_override_by_ssid_then_mac() {
        let mut config = TakFilter::default();
        config.color_overrides.insert("Target".into(), -65536);
        config.color_overrides.insert("22:22:22:22:22:22".into(), -16776961);
        let filter = BroadcastFilter::new(&config);

        let target = located("11:11:11:11:11:11", Some("Target"));
        assert_eq!(filter.color_override(&target), Some(-65536));
        assert_eq!(filter.color_override(&located("22:22:22:22:22:22", None)), Some(-16776961));
        assert_eq!(filter.color_override(&located("33:33:33:33:33:33", Some("Other"))), None);
    }

    #[test]
    fn test_filter_changes_edit_lists() {
        let mut config = TakFilter::default();
        let change: FilterChange =
            serde_json::from_str(r#"{"op":"excludeMac","mac":"aa:bb:cc:dd:ee:ff"}"#).unwrap();
        change.apply(&mut config).unwrap();
        FilterChange::ExcludeSsid { ssid: "HomeNet".into() }.apply(&mut config).unwrap();
        FilterChange::SetColor { key: "Target".into(), argb: -65536 }.apply(&mut config).unwrap();
        assert!(!BroadcastFilter::new(&config).admits(&located("AA:BB:CC:DD:EE:FF", None)));

        FilterChange::IncludeMac { mac: "AA-BB-CC-DD-EE-FF".into() }.apply(&mut config).unwrap();
        assert!(config.excluded_macs.is_empty());
        assert!(matches!(
            FilterChange::IncludeSsid { ssid: "Cafe".into() }.apply(&mut config),
            Err(BridgeError::Config(_))
        ));
        FilterChange::ClearColor { key: "Target".into() }.apply(&mut config).unwrap();
        assert!(FilterChange::ClearColor { key: "Target".into() }.apply(&mut config).is_err());
        assert_eq!(config.excluded_ssids.len(), 1);
    }
}
