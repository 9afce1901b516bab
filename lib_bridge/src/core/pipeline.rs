//! # Bridge Pipeline
//!
//! The synchronous heart of the bridge: snapshot → cache/differ → throttler → batcher, plus
//! the device → CoT step for the tactical path. It performs no I/O and owns no timers; the
//! [`BridgeManager`](super::bridge_manager::BridgeManager) actor calls into it on poll results
//! and timer ticks and forwards what comes out to the hub and the broadcaster.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::batcher::{Batcher, BatcherStats, EnqueueOutcome, PRIORITY_IMMEDIATE, PRIORITY_NORMAL};
use super::clock::SharedClock;
use super::differ::apply_snapshot;
use super::hub::HubFrame;
use super::state_cache::{CacheStats, DeviceQuery, StateCache};
use super::throttle::Throttler;
use crate::configs::{AntennaConfig, BridgeConfig, TakFilter};
use crate::errors::Result;
use crate::ingestors::PollSnapshot;
use crate::models::raw::{parse_alert, parse_device, parse_system_status};
use crate::models::{ChangeAction, ChangeRecord, DeviceRecord, Envelope, EventKind, HistorySample};
use crate::tak::cot::{validate_antenna, AntennaSettings, CotEncoder, MarkerColor, TacticalMessage};
use crate::tak::filter::{BroadcastFilter, FilterChange};

/// What one pipeline step produced.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    /// Frames ready for the hub.
    pub frames: Vec<HubFrame>,
    /// CoT messages ready for the broadcaster.
    pub tactical: Vec<TacticalMessage>,
}

/// Counters exposed through the bridge status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub cache: CacheStats,
    pub batcher: BatcherStats,
    pub throttled_events: u64,
    pub malformed_records: u64,
    pub last_alert_ms: i64,
}

/// # Bridge Pipeline
pub struct BridgePipeline {
    clock: SharedClock,
    cache: StateCache,
    throttler: Throttler,
    batcher: Batcher,
    encoder: CotEncoder,
    filter_config: TakFilter,
    filter: BroadcastFilter,
    tak_enabled: bool,
    last_alert_ms: i64,
    malformed_records: u64,
}

impl BridgePipeline {
    pub fn new(config: &BridgeConfig, clock: SharedClock) -> Self {
        Self {
            cache: StateCache::new(config.cache.clone(), clock.clone()),
            throttler: Throttler::new(config.throttle.clone()),
            batcher: Batcher::new(config.batch.clone()),
            encoder: CotEncoder::new(config.tak.cot.clone()),
            filter_config: config.tak.filter.clone(),
            filter: BroadcastFilter::new(&config.tak.filter),
            tak_enabled: config.tak.enabled,
            last_alert_ms: 0,
            malformed_records: 0,
            clock,
        }
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn batcher(&self) -> &Batcher {
        &self.batcher
    }

    /// # Ingest
    ///
    /// Processes one poll cycle. Device changes are derived from this snapshot alone;
    /// malformed records are skipped and counted.
    pub fn ingest(&mut self, snapshot: PollSnapshot) -> PipelineOutput {
        let now = self.clock.now_ms();
        let mut out = PipelineOutput::default();

        let mut devices = Vec::with_capacity(snapshot.devices.len());
        for raw in &snapshot.devices {
            match parse_device(raw) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    self.malformed_records += 1;
                    warn!(error = %e, "Skipping malformed device record");
                }
            }
        }

        let changes = apply_snapshot(&mut self.cache, devices);
        debug!(changes = changes.len(), cached = self.cache.len(), "Snapshot applied");
        for change in changes {
            self.publish_change(&change, now, &mut out);
        }

        self.ingest_alerts(&snapshot.alerts, now, &mut out);

        if let Some(raw) = &snapshot.status {
            match parse_system_status(raw) {
                Ok(status) => {
                    let scan = status.scan_status();
                    self.emit_value(EventKind::SystemStatus, &status, now, &mut out.frames);
                    self.emit_value(EventKind::ScanStatus, &scan, now, &mut out.frames);
                }
                Err(e) => {
                    self.malformed_records += 1;
                    warn!(error = %e, "Skipping malformed system status");
                }
            }
        }
        out
    }

    /// Alerts newer than the last one seen, oldest first.
    fn ingest_alerts(&mut self, raw_alerts: &[Value], now: i64, out: &mut PipelineOutput) {
        let mut alerts = Vec::new();
        for raw in raw_alerts {
            match parse_alert(raw) {
                Ok(alert) => alerts.push(alert),
                Err(e) => {
                    self.malformed_records += 1;
                    warn!(error = %e, "Skipping malformed alert");
                }
            }
        }
        alerts.sort_by_key(|a| a.timestamp_ms);
        for alert in alerts {
            if alert.timestamp_ms <= self.last_alert_ms {
                continue;
            }
            self.last_alert_ms = alert.timestamp_ms;
            self.emit_value(EventKind::AlertNew, &alert, now, &mut out.frames);
        }
    }

    fn publish_change(&mut self, change: &ChangeRecord, now: i64, out: &mut PipelineOutput) {
        let payload = match serde_json::to_value(change) {
            Ok(v) => v,
            Err(e) => {
                warn!(device = %change.id(), error = %e, "Failed to serialize device change");
                return;
            }
        };

        if change.action.is_structural() {
            self.enqueue(
                EventKind::DeviceUpdate,
                payload,
                PRIORITY_IMMEDIATE,
                now,
                &mut out.frames,
            );
        } else if let Some(payload) = self.throttler.offer(EventKind::DeviceUpdate, payload, now) {
            self.enqueue(EventKind::DeviceUpdate, payload, PRIORITY_NORMAL, now, &mut out.frames);
        }

        if self.tak_enabled && change.action != ChangeAction::Remove {
            if let Some(message) = self.tactical_for(&change.device, now) {
                out.tactical.push(message);
            }
        }
    }

    /// CoT for a device, or `None` when the broadcast filter rejects it.
    pub fn tactical_for(&self, device: &DeviceRecord, now_ms: i64) -> Option<TacticalMessage> {
        if !self.filter.admits(device) {
            return None;
        }
        let now = chrono::DateTime::from_timestamp_millis(now_ms)?;
        match self.encoder.encode(device, now) {
            Ok(mut message) => {
                if let Some(argb) = self.filter.color_override(device) {
                    message.detail.color = MarkerColor::Argb(argb);
                }
                Some(message)
            }
            Err(e) => {
                warn!(device = %device.id, error = %e, "Device not encodable as CoT");
                None
            }
        }
    }

    pub fn filter_settings(&self) -> &TakFilter {
        &self.filter_config
    }

    /// Edits the broadcast filter. Applies to every later device change.
    pub fn update_filter(&mut self, change: FilterChange) -> Result<TakFilter> {
        let mut next = self.filter_config.clone();
        change.apply(&mut next)?;
        self.filter = BroadcastFilter::new(&next);
        self.filter_config = next;
        Ok(self.filter_config.clone())
    }

    pub fn antenna_settings(&self) -> AntennaSettings {
        self.encoder.antenna_settings()
    }

    /// Replaces the antenna used for altitude offset and signal compensation.
    pub fn update_antenna(&mut self, antenna: AntennaConfig) -> Result<AntennaSettings> {
        validate_antenna(&antenna)?;
        self.encoder = self.encoder.with_antenna(antenna);
        Ok(self.encoder.antenna_settings())
    }

    /// # Emit
    ///
    /// Publishes an event of any kind. Throttled kinds pass the throttle gate first; `None`
    /// means the event was suppressed.
    pub fn emit(&mut self, kind: EventKind, payload: Value) -> Option<Vec<HubFrame>> {
        let now = self.clock.now_ms();
        let mut frames = Vec::new();
        self.emit_at(kind, payload, now, &mut frames).then_some(frames)
    }

    /// Publishes a connection-state event. Never throttled, flushed at once.
    pub fn emit_urgent(&mut self, kind: EventKind, payload: Value) -> Vec<HubFrame> {
        let now = self.clock.now_ms();
        let mut frames = Vec::new();
        self.enqueue(kind, payload, PRIORITY_IMMEDIATE, now, &mut frames);
        frames
    }

    fn emit_value<T: Serialize>(
        &mut self,
        kind: EventKind,
        value: &T,
        now: i64,
        frames: &mut Vec<HubFrame>,
    ) {
        match serde_json::to_value(value) {
            Ok(payload) => {
                self.emit_at(kind, payload, now, frames);
            }
            Err(e) => warn!(kind = %kind, error = %e, "Failed to serialize event"),
        }
    }

    fn emit_at(
        &mut self,
        kind: EventKind,
        payload: Value,
        now: i64,
        frames: &mut Vec<HubFrame>,
    ) -> bool {
        let payload = if kind.is_throttled() {
            match self.throttler.offer(kind, payload, now) {
                Some(p) => p,
                None => return false,
            }
        } else {
            payload
        };
        self.enqueue(kind, payload, PRIORITY_NORMAL, now, frames);
        true
    }

    fn enqueue(
        &mut self,
        kind: EventKind,
        payload: Value,
        priority: u8,
        now: i64,
        frames: &mut Vec<HubFrame>,
    ) {
        let envelope = Envelope::new(kind.as_str(), payload, now);
        match self.batcher.enqueue(kind, envelope, priority) {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::FlushNow(kind) => frames.extend(self.batcher.flush_kind(kind, now)),
            EnqueueOutcome::Rejected => debug!(kind = %kind, "Event dropped by full batch queue"),
        }
    }

    /// Publishes one `tak:message` per transmitted CoT uid.
    pub fn tak_transmitted(&mut self, uids: Vec<String>) -> Vec<HubFrame> {
        let now = self.clock.now_ms();
        let mut frames = Vec::new();
        for uid in uids {
            let payload = json!({ "uid": uid, "sentAt": now });
            self.emit_at(EventKind::TakMessage, payload, now, &mut frames);
        }
        frames
    }

    /// # Sweep
    ///
    /// Eviction tick: expired and trimmed devices are published as `remove` changes.
    pub fn sweep(&mut self) -> PipelineOutput {
        let now = self.clock.now_ms();
        let mut out = PipelineOutput::default();
        for device in self.cache.sweep().removed() {
            self.publish_change(&ChangeRecord::removed(device), now, &mut out);
        }
        out
    }

    /// # Flush Due
    ///
    /// Batch tick: replays trailing-edge values of closed throttle windows, then flushes one
    /// batch per queued type.
    pub fn flush_due(&mut self) -> Vec<HubFrame> {
        let now = self.clock.now_ms();
        let mut frames = Vec::new();
        for (kind, payload) in self.throttler.close_elapsed(now) {
            self.enqueue(kind, payload, PRIORITY_NORMAL, now, &mut frames);
        }
        frames.extend(self.batcher.flush_all(now));
        frames
    }

    /// Discards undelivered events on shutdown. Returns how many were abandoned.
    pub fn abandon_queued(&mut self) -> usize {
        self.batcher.clear()
    }

    pub fn history(&self, id: &str, limit: usize) -> Vec<HistorySample> {
        self.cache.history(id, limit)
    }

    pub fn active_devices(&self, query: &DeviceQuery) -> Vec<DeviceRecord> {
        self.cache.active_devices(query)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            cache: self.cache.stats(),
            batcher: self.batcher.stats(),
            throttled_events: self.throttler.suppressed(),
            malformed_records: self.malformed_records,
            last_alert_ms: self.last_alert_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::batcher::decode_frame_body;
    use crate::core::clock::ManualClock;
    use std::sync::Arc;

    fn raw_device(mac: &str, signal: i64, last_time: i64) -> Value {
        json!({
            "kismet.device.base.macaddr": mac,
            "kismet.device.base.signal": signal,
            "kismet.device.base.last_time": last_time,
            "kismet.device.base.location": {
                "kismet.common.location.lat": 40.7128,
                "kismet.common.location.lon": -74.006,
                "kismet.common.location.alt": 100.0
            },
            "dot11.device": { "dot11.device.ssid": "TestAP", "dot11.device.ssid_len": 6 }
        })
    }

    fn snapshot(devices: Vec<Value>) -> PollSnapshot {
        PollSnapshot { devices, ..Default::default() }
    }

    fn pipeline() -> (BridgePipeline, Arc<ManualClock>) {
        let clock = ManualClock::new(1_700_000_000_000);
        let mut config = BridgeConfig::default();
        config.tak.cot.antenna.height_m = 2.0;
        (BridgePipeline::new(&config, clock.clone()), clock)
    }

    fn messages(frames: &[HubFrame]) -> Vec<Value> {
        frames
            .iter()
            .flat_map(|f| {
                let body = decode_frame_body(&f.body).unwrap();
                body["messages"].as_array().cloned().unwrap_or_default()
            })
            .collect()
    }

    #[test]
    fn test_new_device_flushes_immediately_with_tactical() {
        let (mut p, _) = pipeline();
        let out = p.ingest(snapshot(vec![raw_device("AA:BB:CC:DD:EE:FF", -70, 1_700_000_000)]));

        let msgs = messages(&out.frames);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["type"], "device:update");
        assert_eq!(msgs[0]["data"]["action"], "new");
        assert_eq!(out.tactical.len(), 1);
        assert_eq!(out.tactical[0].uid, "WIGLE-AABBCCDDEEFF");
        assert_eq!(out.tactical[0].point.hae, 102.0);
    }

    #[test]
    fn test_update_is_throttled_and_batched() {
        let (mut p, clock) = pipeline();
        p.ingest(snapshot(vec![raw_device("AA:BB:CC:DD:EE:FF", -70, 1)]));

        let out = p.ingest(snapshot(vec![raw_device("AA:BB:CC:DD:EE:FF", -45, 2)]));
        assert!(out.frames.is_empty(), "updates wait for the batch tick");
        assert_eq!(out.tactical.len(), 1);

        clock.advance(100);
        let suppressed = p.ingest(snapshot(vec![raw_device("AA:BB:CC:DD:EE:FF", -44, 3)]));
        assert!(suppressed.frames.is_empty());

        let msgs = messages(&p.flush_due());
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["data"]["action"], "update");
        assert_eq!(msgs[0]["data"]["changes"]["signal"], -45);
        assert_eq!(msgs[0]["data"]["changes"]["lastSeen"], 2_000);
        assert_eq!(p.stats().throttled_events, 1);
    }

    #[test]
    fn test_removal_and_malformed_records() {
        let (mut p, _) = pipeline();
        p.ingest(snapshot(vec![raw_device("AA:BB:CC:DD:EE:FF", -70, 1), json!({ "no": "mac" })]));
        assert_eq!(p.stats().malformed_records, 1);
        assert_eq!(p.cache().len(), 1);

        let out = p.ingest(snapshot(vec![]));
        let msgs = messages(&out.frames);
        assert_eq!(msgs[0]["data"]["action"], "remove");
        assert!(out.tactical.is_empty());
        assert!(p.cache().is_empty());
    }

    #[test]
    fn test_alert_watermark_publishes_each_alert_once() {
        let (mut p, _) = pipeline();
        let alert = |ts: i64| {
            json!({
                "kismet.alert.timestamp": ts,
                "kismet.alert.severity": 10,
                "kismet.alert.text": "x"
            })
        };

        p.ingest(PollSnapshot { alerts: vec![alert(20), alert(10)], ..Default::default() });
        p.ingest(PollSnapshot { alerts: vec![alert(20), alert(30)], ..Default::default() });
        let msgs = messages(&p.flush_due());
        let ids: Vec<_> =
            msgs.iter().map(|m| m["data"]["id"].as_str().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["kismet-10", "kismet-20", "kismet-30"]);
        assert_eq!(p.stats().last_alert_ms, 30_000);
    }

    #[test]
    fn test_status_produces_system_and_scan_events() {
        let (mut p, _) = pipeline();
        let status = json!({
            "kismet.system.devices.count": 3,
            "kismet.system.channels.channels": ["6"]
        });
        p.ingest(PollSnapshot { status: Some(status), ..Default::default() });
        let frames = p.flush_due();
        let kinds: Vec<_> = frames.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&EventKind::SystemStatus));
        assert!(kinds.contains(&EventKind::ScanStatus));
        let scan = messages(&frames).into_iter().find(|m| m["type"] == "scan:status").unwrap();
        assert_eq!(scan["data"]["currentChannel"], 6);
    }

    #[test]
    fn test_filtered_device_produces_no_tactical() {
        let clock = ManualClock::new(0);
        let mut config = BridgeConfig::default();
        config.tak.filter.excluded_ssids.insert("TestAP".into());
        let mut p = BridgePipeline::new(&config, clock);
        let out = p.ingest(snapshot(vec![raw_device("AA:BB:CC:DD:EE:FF", -70, 1)]));
        assert!(out.tactical.is_empty());
        assert_eq!(messages(&out.frames).len(), 1);
    }

    #[test]
    fn test_sweep_publishes_expired_removals() {
        let (mut p, clock) = pipeline();
        p.ingest(snapshot(vec![raw_device("AA:BB:CC:DD:EE:FF", -70, 1)]));
        clock.advance(3_600_001);
        let out = p.sweep();
        let msgs = messages(&out.frames);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["data"]["action"], "remove");
    }

    #[test]
    fn test_runtime_filter_and_antenna_changes_apply_to_next_ingest() {
        let (mut p, clock) = pipeline();
        let change = FilterChange::ExcludeSsid { ssid: "TestAP".into() };
        assert!(p.update_filter(change).unwrap().excluded_ssids.contains("TestAP"));
        let out = p.ingest(snapshot(vec![raw_device("AA:BB:CC:DD:EE:FF", -70, 1)]));
        assert!(out.tactical.is_empty());

        p.update_filter(FilterChange::IncludeSsid { ssid: "TestAP".into() }).unwrap();
        let antenna =
            AntennaConfig { height_m: 10.0, sensitivity: "high_gain".into(), custom_factor: None };
        assert_eq!(p.update_antenna(antenna).unwrap().factor, 2.0);
        let unknown = AntennaConfig { sensitivity: "dish".into(), ..AntennaConfig::default() };
        assert!(p.update_antenna(unknown).is_err());
        assert_eq!(p.antenna_settings().antenna.height_m, 10.0);

        clock.advance(1_000);
        let out = p.ingest(snapshot(vec![raw_device("AA:BB:CC:DD:EE:FF", -60, 2)]));
        assert_eq!(out.tactical.len(), 1);
        assert_eq!(out.tactical[0].point.hae, 110.0);
    }
}
