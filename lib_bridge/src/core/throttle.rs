//! # Event Throttler
//!
//! Per-event-type minimum re-emit interval. The first event of a type opens a window and is
//! delivered at once; later events of the same type inside the window are suppressed. With
//! [`TrailingEdge::Replay`] the newest suppressed payload is delivered when the window closes,
//! which opens the next window.

use std::collections::HashMap;

use serde_json::Value;

use crate::configs::{ThrottleConfig, TrailingEdge};
use crate::models::EventKind;

#[derive(Debug)]
struct Window {
    opened_at_ms: i64,
    interval_ms: i64,
    pending: Option<Value>,
}

impl Window {
    fn is_open(&self, now_ms: i64) -> bool {
        now_ms < self.opened_at_ms + self.interval_ms
    }
}

/// # Throttler
#[derive(Debug)]
pub struct Throttler {
    config: ThrottleConfig,
    windows: HashMap<EventKind, Window>,
    suppressed: u64,
}

impl Throttler {
    pub fn new(config: ThrottleConfig) -> Self {
        Self { config, windows: HashMap::new(), suppressed: 0 }
    }

    pub fn interval_ms(&self, kind: EventKind) -> i64 {
        self.config
            .intervals_ms
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.config.default_interval_ms) as i64
    }

    /// Offers one event. Returns the payload when it may be delivered now, `None` when it was
    /// suppressed (and, in replay mode, kept as the window's pending value).
    pub fn offer(&mut self, kind: EventKind, payload: Value, now_ms: i64) -> Option<Value> {
        let interval_ms = self.interval_ms(kind);
        if let Some(window) = self.windows.get_mut(&kind) {
            if window.is_open(now_ms) {
                self.suppressed += 1;
                if self.config.trailing_edge == TrailingEdge::Replay {
                    window.pending = Some(payload);
                }
                return None;
            }
        }
        self.windows.insert(kind, Window { opened_at_ms: now_ms, interval_ms, pending: None });
        Some(payload)
    }

    /// Closes every elapsed window. Windows holding a pending payload deliver it and reopen at
    /// `now_ms`; the rest are forgotten.
    pub fn close_elapsed(&mut self, now_ms: i64) -> Vec<(EventKind, Value)> {
        let mut replayed = Vec::new();
        self.windows.retain(|kind, window| {
            if window.is_open(now_ms) {
                return true;
            }
            match window.pending.take() {
                Some(payload) => {
                    replayed.push((*kind, payload));
                    window.opened_at_ms = now_ms;
                    true
                }
                None => false,
            }
        });
        replayed.sort_by_key(|(kind, _)| *kind);
        replayed
    }

    /// Events suppressed since start.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}
