//! # Source Health
//!
//! Consecutive-failure accounting for the Kismet source: exponential backoff with a cap and
//! random jitter, and a one-shot transition to `Disconnected` after `max_retries` failures.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::configs::SourceConfig;

/// Connection state of the source as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceState {
    Connected,
    /// Failing, but still retrying.
    Degraded,
    /// Gave up after `max_retries`; only the heartbeat probe or an explicit reconnect resumes.
    Disconnected,
}

/// What the caller should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Hold polling for this long, then try again.
    Retry(Duration),
    /// The failure budget was just exhausted. Emitted once per outage.
    GiveUp { failures: u32 },
    /// Already disconnected; nothing new to report.
    StillDisconnected,
}

/// # Source Health
#[derive(Debug)]
pub struct SourceHealth {
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ratio: f64,
    failures: u32,
    state: SourceState,
}

impl SourceHealth {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay_ms: config.retry_delay_ms,
            max_delay_ms: config.max_retry_delay_ms.max(config.retry_delay_ms),
            jitter_ratio: config.jitter_ratio,
            failures: 0,
            state: SourceState::Connected,
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == SourceState::Disconnected
    }

    /// Records a failed poll or probe.
    pub fn record_failure(&mut self) -> FailureAction {
        if self.state == SourceState::Disconnected {
            return FailureAction::StillDisconnected;
        }
        self.failures += 1;
        if self.failures >= self.max_retries {
            self.state = SourceState::Disconnected;
            return FailureAction::GiveUp { failures: self.failures };
        }
        self.state = SourceState::Degraded;
        FailureAction::Retry(self.backoff_delay())
    }

    /// Records a success. Returns `true` when this ends an outage.
    pub fn record_success(&mut self) -> bool {
        let recovered = self.state != SourceState::Connected;
        self.failures = 0;
        self.state = SourceState::Connected;
        recovered
    }

    /// Resets to a fresh `Connected` state, as after an explicit reconnect.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.state = SourceState::Connected;
    }

    /// `base * 2^(failures-1)`, capped, plus up to `jitter_ratio` of itself.
    fn backoff_delay(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(20);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exponent);
        let capped = raw.min(self.max_delay_ms);
        let jitter_span = (capped as f64 * self.jitter_ratio) as u64;
        let jitter = if jitter_span > 0 { rand::rng().random_range(0..=jitter_span) } else { 0 };
        Duration::from_millis(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(jitter_ratio: f64) -> SourceHealth {
        SourceHealth::new(&SourceConfig {
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 1_500,
            jitter_ratio,
            ..SourceConfig::default()
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut h = health(0.0);
        assert_eq!(h.record_failure(), FailureAction::Retry(Duration::from_millis(1_000)));
        assert_eq!(h.record_failure(), FailureAction::Retry(Duration::from_millis(1_500)));
        assert_eq!(h.state(), SourceState::Degraded);
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        for _ in 0..50 {
            let mut h = health(0.2);
            match h.record_failure() {
                FailureAction::Retry(d) => {
                    assert!((1_000..=1_200).contains(&(d.as_millis() as u64)))
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_give_up_is_reported_once() {
        let mut h = health(0.0);
        h.record_failure();
        h.record_failure();
        assert_eq!(h.record_failure(), FailureAction::GiveUp { failures: 3 });
        assert!(h.is_disconnected());
        assert_eq!(h.record_failure(), FailureAction::StillDisconnected);
        assert_eq!(h.record_failure(), FailureAction::StillDisconnected);
        assert_eq!(h.failures(), 3);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut h = health(0.0);
        h.record_failure();
        assert!(h.record_success());
        assert!(!h.record_success());
        assert_eq!(h.failures(), 0);
        assert_eq!(h.record_failure(), FailureAction::Retry(Duration::from_millis(1_000)));
    }
}
