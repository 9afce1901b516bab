//! # Ingestors
//!
//! Snapshot sources the bridge polls. A source returns the raw, still-untyped Kismet documents
//! of one poll cycle; parsing into typed records happens in the pipeline so that one malformed
//! record never fails a whole cycle.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::Result;

#[cfg(feature = "retrieve")]
pub mod kismet_polling;

#[cfg(feature = "retrieve")]
pub use kismet_polling::KismetPollingSource;

/// Everything one poll cycle fetched.
#[derive(Debug, Clone, Default)]
pub struct PollSnapshot {
    /// Full list of currently visible devices.
    pub devices: Vec<Value>,
    /// Most recent alerts; may overlap with earlier cycles.
    pub alerts: Vec<Value>,
    /// System status document, when it could be fetched.
    pub status: Option<Value>,
}

/// A pollable source of device snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetches one full snapshot. Fails when the device list cannot be fetched.
    async fn poll(&self) -> Result<PollSnapshot>;

    /// Cheap reachability check used while the source is marked disconnected.
    async fn probe(&self) -> Result<()>;
}

/// Scripted sources for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{PollSnapshot, SnapshotSource};
    use crate::errors::{BridgeError, Result};

    /// Replays a queue of poll results, then repeats the last successful snapshot.
    #[derive(Debug, Default)]
    pub struct ScriptedSource {
        script: Mutex<VecDeque<Result<PollSnapshot>>>,
        last: Mutex<PollSnapshot>,
        probe_ok: std::sync::atomic::AtomicBool,
        pub polls: AtomicU64,
        pub probes: AtomicU64,
        /// Polls currently running, and the most ever seen at once.
        pub in_flight: AtomicU64,
        pub max_in_flight: AtomicU64,
        /// Artificial latency per poll.
        pub delay: Option<Duration>,
    }

    impl ScriptedSource {
        pub fn new(script: Vec<Result<PollSnapshot>>) -> Self {
            Self { script: Mutex::new(script.into()), ..Default::default() }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn push(&self, step: Result<PollSnapshot>) {
            if let Ok(mut script) = self.script.lock() {
                script.push_back(step);
            }
        }

        pub fn set_probe_ok(&self, ok: bool) {
            self.probe_ok.store(ok, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn poll(&self) -> Result<PollSnapshot> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let step = self.script.lock().ok().and_then(|mut s| s.pop_front());
            match step {
                Some(Ok(snapshot)) => {
                    if let Ok(mut last) = self.last.lock() {
                        *last = snapshot.clone();
                    }
                    Ok(snapshot)
                }
                Some(Err(e)) => Err(e),
                None => self
                    .last
                    .lock()
                    .map(|s| s.clone())
                    .map_err(|_| BridgeError::Connection("script poisoned".into())),
            }
        }

        async fn probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BridgeError::Connection("probe refused".into()))
            }
        }
    }
}
