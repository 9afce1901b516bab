//! # TAK Worker
//!
//! Runs a [`TakBroadcaster`] on a task of its own so that socket writes, connects and reconnect
//! waits never hold up the bridge actor.
//!
//! - The actor feeds the worker through a bounded queue with `try_send`. A CoT message that
//!   finds the queue full is dropped and counted; a control request is answered at once with
//!   [`BridgeError::Capacity`].
//! - The worker publishes its [`TakStatus`] on a `watch` channel after every step, so status
//!   reads never wait on the link.
//! - Transmitted uids and health changes come back as [`TakReport`]s over an mpsc, the same
//!   way poll outcomes return to the actor.
//! - The worker ticks the broadcaster on its own interval (due reconnects, idle recycling,
//!   queue drain).

use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broadcaster::{TakBroadcaster, TakFingerprint, TakStatus};
use super::cot::TacticalMessage;
use crate::configs::TakServerConfig;
use crate::errors::{BridgeError, Result};

/// Default depth of the request queue.
pub const REQUEST_QUEUE: usize = 256;
const REPORT_QUEUE: usize = 64;
/// How long [`TakWorkerHandle::stop`] waits before aborting the task.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Work for the broadcaster task.
#[derive(Debug)]
pub enum TakRequest {
    Send(TacticalMessage),
    Connect { responder: oneshot::Sender<Result<()>> },
    Disconnect { responder: oneshot::Sender<Result<()>> },
    UpdateConfig { config: TakServerConfig, responder: oneshot::Sender<Result<()>> },
}

impl TakRequest {
    /// Answers a request that never reached the worker.
    pub fn reject(self, error: BridgeError) {
        match self {
            TakRequest::Send(message) => {
                debug!(uid = %message.uid, error = %error, "CoT dropped before the TAK worker");
            }
            TakRequest::Connect { responder }
            | TakRequest::Disconnect { responder }
            | TakRequest::UpdateConfig { responder, .. } => {
                let _ = responder.send(Err(error));
            }
        }
    }
}

/// What the worker hands back to the actor.
#[derive(Debug, Clone)]
pub struct TakReport {
    /// Uids sent since the previous report, in send order.
    pub transmitted: Vec<String>,
    pub status: TakStatus,
}

/// # TAK Worker Handle
///
/// The actor's side of a running worker.
pub struct TakWorkerHandle {
    tx: mpsc::Sender<TakRequest>,
    status: watch::Receiver<TakStatus>,
    reports: mpsc::Receiver<TakReport>,
    task: JoinHandle<()>,
    dropped: u64,
}

impl TakWorkerHandle {
    /// # Spawn
    ///
    /// Moves the broadcaster onto a new task. The worker connects first, then serves requests
    /// and ticks every `tick_every` until `shutdown` fires or the handle is stopped.
    pub fn spawn(
        broadcaster: TakBroadcaster,
        tick_every: Duration,
        queue: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, requests) = mpsc::channel(queue.max(1));
        let (report_tx, reports) = mpsc::channel(REPORT_QUEUE);
        let (status_tx, status) = watch::channel(broadcaster.status());

        let worker = TakWorker {
            broadcaster,
            status: status_tx,
            reports: report_tx,
            last_reported: None,
        };
        let task = tokio::spawn(worker.run(requests, tick_every, shutdown));
        Self { tx, status, reports, task, dropped: 0 }
    }

    /// Queues a CoT message. Returns `false` when it was dropped.
    pub fn offer(&mut self, message: TacticalMessage) -> bool {
        self.submit(TakRequest::Send(message))
    }

    /// Queues any request. A request that does not fit is rejected on the spot.
    pub fn submit(&mut self, request: TakRequest) -> bool {
        let capacity = self.tx.max_capacity();
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                if matches!(request, TakRequest::Send(_)) {
                    self.dropped += 1;
                }
                request.reject(BridgeError::Capacity {
                    what: "TAK request queue",
                    size: capacity,
                    capacity,
                });
                false
            }
            Err(TrySendError::Closed(request)) => {
                request.reject(BridgeError::Connection("TAK worker is not running".into()));
                false
            }
        }
    }

    /// Latest status. `dropped` includes messages the request queue turned away.
    pub fn status(&self) -> TakStatus {
        let mut status = self.status.borrow().clone();
        status.dropped += self.dropped;
        status
    }

    /// Messages the request queue turned away.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next report from the worker; `None` once the worker has exited.
    pub async fn next_report(&mut self) -> Option<TakReport> {
        self.reports.recv().await
    }

    /// Closes the request queue and waits briefly for the worker to disconnect.
    pub async fn stop(self) {
        let Self { tx, mut task, .. } = self;
        drop(tx);
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!("TAK worker did not stop in time, aborting");
            task.abort();
        }
    }
}

struct TakWorker {
    broadcaster: TakBroadcaster,
    status: watch::Sender<TakStatus>,
    reports: mpsc::Sender<TakReport>,
    last_reported: Option<TakFingerprint>,
}

impl TakWorker {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<TakRequest>,
        tick_every: Duration,
        shutdown: CancellationToken,
    ) {
        if let Err(e) = self.broadcaster.connect().await {
            warn!(error = %e, "Initial TAK connect failed, will retry");
        }
        self.publish();

        let mut ticker = interval_at(Instant::now() + tick_every, tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.broadcaster.tick().await;
                    self.publish();
                }
            }
        }

        self.broadcaster.disconnect().await;
        self.publish();
        info!("TAK worker stopped");
    }

    async fn handle(&mut self, request: TakRequest) {
        match request {
            TakRequest::Send(message) => {
                if let Err(e) = self.broadcaster.send(&message).await {
                    debug!(uid = %message.uid, error = %e, "CoT not sent");
                }
                self.publish();
            }
            TakRequest::Connect { responder } => {
                let result = self.broadcaster.connect().await;
                self.publish();
                let _ = responder.send(result);
            }
            TakRequest::Disconnect { responder } => {
                self.broadcaster.disconnect().await;
                self.publish();
                let _ = responder.send(Ok(()));
            }
            TakRequest::UpdateConfig { config, responder } => {
                let result = self.broadcaster.update_config(config).await;
                self.publish();
                let _ = responder.send(result);
            }
        }
    }

    /// Refreshes the watched status and reports new transmissions or a health change.
    fn publish(&mut self) {
        let transmitted = self.broadcaster.take_transmitted();
        let status = self.broadcaster.status();
        let current = status.fingerprint();
        self.status.send_replace(status.clone());

        if transmitted.is_empty() && self.last_reported == Some(current) {
            return;
        }
        match self.reports.try_send(TakReport { transmitted, status }) {
            Ok(()) => self.last_reported = Some(current),
            Err(e) => debug!(error = %e, "Bridge busy, TAK report dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{CotConfig, TakProtocol};
    use crate::core::clock::ManualClock;
    use crate::models::{DeviceRecord, GeoLocation};
    use crate::tak::broadcaster::testing::FlakyConnector;
    use crate::tak::broadcaster::LinkState;
    use crate::tak::cot::CotEncoder;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn message(n: u32) -> TacticalMessage {
        let mut device = DeviceRecord::new(format!("00:00:00:00:00:{:02X}", n % 256));
        device.location = Some(GeoLocation { lat: 1.0, lon: 2.0, alt: None, accuracy: None });
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        CotEncoder::new(CotConfig::default()).encode(&device, now).unwrap()
    }

    fn spawn(connector: &FlakyConnector, config: TakServerConfig, queue: usize) -> TakWorkerHandle {
        let broadcaster =
            TakBroadcaster::new(config, Arc::new(connector.clone()), ManualClock::new(0));
        let tick = Duration::from_millis(100);
        TakWorkerHandle::spawn(broadcaster, tick, queue, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_reports_transmissions_and_status() {
        let connector = FlakyConnector::failing_on([]);
        let mut worker = spawn(&connector, TakServerConfig::default(), REQUEST_QUEUE);

        let connected = worker.next_report().await.unwrap();
        assert!(connected.transmitted.is_empty());
        assert_eq!(connected.status.state, LinkState::Connected);

        assert!(worker.offer(message(1)));
        assert!(worker.offer(message(2)));
        let mut uids = Vec::new();
        while uids.len() < 2 {
            uids.extend(worker.next_report().await.unwrap().transmitted);
        }
        assert_eq!(uids, vec!["WIGLE-000000000001", "WIGLE-000000000002"]);
        assert_eq!(worker.status().messages_sent, 2);
        assert_eq!(connector.delivered(), 2);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_requests_answer_after_status_is_updated() {
        let connector = FlakyConnector::failing_on([]);
        let mut worker = spawn(&connector, TakServerConfig::default(), REQUEST_QUEUE);

        let (responder, rx) = oneshot::channel();
        worker.submit(TakRequest::Disconnect { responder });
        rx.await.unwrap().unwrap();
        assert_eq!(worker.status().state, LinkState::Stopped);

        let retarget = TakServerConfig {
            protocol: TakProtocol::Tcp,
            port: 8087,
            ..TakServerConfig::default()
        };
        let (responder, rx) = oneshot::channel();
        worker.submit(TakRequest::UpdateConfig { config: retarget, responder });
        rx.await.unwrap().unwrap();
        assert_eq!(worker.status().port, 8087);
        assert_eq!(worker.status().protocol, "TCP");

        let (responder, rx) = oneshot::channel();
        worker.submit(TakRequest::Connect { responder });
        rx.await.unwrap().unwrap();
        assert!(worker.status().connected);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_messages_and_rejects_requests() {
        let connector = FlakyConnector::stalled();
        let config = TakServerConfig { send_timeout_ms: 600_000, ..TakServerConfig::default() };
        let mut worker = spawn(&connector, config, 1);

        // The first write parks the worker; the second fills the queue.
        assert!(worker.offer(message(1)));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(worker.offer(message(2)));
        assert!(!worker.offer(message(3)));
        assert_eq!(worker.dropped(), 1);
        assert_eq!(worker.status().dropped, 1);

        let (responder, rx) = oneshot::channel();
        assert!(!worker.submit(TakRequest::Connect { responder }));
        match rx.await.unwrap() {
            Err(BridgeError::Capacity { what, size, capacity }) => {
                assert_eq!(what, "TAK request queue");
                assert_eq!((size, capacity), (1, 1));
            }
            other => panic!("expected a capacity rejection, got {:?}", other),
        }
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_and_closes_reports() {
        let connector = FlakyConnector::failing_on([]);
        let shutdown = CancellationToken::new();
        let broadcaster = TakBroadcaster::new(
            TakServerConfig::default(),
            Arc::new(connector.clone()),
            ManualClock::new(0),
        );
        let tick = Duration::from_millis(100);
        let mut worker = TakWorkerHandle::spawn(broadcaster, tick, 8, shutdown.clone());
        worker.next_report().await.unwrap();

        shutdown.cancel();
        while worker.next_report().await.is_some() {}
        assert_eq!(worker.status().state, LinkState::Stopped);

        let (responder, rx) = oneshot::channel();
        worker.submit(TakRequest::Connect { responder });
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::Connection(_))));
    }
}
