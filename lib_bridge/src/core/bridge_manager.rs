//! # Bridge Manager
//!
//! The single actor task that owns the pipeline and the source health state. Everything
//! mutable lives here; the rest of the process talks to it through a [`BridgeHandle`]
//! (commands with oneshot responders) and reads its output from the shared [`FanoutHub`].
//!
//! TAK output runs on a separate worker task ([`TakWorkerHandle`]). The actor only ever
//! `try_send`s to it and reads its watched status, so a stalled TAK peer cannot hold up
//! polling or command handling.
//!
//! ## Inputs
//!
//! - **Timer ticks** from the [`Scheduler`]: poll, eviction, batch flush, heartbeat.
//! - **Poll outcomes** from spawned poll/probe tasks. At most one poll is in flight; a poll tick
//!   that arrives while one is running is skipped and counted.
//! - **TAK reports** from the worker: transmitted uids and link health changes.
//! - **Commands** from handles.
//!
//! ## Shutdown
//!
//! Cancelling the handle's token stops every timer, closes the TAK link and abandons whatever is
//! still queued for batching.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::SharedClock;
use super::hub::{FanoutHub, HubFrame, HubStats, DEFAULT_CLIENT_QUEUE};
use super::pipeline::{BridgePipeline, PipelineOutput, PipelineStats};
use super::scheduler::{Scheduler, TimerEvent};
use super::source_health::{FailureAction, SourceHealth, SourceState};
use super::state_cache::DeviceQuery;
use crate::configs::{AntennaConfig, BridgeConfig, TakFilter, TakServerConfig};
use crate::errors::{BridgeError, Result};
use crate::ingestors::{PollSnapshot, SnapshotSource};
use crate::models::{DeviceRecord, EventKind, HistorySample};
use crate::tak::worker::REQUEST_QUEUE;
use crate::tak::{
    AntennaSettings, FilterChange, TakBroadcaster, TakConnector, TakFingerprint, TakReport,
    TakRequest, TakStatus, TakWorkerHandle,
};

const COMMAND_QUEUE: usize = 64;
const TIMER_QUEUE: usize = 16;
const OUTCOME_QUEUE: usize = 4;

/// Requests accepted by the actor. Each carries its own responder.
#[derive(Debug)]
pub enum BridgeCommand {
    /// Clears a disconnected source and polls immediately.
    Reconnect { responder: oneshot::Sender<()> },
    /// Polls now. Answers `false` when a poll was already running or the source is disconnected.
    ForceRefresh { responder: oneshot::Sender<bool> },
    TakConnect { responder: oneshot::Sender<Result<()>> },
    TakDisconnect { responder: oneshot::Sender<Result<()>> },
    TakUpdateConfig { config: TakServerConfig, responder: oneshot::Sender<Result<()>> },
    FilterSettings { responder: oneshot::Sender<TakFilter> },
    /// Edits SSID/MAC exclusions or color overrides for later broadcasts.
    UpdateFilter { change: FilterChange, responder: oneshot::Sender<Result<TakFilter>> },
    AntennaSettings { responder: oneshot::Sender<AntennaSettings> },
    UpdateAntenna { antenna: AntennaConfig, responder: oneshot::Sender<Result<AntennaSettings>> },
    Status { responder: oneshot::Sender<BridgeStatus> },
    DeviceHistory { id: String, limit: usize, responder: oneshot::Sender<Vec<HistorySample>> },
    ActiveDevices { query: DeviceQuery, responder: oneshot::Sender<Vec<DeviceRecord>> },
}

#[derive(Debug)]
enum PollOutcome {
    Snapshot(Result<PollSnapshot>),
    Probe(Result<()>),
}

/// Everything the status query reports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub source: SourceState,
    pub consecutive_failures: u32,
    pub polls_completed: u64,
    pub polls_failed: u64,
    pub polls_skipped: u64,
    pub last_poll_ms: Option<i64>,
    pub pipeline: PipelineStats,
    pub hub: HubStats,
    /// `None` when TAK output is disabled.
    pub tak: Option<TakStatus>,
}

/// # Bridge Handle
///
/// Cheap, cloneable access to a running [`BridgeManager`].
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<BridgeCommand>,
    hub: Arc<FanoutHub>,
    shutdown: CancellationToken,
}

impl BridgeHandle {
    /// The hub dashboard clients register with.
    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }

    /// Asks the actor to stop. Returns immediately.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> BridgeCommand,
    ) -> Result<T> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(make(responder))
            .await
            .map_err(|_| BridgeError::Connection("bridge is not running".into()))?;
        rx.await
            .map_err(|_| BridgeError::Connection("bridge stopped before answering".into()))
    }

    pub async fn status(&self) -> Result<BridgeStatus> {
        self.request(|responder| BridgeCommand::Status { responder }).await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.request(|responder| BridgeCommand::Reconnect { responder }).await
    }

    pub async fn force_refresh(&self) -> Result<bool> {
        self.request(|responder| BridgeCommand::ForceRefresh { responder }).await
    }

    pub async fn tak_connect(&self) -> Result<()> {
        self.request(|responder| BridgeCommand::TakConnect { responder }).await?
    }

    pub async fn tak_disconnect(&self) -> Result<()> {
        self.request(|responder| BridgeCommand::TakDisconnect { responder }).await?
    }

    pub async fn tak_update_config(&self, config: TakServerConfig) -> Result<()> {
        self.request(|responder| BridgeCommand::TakUpdateConfig { config, responder }).await?
    }

    pub async fn filter_settings(&self) -> Result<TakFilter> {
        self.request(|responder| BridgeCommand::FilterSettings { responder }).await
    }

    pub async fn update_filter(&self, change: FilterChange) -> Result<TakFilter> {
        self.request(|responder| BridgeCommand::UpdateFilter { change, responder }).await?
    }

    pub async fn antenna_settings(&self) -> Result<AntennaSettings> {
        self.request(|responder| BridgeCommand::AntennaSettings { responder }).await
    }

    pub async fn update_antenna(&self, antenna: AntennaConfig) -> Result<AntennaSettings> {
        self.request(|responder| BridgeCommand::UpdateAntenna { antenna, responder }).await?
    }

    pub async fn device_history(
        &self,
        id: impl Into<String>,
        limit: usize,
    ) -> Result<Vec<HistorySample>> {
        let id = id.into();
        self.request(|responder| BridgeCommand::DeviceHistory { id, limit, responder }).await
    }

    pub async fn active_devices(&self, query: DeviceQuery) -> Result<Vec<DeviceRecord>> {
        self.request(|responder| BridgeCommand::ActiveDevices { query, responder }).await
    }
}

/// # Bridge Manager
pub struct BridgeManager {
    config: BridgeConfig,
    clock: SharedClock,
    source: Arc<dyn SnapshotSource>,
    pipeline: BridgePipeline,
    /// Handed to the worker task when [`BridgeManager::run`] starts.
    broadcaster: Option<TakBroadcaster>,
    tak: Option<TakWorkerHandle>,
    health: SourceHealth,
    hub: Arc<FanoutHub>,
    commands: mpsc::Receiver<BridgeCommand>,
    outcome_tx: mpsc::Sender<PollOutcome>,
    outcomes: mpsc::Receiver<PollOutcome>,
    shutdown: CancellationToken,
    poll_in_flight: bool,
    probe_in_flight: bool,
    hold_until_ms: Option<i64>,
    polls_completed: u64,
    polls_failed: u64,
    polls_skipped: u64,
    last_poll_ms: Option<i64>,
    last_tak: Option<TakFingerprint>,
}

impl BridgeManager {
    /// Builds the actor and its handle. Nothing runs until [`BridgeManager::run`] is awaited.
    /// Fails when the configuration does not validate.
    pub fn new(
        config: BridgeConfig,
        source: Arc<dyn SnapshotSource>,
        connector: Arc<dyn TakConnector>,
        clock: SharedClock,
    ) -> Result<(Self, BridgeHandle)> {
        config.validate()?;
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (outcome_tx, outcomes) = mpsc::channel(OUTCOME_QUEUE);
        let hub = Arc::new(FanoutHub::new(DEFAULT_CLIENT_QUEUE));
        let shutdown = CancellationToken::new();

        let broadcaster = config
            .tak
            .enabled
            .then(|| TakBroadcaster::new(config.tak.server.clone(), connector, clock.clone()));

        let manager = Self {
            pipeline: BridgePipeline::new(&config, clock.clone()),
            health: SourceHealth::new(&config.source),
            hub: hub.clone(),
            shutdown: shutdown.clone(),
            broadcaster,
            tak: None,
            config,
            clock,
            source,
            commands,
            outcome_tx,
            outcomes,
            poll_in_flight: false,
            probe_in_flight: false,
            hold_until_ms: None,
            polls_completed: 0,
            polls_failed: 0,
            polls_skipped: 0,
            last_poll_ms: None,
            last_tak: None,
        };
        Ok((manager, BridgeHandle { tx, hub, shutdown }))
    }

    /// # Run
    ///
    /// The actor loop. Returns after shutdown was requested and every timer has stopped.
    pub async fn run(mut self) {
        let (timer_tx, mut timers) = mpsc::channel(TIMER_QUEUE);
        let mut scheduler = Scheduler::new(timer_tx);
        scheduler.every(self.config.source.poll_interval(), TimerEvent::Poll);
        scheduler.every(self.config.cache.cleanup_interval(), TimerEvent::Evict);
        scheduler.every(self.config.batch.batch_interval(), TimerEvent::Flush);
        scheduler.every(self.config.source.heartbeat_interval(), TimerEvent::Heartbeat);

        info!(
            source = %self.config.source.api_url,
            tak_enabled = self.broadcaster.is_some(),
            "Bridge manager started"
        );

        let tick_every = self.config.batch.batch_interval();
        let worker_shutdown = self.shutdown.child_token();
        self.tak = self.broadcaster.take().map(|broadcaster| {
            TakWorkerHandle::spawn(broadcaster, tick_every, REQUEST_QUEUE, worker_shutdown)
        });
        self.start_poll();

        let shutdown = self.shutdown.clone();
        let mut commands_open = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = timers.recv() => self.on_timer(event),
                Some(outcome) = self.outcomes.recv() => self.on_outcome(outcome),
                Some(report) = next_tak_report(&mut self.tak) => self.on_tak_report(report),
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command),
                    None => commands_open = false,
                },
            }
        }

        scheduler.shutdown().await;
        if let Some(tak) = self.tak.take() {
            tak.stop().await;
        }
        let abandoned = self.pipeline.abandon_queued();
        info!(abandoned, "Bridge manager stopped");
    }

    fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Poll => {
                self.start_poll();
            }
            TimerEvent::Evict => {
                let out = self.pipeline.sweep();
                self.deliver(out);
            }
            TimerEvent::Flush => {
                let frames = self.pipeline.flush_due();
                self.publish(frames);
            }
            TimerEvent::Heartbeat => self.heartbeat(),
        }
    }

    /// Starts a poll unless one is running, the source is disconnected, or a backoff hold is
    /// still active.
    fn start_poll(&mut self) -> bool {
        if self.poll_in_flight {
            self.polls_skipped += 1;
            debug!("Poll still in flight, tick skipped");
            return false;
        }
        if self.health.is_disconnected() {
            return false;
        }
        if let Some(until) = self.hold_until_ms {
            if self.clock.now_ms() < until {
                return false;
            }
            self.hold_until_ms = None;
        }

        self.poll_in_flight = true;
        let source = Arc::clone(&self.source);
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = source.poll().await;
            let _ = tx.send(PollOutcome::Snapshot(result)).await;
        });
        true
    }

    fn start_probe(&mut self) {
        if self.probe_in_flight {
            return;
        }
        self.probe_in_flight = true;
        let source = Arc::clone(&self.source);
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = source.probe().await;
            let _ = tx.send(PollOutcome::Probe(result)).await;
        });
    }

    fn on_outcome(&mut self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Snapshot(Ok(snapshot)) => {
                self.poll_in_flight = false;
                self.polls_completed += 1;
                self.last_poll_ms = Some(self.clock.now_ms());
                if self.health.record_success() {
                    info!("Kismet source healthy again");
                }
                let out = self.pipeline.ingest(snapshot);
                self.deliver(out);
            }
            PollOutcome::Snapshot(Err(e)) => {
                self.poll_in_flight = false;
                self.polls_failed += 1;
                warn!(error = %e, transient = e.is_transient(), "Kismet poll failed");
                self.on_source_failure(&e);
            }
            PollOutcome::Probe(result) => {
                self.probe_in_flight = false;
                match result {
                    Ok(()) if self.health.is_disconnected() => {
                        info!("Kismet source reachable again, resuming polls");
                        self.resume_source();
                    }
                    Ok(()) => {}
                    Err(e) => debug!(error = %e, "Kismet probe failed"),
                }
            }
        }
    }

    fn on_source_failure(&mut self, e: &BridgeError) {
        match self.health.record_failure() {
            FailureAction::Retry(delay) => {
                self.hold_until_ms = Some(self.clock.now_ms() + delay.as_millis() as i64);
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    failures = self.health.failures(),
                    "Poll backoff"
                );
            }
            FailureAction::GiveUp { failures } => {
                error!(failures, "Kismet source unreachable, polling suspended");
                let mut frames = self.pipeline.emit_urgent(
                    EventKind::ConnectionFailed,
                    json!({ "retries": failures, "error": e.to_string() }),
                );
                let reason = json!({ "reason": "maxRetriesExceeded" });
                frames.extend(self.pipeline.emit_urgent(EventKind::Disconnected, reason));
                self.publish(frames);
            }
            FailureAction::StillDisconnected => {}
        }
    }

    /// Leaves the disconnected state, announces it and polls at once.
    fn resume_source(&mut self) {
        let was_disconnected = self.health.is_disconnected();
        self.health.reset();
        self.hold_until_ms = None;
        if was_disconnected {
            let frames = self
                .pipeline
                .emit_urgent(EventKind::Connected, json!({ "timestamp": self.clock.now_ms() }));
            self.publish(frames);
        }
        self.start_poll();
    }

    fn heartbeat(&mut self) {
        let connected = !self.health.is_disconnected();
        let frames = self.pipeline.emit(
            EventKind::Heartbeat,
            json!({ "connected": connected, "timestamp": self.clock.now_ms() }),
        );
        self.publish(frames.unwrap_or_default());
        if !connected {
            self.start_probe();
        }
        // Retries a tak:status the throttle suppressed earlier.
        if let Some(status) = self.tak.as_ref().map(TakWorkerHandle::status) {
            let mut frames = Vec::new();
            self.tak_status_frames(&status, &mut frames);
            self.publish(frames);
        }
    }

    /// Publishes what the worker transmitted and any change of link health.
    fn on_tak_report(&mut self, report: TakReport) {
        let mut frames = self.pipeline.tak_transmitted(report.transmitted);
        let mut status = report.status;
        if let Some(tak) = self.tak.as_ref() {
            status.dropped += tak.dropped();
        }
        self.tak_status_frames(&status, &mut frames);
        self.publish(frames);
    }

    fn tak_status_frames(&mut self, status: &TakStatus, frames: &mut Vec<HubFrame>) {
        let current = status.fingerprint();
        if self.last_tak == Some(current) {
            return;
        }
        match serde_json::to_value(status) {
            Ok(payload) => {
                // A suppressed status is retried on the next heartbeat.
                if let Some(emitted) = self.pipeline.emit(EventKind::TakStatus, payload) {
                    self.last_tak = Some(current);
                    frames.extend(emitted);
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize TAK status"),
        }
    }

    fn deliver(&mut self, out: PipelineOutput) {
        self.publish(out.frames);
        let Some(tak) = self.tak.as_mut() else {
            return;
        };
        for message in out.tactical {
            tak.offer(message);
        }
    }

    fn publish(&self, frames: Vec<HubFrame>) {
        for frame in frames {
            self.hub.broadcast(frame);
        }
    }

    /// Hands a control request to the TAK worker, which answers it directly.
    fn forward_tak(&mut self, request: TakRequest) {
        match self.tak.as_mut() {
            Some(tak) => {
                tak.submit(request);
            }
            None => request.reject(BridgeError::Config("TAK output is disabled".into())),
        }
    }

    fn on_command(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::Reconnect { responder } => {
                info!("Reconnect requested");
                self.resume_source();
                let _ = responder.send(());
            }
            BridgeCommand::ForceRefresh { responder } => {
                self.hold_until_ms = None;
                let started = self.start_poll();
                let _ = responder.send(started);
            }
            BridgeCommand::TakConnect { responder } => {
                self.forward_tak(TakRequest::Connect { responder });
            }
            BridgeCommand::TakDisconnect { responder } => {
                self.forward_tak(TakRequest::Disconnect { responder });
            }
            BridgeCommand::TakUpdateConfig { config, responder } => {
                info!(host = %config.target_host(), port = config.port, "TAK target update");
                self.forward_tak(TakRequest::UpdateConfig { config, responder });
            }
            BridgeCommand::FilterSettings { responder } => {
                let _ = responder.send(self.pipeline.filter_settings().clone());
            }
            BridgeCommand::UpdateFilter { change, responder } => {
                let result = self.pipeline.update_filter(change);
                if let Err(e) = &result {
                    debug!(error = %e, "Filter change rejected");
                }
                let _ = responder.send(result);
            }
            BridgeCommand::AntennaSettings { responder } => {
                let _ = responder.send(self.pipeline.antenna_settings());
            }
            BridgeCommand::UpdateAntenna { antenna, responder } => {
                let result = self.pipeline.update_antenna(antenna);
                match &result {
                    Ok(settings) => info!(
                        sensitivity = %settings.antenna.sensitivity,
                        factor = settings.factor,
                        "Antenna settings updated"
                    ),
                    Err(e) => debug!(error = %e, "Antenna change rejected"),
                }
                let _ = responder.send(result);
            }
            BridgeCommand::Status { responder } => {
                let _ = responder.send(self.status());
            }
            BridgeCommand::DeviceHistory { id, limit, responder } => {
                let _ = responder.send(self.pipeline.history(&id, limit));
            }
            BridgeCommand::ActiveDevices { query, responder } => {
                let _ = responder.send(self.pipeline.active_devices(&query));
            }
        }
    }

    fn status(&self) -> BridgeStatus {
        BridgeStatus {
            source: self.health.state(),
            consecutive_failures: self.health.failures(),
            polls_completed: self.polls_completed,
            polls_failed: self.polls_failed,
            polls_skipped: self.polls_skipped,
            last_poll_ms: self.last_poll_ms,
            pipeline: self.pipeline.stats(),
            hub: self.hub.stats(),
            tak: self.tak.as_ref().map(TakWorkerHandle::status),
        }
    }
}

/// Next worker report, or never when TAK output is disabled.
async fn next_tak_report(tak: &mut Option<TakWorkerHandle>) -> Option<TakReport> {
    match tak {
        Some(tak) => tak.next_report().await,
        None => std::future::pending().await,
    }
}
