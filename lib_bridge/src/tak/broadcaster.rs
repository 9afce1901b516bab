//! # TAK Broadcaster
//!
//! Owns at most one outbound link to the TAK target (TCP unicast, UDP unicast or UDP
//! multicast) and the bounded queue of CoT documents waiting for it.
//!
//! ## State machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                        │                  │
//!      └──── reconnect due ◀────┴── error/idle ◀───┘
//!
//! disconnect() ──▶ Stopped   (no automatic retry until connect())
//! ```
//!
//! - Sending while not connected fails at once and queues the document.
//! - A send error on a live link counts one error, drops the link and schedules a reconnect
//!   after `reconnect_delay_ms`. The failed document goes back to the head of the queue.
//!   A write that outlasts `send_timeout_ms` counts as a send error; a connect that outlasts
//!   `connect_timeout_ms` counts as a failed connect.
//! - [`TakBroadcaster::tick`] performs due reconnects, recycles TCP links idle for longer than
//!   `tcp_idle_timeout_ms`, and drains the queue oldest first.
//! - The queue holds at most `max_queue_size` documents; when full the oldest one is dropped
//!   and counted.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use super::cot::TacticalMessage;
use crate::configs::{TakProtocol, TakServerConfig};
use crate::core::clock::SharedClock;
use crate::errors::{BridgeError, Result};

/// An established outbound link.
#[async_trait]
pub trait TakLink: Send {
    async fn send(&mut self, payload: &[u8]) -> Result<()>;
    async fn close(&mut self);
}

/// Opens links for a target configuration.
#[async_trait]
pub trait TakConnector: Send + Sync {
    async fn connect(&self, config: &TakServerConfig) -> Result<Box<dyn TakLink>>;
}

/// Real sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetConnector;

struct TcpLink {
    stream: TcpStream,
}

#[async_trait]
impl TakLink for TcpLink {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.stream
            .write_all(payload)
            .await
            .map_err(|e| BridgeError::Transport(format!("TCP write failed: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| BridgeError::Transport(format!("TCP flush failed: {}", e)))
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

struct UdpLink {
    socket: UdpSocket,
    target: SocketAddr,
}

#[async_trait]
impl TakLink for UdpLink {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let written = self
            .socket
            .send_to(payload, self.target)
            .await
            .map_err(|e| {
                BridgeError::Transport(format!("UDP send to {} failed: {}", self.target, e))
            })?;
        if written != payload.len() {
            return Err(BridgeError::Transport(format!(
                "UDP datagram truncated: {}/{} bytes",
                written,
                payload.len()
            )));
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await
        .map_err(|e| BridgeError::Connection(format!("cannot resolve {}:{}: {}", host, port, e)))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| BridgeError::Connection(format!("no IPv4 address for {}:{}", host, port)))
}

#[async_trait]
impl TakConnector for NetConnector {
    async fn connect(&self, config: &TakServerConfig) -> Result<Box<dyn TakLink>> {
        let target = resolve(config.target_host(), config.port).await?;

        match config.protocol {
            TakProtocol::Tcp => {
                let stream = TcpStream::connect(target).await.map_err(|e| {
                    BridgeError::Connection(format!("TCP connect to {} failed: {}", target, e))
                })?;
                stream.set_nodelay(true)?;
                info!(%target, "TCP link to TAK server established");
                Ok(Box::new(TcpLink { stream }))
            }
            TakProtocol::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                if config.multicast {
                    socket.set_broadcast(true)?;
                    socket.set_multicast_ttl_v4(config.multicast_ttl)?;
                    info!(%target, ttl = config.multicast_ttl, "UDP multicast socket ready");
                } else {
                    info!(%target, "UDP socket ready");
                }
                Ok(Box::new(UdpLink { socket, target }))
            }
        }
    }
}

/// Broadcaster connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Explicitly disconnected; waits for [`TakBroadcaster::connect`].
    Stopped,
}

/// Health snapshot for the status query and `tak:status` events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TakStatus {
    pub connected: bool,
    pub state: LinkState,
    pub protocol: &'static str,
    pub server: String,
    pub port: u16,
    pub messages_sent: u64,
    pub errors: u64,
    pub queue_size: usize,
    pub dropped: u64,
    pub reconnect_attempts: u64,
}

/// Fields of [`TakStatus`] whose change is worth reporting.
pub type TakFingerprint = (LinkState, u64, u64, usize, u64);

impl TakStatus {
    pub fn fingerprint(&self) -> TakFingerprint {
        (self.state, self.messages_sent, self.errors, self.queue_size, self.reconnect_attempts)
    }
}

#[derive(Debug)]
struct QueuedDocument {
    uid: String,
    xml: Vec<u8>,
}

/// # TAK Broadcaster
pub struct TakBroadcaster {
    config: TakServerConfig,
    connector: Arc<dyn TakConnector>,
    clock: SharedClock,
    link: Option<Box<dyn TakLink>>,
    state: LinkState,
    queue: VecDeque<QueuedDocument>,
    reconnect_at_ms: Option<i64>,
    last_activity_ms: i64,
    messages_sent: u64,
    errors: u64,
    dropped: u64,
    reconnect_attempts: u64,
    transmitted: Vec<String>,
}

impl TakBroadcaster {
    pub fn new(
        config: TakServerConfig,
        connector: Arc<dyn TakConnector>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            connector,
            clock,
            link: None,
            state: LinkState::Disconnected,
            queue: VecDeque::new(),
            reconnect_at_ms: None,
            last_activity_ms: 0,
            messages_sent: 0,
            errors: 0,
            dropped: 0,
            reconnect_attempts: 0,
            transmitted: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn config(&self) -> &TakServerConfig {
        &self.config
    }

    /// # Connect
    ///
    /// Tears down any current link, then opens a new one and drains the queue. Clears a
    /// previous explicit disconnect. On failure a reconnect is scheduled.
    pub async fn connect(&mut self) -> Result<()> {
        self.teardown().await;
        self.open_link().await?;
        self.drain().await;
        Ok(())
    }

    /// Closes the link and stops automatic reconnects.
    pub async fn disconnect(&mut self) {
        self.teardown().await;
        self.state = LinkState::Stopped;
        self.reconnect_at_ms = None;
        info!("TAK broadcaster stopped");
    }

    /// Replaces the target. Reconnects only when a link was up before the call.
    pub async fn update_config(&mut self, config: TakServerConfig) -> Result<()> {
        let was_connected = self.is_connected();
        if was_connected {
            self.teardown().await;
        }
        self.config = config;
        if was_connected {
            self.connect().await
        } else {
            Ok(())
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        if self.state != LinkState::Stopped {
            self.state = LinkState::Disconnected;
        }
    }

    async fn open_link(&mut self) -> Result<()> {
        self.state = LinkState::Connecting;
        let limit = Duration::from_millis(self.config.connect_timeout_ms);
        let opened = match tokio::time::timeout(limit, self.connector.connect(&self.config)).await {
            Ok(opened) => opened,
            Err(_) => Err(BridgeError::Timeout(limit)),
        };
        match opened {
            Ok(link) => {
                self.link = Some(link);
                self.state = LinkState::Connected;
                self.reconnect_at_ms = None;
                self.last_activity_ms = self.clock.now_ms();
                Ok(())
            }
            Err(e) => {
                self.errors += 1;
                self.schedule_reconnect();
                warn!(error = %e, "TAK connect failed");
                Err(e)
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.state = LinkState::Disconnected;
        let at = self.clock.now_ms() + self.config.reconnect_delay_ms as i64;
        self.reconnect_at_ms = Some(at);
        debug!(reconnect_at_ms = at, "TAK reconnect scheduled");
    }

    fn enqueue(&mut self, doc: QueuedDocument) {
        if self.queue.len() >= self.config.max_queue_size {
            if let Some(oldest) = self.queue.pop_front() {
                self.dropped += 1;
                debug!(uid = %oldest.uid, "TAK queue full, dropped oldest document");
            }
        }
        self.queue.push_back(doc);
    }

    /// # Send
    ///
    /// Serializes and transmits one message. Invalid messages are rejected and never queued.
    /// While not connected the document is queued and a transport error returned.
    pub async fn send(&mut self, message: &TacticalMessage) -> Result<()> {
        let xml = message.to_xml()?.into_bytes();
        self.enqueue(QueuedDocument { uid: message.uid.clone(), xml });
        if !self.is_connected() {
            return Err(BridgeError::Transport(format!(
                "not connected to TAK server, {} queued",
                self.queue.len()
            )));
        }
        match self.drain().await {
            0 => Ok(()),
            _ => Err(BridgeError::Transport("TAK send failed, reconnect scheduled".into())),
        }
    }

    /// Sends queued documents oldest first. Returns the number left behind.
    async fn drain(&mut self) -> usize {
        let limit = Duration::from_millis(self.config.send_timeout_ms);
        while self.is_connected() {
            let Some(link) = self.link.as_mut() else { break };
            let Some(doc) = self.queue.pop_front() else { break };
            let sent = match tokio::time::timeout(limit, link.send(&doc.xml)).await {
                Ok(sent) => sent,
                Err(_) => Err(BridgeError::Transport(format!("TAK write stalled for {:?}", limit))),
            };
            match sent {
                Ok(()) => {
                    self.messages_sent += 1;
                    self.last_activity_ms = self.clock.now_ms();
                    self.transmitted.push(doc.uid);
                }
                Err(e) => {
                    self.errors += 1;
                    warn!(uid = %doc.uid, error = %e, "TAK send failed, dropping link");
                    self.queue.push_front(doc);
                    self.teardown().await;
                    self.schedule_reconnect();
                }
            }
        }
        self.queue.len()
    }

    /// # Tick
    ///
    /// Periodic maintenance: due reconnects, TCP idle recycling, queue drain.
    pub async fn tick(&mut self) {
        let now = self.clock.now_ms();

        if self.is_connected()
            && self.config.protocol == TakProtocol::Tcp
            && now - self.last_activity_ms >= self.config.tcp_idle_timeout_ms as i64
        {
            warn!("TAK TCP link idle past timeout, reconnecting");
            self.teardown().await;
            self.reconnect_at_ms = Some(now);
        }

        let reconnect_due = self.reconnect_at_ms.is_some_and(|at| at <= now);
        if self.state == LinkState::Disconnected && reconnect_due {
            self.reconnect_attempts += 1;
            info!(attempt = self.reconnect_attempts, "Reconnecting to TAK server");
            if self.open_link().await.is_err() {
                return;
            }
        }

        if self.is_connected() && !self.queue.is_empty() {
            self.drain().await;
        }
    }

    /// Uids transmitted since the last call.
    pub fn take_transmitted(&mut self) -> Vec<String> {
        std::mem::take(&mut self.transmitted)
    }

    pub fn status(&self) -> TakStatus {
        TakStatus {
            connected: self.is_connected(),
            state: self.state,
            protocol: self.config.protocol.as_str(),
            server: self.config.target_host().to_string(),
            port: self.config.port,
            messages_sent: self.messages_sent,
            errors: self.errors,
            queue_size: self.queue.len(),
            dropped: self.dropped,
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

/// In-memory links for tests: records payloads and fails on chosen send numbers.
#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{TakConnector, TakLink};
    use crate::configs::TakServerConfig;
    use crate::errors::{BridgeError, Result};

    /// Shared state of a [`FlakyConnector`].
    #[derive(Debug, Default)]
    pub struct FlakyState {
        /// 1-based send attempts that fail.
        pub fail_on: HashSet<u64>,
        pub attempts: AtomicU64,
        pub connects: AtomicU64,
        pub refuse_connect: AtomicBool,
        /// Sends never complete, like a peer that stopped reading.
        pub stall_sends: AtomicBool,
        pub delivered: Mutex<Vec<Vec<u8>>>,
    }

    #[derive(Debug, Clone)]
    pub struct FlakyConnector {
        pub state: Arc<FlakyState>,
    }

    impl FlakyConnector {
        pub fn failing_on(attempts: impl IntoIterator<Item = u64>) -> Self {
            let state =
                FlakyState { fail_on: attempts.into_iter().collect(), ..Default::default() };
            Self { state: Arc::new(state) }
        }

        /// Connects fine, then never finishes a write.
        pub fn stalled() -> Self {
            let connector = Self::failing_on([]);
            connector.state.stall_sends.store(true, Ordering::SeqCst);
            connector
        }

        pub fn delivered(&self) -> usize {
            self.state.delivered.lock().map(|d| d.len()).unwrap_or(0)
        }
    }

    struct FlakyLink {
        state: Arc<FlakyState>,
    }

    #[async_trait]
    impl TakLink for FlakyLink {
        async fn send(&mut self, payload: &[u8]) -> Result<()> {
            let attempt = self.state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.state.stall_sends.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.state.fail_on.contains(&attempt) {
                return Err(BridgeError::Transport(format!("induced failure on send {}", attempt)));
            }
            if let Ok(mut delivered) = self.state.delivered.lock() {
                delivered.push(payload.to_vec());
            }
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl TakConnector for FlakyConnector {
        async fn connect(&self, _config: &TakServerConfig) -> Result<Box<dyn TakLink>> {
            if self.state.refuse_connect.load(Ordering::SeqCst) {
                return Err(BridgeError::Connection("refused".into()));
            }
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyLink { state: Arc::clone(&self.state) }))
        }
    }
}
