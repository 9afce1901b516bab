//! # Fan-out Hub
//!
//! Delivers batched frames to live dashboard clients by channel membership.
//!
//! Every frame is wrapped in an `Arc` once and each subscribed client receives a pointer to the
//! same allocation. Each client owns a bounded `mpsc` queue; a client that cannot keep up loses
//! frames (counted per client) instead of slowing the producer, and a client whose receiver is
//! gone is dropped from the hub on the next delivery.
//!
//! Membership lives on the client handle itself, so removing a client removes it from every
//! channel in one step. Frames already queued for a client before it unsubscribed are filtered
//! by the consumer with [`FanoutHub::is_subscribed`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::models::{Channel, EventKind};

/// Default per-client queue depth, in frames.
pub const DEFAULT_CLIENT_QUEUE: usize = 256;

/// One serialized batch addressed to a channel.
#[derive(Debug, Clone)]
pub struct HubFrame {
    pub kind: EventKind,
    pub channel: Channel,
    /// JSON text sent to the client as-is.
    pub body: String,
    pub message_count: usize,
}

impl HubFrame {
    pub fn new(kind: EventKind, body: String, message_count: usize) -> Self {
        Self { kind, channel: kind.channel(), body, message_count }
    }
}

/// Identifier handed out by [`FanoutHub::add_client`].
pub type ClientId = u64;

struct ClientHandle {
    id: ClientId,
    channels: HashSet<Channel>,
    sender: mpsc::Sender<Arc<HubFrame>>,
    dropped: u64,
}

/// Per-client view in [`HubStats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub id: ClientId,
    pub channels: Vec<Channel>,
    pub dropped_frames: u64,
}

/// Counters exposed through the bridge status.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub clients: usize,
    pub channel_members: BTreeMap<Channel, usize>,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub per_client: Vec<ClientStats>,
}

/// # Fan-out Hub
pub struct FanoutHub {
    clients: Mutex<Vec<ClientHandle>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_QUEUE)
    }
}

impl FanoutHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ClientHandle>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// # Add Client
    ///
    /// Registers a client with an initial channel set and returns its id and the receiving
    /// half of its frame queue.
    pub fn add_client<I>(&self, channels: I) -> (ClientId, mpsc::Receiver<Arc<HubFrame>>)
    where
        I: IntoIterator<Item = Channel>,
    {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channels: HashSet<Channel> = channels.into_iter().collect();
        debug!(client = id, ?channels, "Client registered with hub");
        self.lock().push(ClientHandle { id, channels, sender: tx, dropped: 0 });
        (id, rx)
    }

    /// Adds channels to a client. Returns `false` for an unknown client.
    pub fn subscribe(&self, id: ClientId, channels: &[Channel]) -> bool {
        let mut clients = self.lock();
        match clients.iter_mut().find(|c| c.id == id) {
            Some(client) => {
                client.channels.extend(channels.iter().copied());
                true
            }
            None => false,
        }
    }

    /// Removes channels from a client. Takes effect for every later [`FanoutHub::broadcast`].
    pub fn unsubscribe(&self, id: ClientId, channels: &[Channel]) -> bool {
        let mut clients = self.lock();
        match clients.iter_mut().find(|c| c.id == id) {
            Some(client) => {
                for channel in channels {
                    client.channels.remove(channel);
                }
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, id: ClientId, channel: Channel) -> bool {
        self.lock().iter().any(|c| c.id == id && c.channels.contains(&channel))
    }

    /// Channels a client currently belongs to, sorted.
    pub fn channels_of(&self, id: ClientId) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .lock()
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.channels.iter().copied().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Removes a client from the hub and from every channel.
    pub fn remove_client(&self, id: ClientId) {
        let mut clients = self.lock();
        clients.retain(|c| c.id != id);
        info!(client = id, "Client removed from hub");
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// # Broadcast
    ///
    /// Delivers a frame to every client subscribed to its channel and returns how many clients
    /// received it. Full client queues count a drop; closed ones are removed.
    pub fn broadcast(&self, frame: HubFrame) -> usize {
        let frame = Arc::new(frame);
        let mut delivered = 0;
        let mut clients = self.lock();

        clients.retain_mut(|client| {
            if !client.channels.contains(&frame.channel) {
                return true;
            }
            match client.sender.try_send(Arc::clone(&frame)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    client.dropped += 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!(client = client.id, "Client disconnected, removing from hub");
                    false
                }
            }
        });

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn stats(&self) -> HubStats {
        let clients = self.lock();
        let mut channel_members: BTreeMap<Channel, usize> =
            Channel::ALL.iter().map(|c| (*c, 0)).collect();
        let mut per_client = Vec::with_capacity(clients.len());
        for client in clients.iter() {
            for channel in &client.channels {
                *channel_members.entry(*channel).or_default() += 1;
            }
            let mut channels: Vec<Channel> = client.channels.iter().copied().collect();
            channels.sort();
            per_client.push(ClientStats {
                id: client.id,
                channels,
                dropped_frames: client.dropped,
            });
        }
        HubStats {
            clients: clients.len(),
            channel_members,
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            per_client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: EventKind) -> HubFrame {
        HubFrame::new(kind, format!("{{\"eventType\":\"{}\"}}", kind), 1)
    }

    #[tokio::test]
    async fn test_delivery_by_channel_membership() {
        let hub = FanoutHub::default();
        let (_devices_id, mut devices_rx) = hub.add_client([Channel::Devices]);
        let (_tak_id, mut tak_rx) = hub.add_client([Channel::Tak, Channel::Alerts]);

        assert_eq!(hub.broadcast(frame(EventKind::DeviceUpdate)), 1);
        assert_eq!(hub.broadcast(frame(EventKind::TakMessage)), 1);

        assert_eq!(devices_rx.recv().await.unwrap().kind, EventKind::DeviceUpdate);
        assert_eq!(tak_rx.recv().await.unwrap().kind, EventKind::TakMessage);
        assert!(devices_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_applies_to_next_delivery() {
        let hub = FanoutHub::default();
        let (id, mut rx) = hub.add_client([Channel::Devices]);
        hub.unsubscribe(id, &[Channel::Devices]);
        assert_eq!(hub.broadcast(frame(EventKind::DeviceUpdate)), 0);
        assert!(rx.try_recv().is_err());

        hub.subscribe(id, &[Channel::Devices]);
        assert_eq!(hub.broadcast(frame(EventKind::DeviceUpdate)), 1);
        assert!(hub.is_subscribed(id, Channel::Devices));
    }

    #[test]
    fn test_remove_client_leaves_every_channel() {
        let hub = FanoutHub::default();
        let (id, _rx) = hub.add_client(Channel::ALL);
        assert_eq!(hub.stats().channel_members[&Channel::Scan], 1);

        hub.remove_client(id);
        let stats = hub.stats();
        assert_eq!(stats.clients, 0);
        assert!(stats.channel_members.values().all(|n| *n == 0));
        assert!(!hub.is_subscribed(id, Channel::Scan));
        assert!(!hub.subscribe(id, &[Channel::Scan]));
    }

    #[test]
    fn test_slow_client_drops_and_dead_client_is_pruned() {
        let hub = FanoutHub::new(2);
        let (slow, _slow_rx) = hub.add_client([Channel::System]);
        let (_dead, dead_rx) = hub.add_client([Channel::System]);
        drop(dead_rx);

        for _ in 0..3 {
            hub.broadcast(frame(EventKind::Heartbeat));
        }
        let stats = hub.stats();
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.frames_delivered, 2);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.per_client[0].id, slow);
        assert_eq!(stats.per_client[0].dropped_frames, 1);
    }
}
