//! # Event Batcher
//!
//! Bounded multi-type outbound queue between the pipeline and the fan-out hub.
//!
//! ## Behaviour
//!
//! - Messages queue per event type. A type's queue is flushed into one batch on the batch
//!   interval, or as soon as it reaches `batch_size`.
//! - Capacity is shared by all types. An enqueue beyond it is rejected: the drop counter grows
//!   by one and the backpressure signal is raised. The producer never waits.
//! - A message with priority above `priority_threshold` flushes its type immediately.
//! - A serialized batch larger than `compression_threshold` bytes is deflated and base64
//!   encoded. The byte savings are tracked and may be negative for incompressible payloads.
//!
//! Backpressure is published on a `watch` channel and cleared by the first flush that brings
//! the queue back under capacity.

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::hub::HubFrame;
use crate::configs::BatchConfig;
use crate::errors::{BridgeError, Result};
use crate::models::{Envelope, EventKind};

/// Priority given to structural device changes and connection events.
pub const PRIORITY_IMMEDIATE: u8 = 10;
/// Priority of ordinary events.
pub const PRIORITY_NORMAL: u8 = 0;

#[derive(Debug)]
struct QueuedMessage {
    envelope: Envelope,
    priority: u8,
}

/// Result of [`Batcher::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Queued; it will leave with the next interval flush.
    Queued,
    /// Queued; the caller should flush this type now.
    FlushNow(EventKind),
    /// Rejected because the queue is full.
    Rejected,
}

/// Counters exposed through the bridge status.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub batches_sent: u64,
    pub bytes_transmitted: u64,
    pub compression_savings: i64,
    pub current_queue_size: usize,
    pub backpressure: bool,
}

/// # Batcher
pub struct Batcher {
    config: BatchConfig,
    queues: BTreeMap<EventKind, VecDeque<QueuedMessage>>,
    queued: usize,
    stats: BatcherStats,
    backpressure_tx: watch::Sender<bool>,
}

impl Batcher {
    pub fn new(config: BatchConfig) -> Self {
        let (backpressure_tx, _) = watch::channel(false);
        Self {
            config,
            queues: BTreeMap::new(),
            queued: 0,
            stats: BatcherStats::default(),
            backpressure_tx,
        }
    }

    /// Receiver that observes the backpressure flag.
    pub fn backpressure(&self) -> watch::Receiver<bool> {
        self.backpressure_tx.subscribe()
    }

    pub fn queue_size(&self) -> usize {
        self.queued
    }

    /// # Enqueue
    ///
    /// Never blocks. Within a type, higher priorities leave first; equal priorities keep
    /// arrival order.
    pub fn enqueue(&mut self, kind: EventKind, envelope: Envelope, priority: u8) -> EnqueueOutcome {
        if self.queued >= self.config.max_queue_size {
            self.stats.messages_dropped += 1;
            if !self.stats.backpressure {
                warn!(queue_size = self.queued, "Batch queue full, raising backpressure");
            }
            self.stats.backpressure = true;
            self.backpressure_tx.send_replace(true);
            return EnqueueOutcome::Rejected;
        }

        let queue = self.queues.entry(kind).or_default();
        queue.push_back(QueuedMessage { envelope, priority });
        if priority > PRIORITY_NORMAL {
            queue.make_contiguous().sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        self.queued += 1;

        if priority > self.config.priority_threshold || queue.len() >= self.config.batch_size {
            EnqueueOutcome::FlushNow(kind)
        } else {
            EnqueueOutcome::Queued
        }
    }

    /// Flushes up to `batch_size` messages of one type.
    pub fn flush_kind(&mut self, kind: EventKind, now_ms: i64) -> Option<HubFrame> {
        let frame = self.take_batch(kind, now_ms);
        self.release_backpressure();
        frame
    }

    /// Interval flush: one batch per non-empty type.
    pub fn flush_all(&mut self, now_ms: i64) -> Vec<HubFrame> {
        let kinds: Vec<EventKind> = self
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(k, _)| *k)
            .collect();
        let frames = kinds.into_iter().filter_map(|k| self.take_batch(k, now_ms)).collect();
        self.release_backpressure();
        frames
    }

    /// Abandons everything still queued. Returns how many messages were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.queued;
        self.queues.clear();
        self.queued = 0;
        self.release_backpressure();
        discarded
    }

    fn take_batch(&mut self, kind: EventKind, now_ms: i64) -> Option<HubFrame> {
        let queue = self.queues.get_mut(&kind)?;
        if queue.is_empty() {
            return None;
        }
        let take = queue.len().min(self.config.batch_size);
        let messages: Vec<Envelope> = queue.drain(..take).map(|m| m.envelope).collect();
        self.queued -= messages.len();

        let count = messages.len();
        let body = json!({
            "type": "batch",
            "eventType": kind.as_str(),
            "batchId": batch_id(now_ms),
            "timestamp": now_ms,
            "messages": messages,
            "stats": {
                "queueSize": self.queued,
                "droppedMessages": self.stats.messages_dropped,
            },
        });

        match self.encode(body) {
            Ok(frame_body) => {
                self.stats.messages_sent += count as u64;
                self.stats.batches_sent += 1;
                Some(HubFrame::new(kind, frame_body, count))
            }
            Err(e) => {
                self.stats.messages_dropped += count as u64;
                warn!(kind = %kind, error = %e, "Failed to encode batch, dropping it");
                None
            }
        }
    }

    fn encode(&mut self, body: Value) -> Result<String> {
        let raw = serde_json::to_string(&body)?;
        let original_size = raw.len();
        if original_size <= self.config.compression_threshold {
            self.stats.bytes_transmitted += original_size as u64;
            return Ok(raw);
        }

        let encoded = compress(raw.as_bytes())?;
        let wrapped = serde_json::to_string(&json!({
            "type": "batch",
            "compressed": true,
            "encoding": "deflate+base64",
            "originalSize": original_size,
            "data": encoded,
        }))?;
        self.stats.compression_savings += original_size as i64 - wrapped.len() as i64;
        self.stats.bytes_transmitted += wrapped.len() as u64;
        debug!(original_size, encoded_size = wrapped.len(), "Compressed batch");
        Ok(wrapped)
    }

    fn release_backpressure(&mut self) {
        if self.stats.backpressure && self.queued < self.config.max_queue_size {
            self.stats.backpressure = false;
            self.backpressure_tx.send_replace(false);
            debug!(queue_size = self.queued, "Batch queue drained, backpressure released");
        }
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats { current_queue_size: self.queued, ..self.stats.clone() }
    }
}

fn batch_id(now_ms: i64) -> String {
    format!("{}-{:09}", now_ms, rand::rng().random_range(0..1_000_000_000u32))
}

fn compress(bytes: &[u8]) -> Result<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(BASE64.encode(encoder.finish()?))
}

/// Inverse of the batch encoding: accepts a frame body as sent to clients and returns the
/// plain batch document, inflating it when it is a compressed wrapper.
pub fn decode_frame_body(body: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(body)?;
    if value.get("compressed").and_then(Value::as_bool) != Some(true) {
        return Ok(value);
    }
    let data = value
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::Protocol("compressed batch without data".into()))?;
    let deflated = BASE64
        .decode(data)
        .map_err(|e| BridgeError::Protocol(format!("invalid base64 batch: {}", e)))?;
    let mut text = String::new();
    DeflateDecoder::new(deflated.as_slice()).read_to_string(&mut text)?;
    Ok(serde_json::from_str(&text)?)
}
