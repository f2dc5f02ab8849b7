//! # Outbox Queue
//!
//! Bounded, durable FIFO of replication events awaiting publication. The
//! publisher enqueues here whenever the transport is offline or a publish
//! fails, and drains in batches once the connection returns, so local
//! writes survive broker outages and node restarts.
//!
//! Persistence is a single JSON document at `<storage_path>.outbox`,
//! rewritten through a temp file and an atomic rename on every mutation.
//! Rewriting the whole queue is acceptable here: the queue is small
//! (`max_size`, default 10k) and mutations are rare next to MQTT traffic.
//!
//! At capacity the oldest event is dropped to admit the new one; every
//! such drop is counted in `outbox_drops`. FIFO order is preserved across
//! restarts. A corrupt document on load is salvaged to the longest prefix
//! of well-formed events and rewritten.

use chrono::{SecondsFormat, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::event::ReplicationEvent;
use crate::metrics::Metrics;

#[derive(Debug, Serialize, Deserialize)]
struct OutboxSnapshot {
    events: Vec<serde_json::Value>,
    updated: String,
}

struct OutboxInner {
    events: VecDeque<ReplicationEvent>,
    last_flush: Option<Instant>,
}

/// Bounded persistent FIFO of pending replication events.
pub struct OutboxQueue {
    path: Option<PathBuf>,
    max_size: usize,
    inner: Mutex<OutboxInner>,
    metrics: Arc<Metrics>,
}

impl OutboxQueue {
    /// Open the outbox at `path`, restoring any persisted events.
    pub async fn open(path: impl AsRef<Path>, max_size: usize, metrics: Arc<Metrics>) -> Self {
        let path = path.as_ref().to_path_buf();
        let events = Self::load(&path).await;
        if !events.is_empty() {
            info!("outbox: restored {} pending event(s)", events.len());
        }
        metrics.set_gauge(&metrics.outbox_size, events.len() as u64);
        Self {
            path: Some(path),
            max_size,
            inner: Mutex::new(OutboxInner {
                events,
                last_flush: None,
            }),
            metrics,
        }
    }

    /// An outbox with no backing file, for persistence-disabled nodes.
    pub fn ephemeral(max_size: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            path: None,
            max_size,
            inner: Mutex::new(OutboxInner {
                events: VecDeque::new(),
                last_flush: None,
            }),
            metrics,
        }
    }

    /// Append an event, dropping the oldest if the queue is full.
    pub async fn enqueue(&self, event: ReplicationEvent) {
        let mut inner = self.inner.lock().await;
        if inner.events.len() == self.max_size {
            inner.events.pop_front();
            self.metrics.incr(&self.metrics.outbox_drops);
            warn!("outbox: at capacity {}, dropped oldest event", self.max_size);
        }
        inner.events.push_back(event);
        self.metrics
            .set_gauge(&self.metrics.outbox_size, inner.events.len() as u64);
        self.persist(&inner).await;
    }

    /// Clone up to `n` events from the head without removing them.
    pub async fn peek_batch(&self, n: usize) -> Vec<ReplicationEvent> {
        let inner = self.inner.lock().await;
        inner.events.iter().take(n).cloned().collect()
    }

    /// Acknowledge the first `n` events as published, removing them.
    pub async fn ack_batch(&self, n: usize) {
        let mut inner = self.inner.lock().await;
        let n = n.min(inner.events.len());
        inner.events.drain(..n);
        inner.last_flush = Some(Instant::now());
        self.metrics
            .set_gauge(&self.metrics.outbox_size, inner.events.len() as u64);
        self.persist(&inner).await;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Instant of the most recent acknowledged flush, if any.
    pub async fn last_flush_time(&self) -> Option<Instant> {
        self.inner.lock().await.last_flush
    }

    /// Snapshot the whole queue atomically: write a temp file, rename over
    /// the live one. Persistence errors are logged, not surfaced; the
    /// queue remains authoritative in memory.
    async fn persist(&self, inner: &OutboxInner) {
        let Some(path) = &self.path else { return };
        let snapshot = OutboxSnapshot {
            events: inner
                .events
                .iter()
                .filter_map(|e| serde_json::to_value(e).ok())
                .collect(),
            updated: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(b) => b,
            Err(e) => {
                warn!("outbox: serialize failed: {}", e);
                return;
            }
        };
        let tmp = path.with_extension("outbox.tmp");
        let result = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = result {
            warn!("outbox: persist to {} failed: {}", path.display(), e);
        }
    }

    /// Load persisted events, keeping the longest prefix of well-formed
    /// records when individual entries are corrupt. An unreadable or
    /// unparseable document loads as empty.
    async fn load(path: &Path) -> VecDeque<ReplicationEvent> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(_) => return VecDeque::new(),
        };
        let snapshot: OutboxSnapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!("outbox: corrupt document at {}: {}", path.display(), e);
                return VecDeque::new();
            }
        };
        let mut events = VecDeque::with_capacity(snapshot.events.len());
        for (i, raw) in snapshot.events.into_iter().enumerate() {
            match serde_json::from_value::<ReplicationEvent>(raw) {
                Ok(event) => events.push_back(event),
                Err(e) => {
                    warn!(
                        "outbox: corrupt record at index {}, truncating to {} event(s): {}",
                        i,
                        events.len(),
                        e
                    );
                    break;
                }
            }
        }
        events
    }
}
