//! # Deduplication Tracker
//!
//! Per-peer sliding-window membership over sequence numbers, used by the
//! applicator to suppress redelivered events under MQTT's at-least-once
//! semantics. Each peer gets a fixed-width bitmap covering
//! `[base_seq, base_seq + W)`; marking a sequence beyond the window slides
//! the base forward to `seq - W/2`, dropping the oldest half.
//!
//! Memory is bounded two ways: at most `max_nodes` peer windows (LRU
//! eviction beyond that) and a per-peer TTL pruned by periodic cleanup.
//! An evicted peer reports non-duplicate, which is safe: re-application is
//! idempotent through LWW, which classifies the replay as `Duplicate` or
//! rejects it as older. Sequences that fell below the base of a live
//! window report duplicate; the window has already slid past them.
//!
//! Both operations are O(1) amortized: a slide touches the whole bitmap
//! but only happens once per W/2 marks.

use log::debug;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::metrics::Metrics;

/// Membership window over `[base_seq, base_seq + width)`.
struct SequenceWindow {
    base_seq: u64,
    bits: Vec<u64>,
    last_access: Instant,
}

impl SequenceWindow {
    /// Open a window centered so the first sequence sits halfway in, which
    /// leaves room for reordered older deliveries from the same peer.
    fn new(width: u64, first_seq: u64) -> Self {
        let mut window = Self {
            base_seq: first_seq.saturating_sub(width / 2),
            bits: vec![0u64; (width / 64) as usize],
            last_access: Instant::now(),
        };
        window.set(first_seq);
        window
    }

    fn width(&self) -> u64 {
        self.bits.len() as u64 * 64
    }

    fn contains(&self, seq: u64) -> bool {
        if seq < self.base_seq || seq >= self.base_seq + self.width() {
            return false;
        }
        let offset = seq - self.base_seq;
        self.bits[(offset / 64) as usize] & (1u64 << (offset % 64)) != 0
    }

    fn set(&mut self, seq: u64) {
        debug_assert!(seq >= self.base_seq && seq < self.base_seq + self.width());
        let offset = seq - self.base_seq;
        self.bits[(offset / 64) as usize] |= 1u64 << (offset % 64);
    }

    /// Record `seq`, sliding the window forward if it lies beyond the end.
    fn mark(&mut self, seq: u64) {
        if seq < self.base_seq {
            return;
        }
        let width = self.width();
        if seq >= self.base_seq + width {
            self.slide(seq - width / 2);
        }
        self.set(seq);
    }

    fn slide(&mut self, new_base: u64) {
        let width = self.width();
        let old_base = self.base_seq;
        let mut new_bits = vec![0u64; self.bits.len()];
        let survivors_from = new_base.max(old_base);
        let survivors_to = old_base + width;
        for seq in survivors_from..survivors_to {
            if self.contains(seq) {
                let offset = seq - new_base;
                new_bits[(offset / 64) as usize] |= 1u64 << (offset % 64);
            }
        }
        self.base_seq = new_base;
        self.bits = new_bits;
    }
}

/// Bounded per-peer duplicate suppression.
pub struct DedupTracker {
    windows: Mutex<LruCache<String, SequenceWindow>>,
    window_size: u64,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl DedupTracker {
    pub fn new(window_size: u64, max_nodes: usize, ttl: Duration, metrics: Arc<Metrics>) -> Self {
        let capacity = NonZeroUsize::new(max_nodes).unwrap_or(NonZeroUsize::MIN);
        Self {
            windows: Mutex::new(LruCache::new(capacity)),
            window_size,
            ttl,
            metrics,
        }
    }

    /// Has `(node_id, seq)` been observed? Unknown and evicted peers
    /// report false; below-window sequences of a live peer report true.
    pub fn is_duplicate(&self, node_id: &str, seq: u64) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let Some(window) = windows.get_mut(node_id) else {
            return false;
        };
        window.last_access = Instant::now();
        if seq < window.base_seq {
            return true;
        }
        window.contains(seq)
    }

    /// Record `(node_id, seq)` as observed.
    pub fn mark_seen(&self, node_id: &str, seq: u64) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(window) = windows.get_mut(node_id) {
            window.last_access = Instant::now();
            window.mark(seq);
        } else {
            let window = SequenceWindow::new(self.window_size, seq);
            if let Some((evicted, _)) = windows.push(node_id.to_string(), window) {
                if evicted != node_id {
                    debug!("dedup: evicted idle-most peer {}", evicted);
                    self.metrics.incr(&self.metrics.dedup_evictions);
                }
            }
        }
        self.metrics
            .set_gauge(&self.metrics.dedup_peers, windows.len() as u64);
    }

    /// Drop peers idle for at least the TTL. Returns how many were pruned.
    pub fn evict_expired(&self) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let expired: Vec<String> = windows
            .iter()
            .filter(|(_, w)| now.duration_since(w.last_access) >= self.ttl)
            .map(|(node, _)| node.clone())
            .collect();
        for node in &expired {
            windows.pop(node);
            self.metrics.incr(&self.metrics.dedup_evictions);
        }
        if !expired.is_empty() {
            debug!("dedup: pruned {} idle peer window(s)", expired.len());
        }
        self.metrics
            .set_gauge(&self.metrics.dedup_peers, windows.len() as u64);
        expired.len()
    }

    pub fn peer_count(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
