//! # Metrics Surface
//!
//! In-process counters, gauges, and a latency histogram consumed by every
//! component of the replication core. All fields are lock-free atomics so
//! hot paths never contend on a metrics mutex.
//!
//! The anti-entropy counters (`sync_rounds`, `sync_keys_repaired`) belong to
//! the external Merkle synchronization subsystem; they live here so that
//! subsystem has a place to report into, but nothing in this crate
//! increments them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Fixed bucket upper bounds for the publish latency histogram, in
/// microseconds. The last bucket is open-ended.
const LATENCY_BUCKETS_US: [u64; 7] = [1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000];

/// Histogram of observed durations with fixed microsecond buckets.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        let idx = LATENCY_BUCKETS_US
            .iter()
            .position(|&bound| us <= bound)
            .unwrap_or(LATENCY_BUCKETS_US.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean observed duration in microseconds, zero when empty.
    pub fn mean_us(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.sum_us.load(Ordering::Relaxed) / count
    }

    pub fn max_us(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }
}

/// Counters and gauges for the replication and command core.
#[derive(Debug, Default)]
pub struct Metrics {
    // Outbound path.
    pub events_published: AtomicU64,
    pub publish_errors: AtomicU64,
    pub outbox_drops: AtomicU64,
    pub outbox_flushed: AtomicU64,
    pub outbox_size: AtomicU64,
    pub publish_latency: LatencyHistogram,

    // Inbound path.
    pub events_applied: AtomicU64,
    pub events_duplicate: AtomicU64,
    pub events_rejected: AtomicU64,
    pub events_stale: AtomicU64,
    pub events_self_origin: AtomicU64,
    pub lww_anomalies: AtomicU64,

    // Clocks and caches.
    pub sequence_persistence_errors: AtomicU64,
    pub dedup_evictions: AtomicU64,
    pub dedup_peers: AtomicU64,
    pub idempotent_hits: AtomicU64,
    pub tombstones_swept: AtomicU64,

    // Command surface.
    pub commands_processed: AtomicU64,
    pub command_errors: AtomicU64,
    pub get_commands: AtomicU64,
    pub set_commands: AtomicU64,
    pub delete_commands: AtomicU64,
    pub numeric_commands: AtomicU64,
    pub string_commands: AtomicU64,
    pub bulk_commands: AtomicU64,

    // Client-side correlation.
    pub requests_sent: AtomicU64,
    pub responses_received: AtomicU64,
    pub request_timeouts: AtomicU64,
    pub malformed_replies: AtomicU64,
    pub replayed_replies: AtomicU64,

    // Anti-entropy (incremented by the external sync subsystem only).
    pub sync_rounds: AtomicU64,
    pub sync_keys_repaired: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn incr(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to a counter.
    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    /// Render all metrics as `name:value` lines for the stats surface.
    pub fn render(&self) -> String {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut out = String::new();
        let lines = [
            ("events_published", load(&self.events_published)),
            ("publish_errors", load(&self.publish_errors)),
            ("outbox_drops", load(&self.outbox_drops)),
            ("outbox_flushed", load(&self.outbox_flushed)),
            ("outbox_size", load(&self.outbox_size)),
            ("publish_latency_count", self.publish_latency.count()),
            ("publish_latency_mean_us", self.publish_latency.mean_us()),
            ("publish_latency_max_us", self.publish_latency.max_us()),
            ("events_applied", load(&self.events_applied)),
            ("events_duplicate", load(&self.events_duplicate)),
            ("events_rejected", load(&self.events_rejected)),
            ("events_stale", load(&self.events_stale)),
            ("events_self_origin", load(&self.events_self_origin)),
            ("lww_anomalies", load(&self.lww_anomalies)),
            (
                "sequence_persistence_errors",
                load(&self.sequence_persistence_errors),
            ),
            ("dedup_evictions", load(&self.dedup_evictions)),
            ("dedup_peers", load(&self.dedup_peers)),
            ("idempotent_hits", load(&self.idempotent_hits)),
            ("tombstones_swept", load(&self.tombstones_swept)),
            ("commands_processed", load(&self.commands_processed)),
            ("command_errors", load(&self.command_errors)),
            ("get_commands", load(&self.get_commands)),
            ("set_commands", load(&self.set_commands)),
            ("delete_commands", load(&self.delete_commands)),
            ("numeric_commands", load(&self.numeric_commands)),
            ("string_commands", load(&self.string_commands)),
            ("bulk_commands", load(&self.bulk_commands)),
            ("requests_sent", load(&self.requests_sent)),
            ("responses_received", load(&self.responses_received)),
            ("request_timeouts", load(&self.request_timeouts)),
            ("malformed_replies", load(&self.malformed_replies)),
            ("replayed_replies", load(&self.replayed_replies)),
            ("sync_rounds", load(&self.sync_rounds)),
            ("sync_keys_repaired", load(&self.sync_keys_repaired)),
        ];
        for (name, value) in lines {
            out.push_str(name);
            out.push(':');
            out.push_str(&value.to_string());
            out.push_str("\r\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.incr(&metrics.events_published);
        metrics.add(&metrics.events_published, 4);
        assert_eq!(metrics.events_published.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn histogram_tracks_count_mean_max() {
        let h = LatencyHistogram::default();
        h.observe(Duration::from_micros(100));
        h.observe(Duration::from_micros(300));
        assert_eq!(h.count(), 2);
        assert_eq!(h.mean_us(), 200);
        assert_eq!(h.max_us(), 300);
    }

    #[test]
    fn histogram_routes_to_open_ended_bucket() {
        let h = LatencyHistogram::default();
        h.observe(Duration::from_secs(5));
        assert_eq!(h.buckets[7].load(Ordering::Relaxed), 1);
    }

    #[test]
    fn render_contains_core_lines() {
        let metrics = Metrics::new();
        metrics.incr(&metrics.events_duplicate);
        let text = metrics.render();
        assert!(text.contains("events_duplicate:1\r\n"));
        assert!(text.contains("outbox_drops:0\r\n"));
        assert!(text.contains("sync_rounds:0\r\n"));
    }
}
