//! # Event Applicator
//!
//! The canonical inbound pipeline. Every decoded replication event runs
//! through validate → dedup → clamp → LWW → commit → mark-seen, in that
//! order, and produces a structured `ApplicationOutcome` for observers.
//!
//! The pipeline is serialized: one event is fully resolved and committed
//! before the next begins, which is what makes the LWW read-compare-write
//! against storage race-free. Malformed or stale events are counted and
//! skipped; nothing an individual event does can take the inbound stream
//! down, and applicator failures are never surfaced to any caller.
//!
//! Mark-seen runs only when the event was applied or classified a
//! duplicate. A rejected event is deliberately left unmarked so a later,
//! corrected redelivery of the same `(node_id, seq)` still gets a full
//! look.

use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use crate::dedup::DedupTracker;
use crate::event::ReplicationEvent;
use crate::metrics::Metrics;
use crate::store::{clamp_timestamp, now_ms, LwwOutcome, LwwResolver, Storage, StorageEntry};

/// Why an event was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Failed field validation.
    Invalid(String),

    /// Lost LWW against the existing entry.
    Older,

    /// The storage backend refused the commit.
    Storage(String),
}

/// Terminal classification of one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationResult {
    /// Committed to storage.
    Applied,

    /// Already seen, or identical to the existing entry. No write.
    Duplicate,

    /// Not applied; see the reason.
    Rejected(RejectReason),

    /// Same compare key as the existing entry but different content. The
    /// existing entry was kept.
    Conflict(String),
}

/// Structured status emitted per processed event.
#[derive(Debug, Clone)]
pub struct ApplicationOutcome {
    pub result: ApplicationResult,
    pub key: String,
    pub node_id: String,
    pub seq: u64,
    pub duration: Duration,
}

/// Inbound replication pipeline.
pub struct EventApplicator {
    storage: Arc<dyn Storage>,
    dedup: Arc<DedupTracker>,
    resolver: LwwResolver,
    max_future_skew_ms: i64,
    max_key_bytes: usize,
    max_value_bytes: usize,
    metrics: Arc<Metrics>,
    pipeline: Mutex<()>,
    observers: Mutex<Vec<mpsc::Sender<ApplicationOutcome>>>,
}

impl EventApplicator {
    pub fn new(
        storage: Arc<dyn Storage>,
        dedup: Arc<DedupTracker>,
        max_future_skew_ms: i64,
        max_key_bytes: usize,
        max_value_bytes: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            storage,
            dedup,
            resolver: LwwResolver::new(max_future_skew_ms),
            max_future_skew_ms,
            max_key_bytes,
            max_value_bytes,
            metrics,
            pipeline: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer for application outcomes. Slow observers are
    /// skipped, never waited on.
    pub async fn subscribe_outcomes(&self, buffer: usize) -> mpsc::Receiver<ApplicationOutcome> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.observers.lock().await.push(tx);
        rx
    }

    /// Run one event through the pipeline.
    pub async fn apply(&self, event: ReplicationEvent) -> ApplicationOutcome {
        let _serialized = self.pipeline.lock().await;
        let started = Instant::now();
        let result = self.apply_inner(&event).await;
        let outcome = ApplicationOutcome {
            result,
            key: event.key,
            node_id: event.node_id,
            seq: event.seq,
            duration: started.elapsed(),
        };
        self.notify(&outcome).await;
        outcome
    }

    async fn apply_inner(&self, event: &ReplicationEvent) -> ApplicationResult {
        // 1. Validate.
        if let Err(reason) = event.validate(self.max_key_bytes, self.max_value_bytes) {
            warn!("applicator: rejecting malformed event: {}", reason);
            self.metrics.incr(&self.metrics.events_rejected);
            return ApplicationResult::Rejected(RejectReason::Invalid(reason));
        }

        // 2. Dedup.
        if self.dedup.is_duplicate(&event.node_id, event.seq) {
            debug!(
                "applicator: duplicate delivery ({}, {})",
                event.node_id, event.seq
            );
            self.metrics.incr(&self.metrics.events_duplicate);
            return ApplicationResult::Duplicate;
        }

        // 3. Clamp the remote timestamp for comparison and storage.
        let now = now_ms();
        let stored_ts = clamp_timestamp(event.timestamp_ms, now, self.max_future_skew_ms);
        let candidate = StorageEntry::from_event(event, stored_ts);

        // 4. LWW against the existing entry.
        let existing = self.storage.get(&event.key);
        match self.resolver.resolve(existing.as_ref(), &candidate, now) {
            LwwOutcome::RemoteWins => {
                let committed = if candidate.is_tombstone() {
                    self.storage.delete(
                        &candidate.key,
                        candidate.timestamp_ms,
                        &candidate.node_id,
                        candidate.seq,
                    )
                } else {
                    self.storage.put(candidate.clone())
                };
                if let Err(e) = committed {
                    warn!("applicator: storage commit failed for {}: {}", event.key, e);
                    self.metrics.incr(&self.metrics.events_rejected);
                    return ApplicationResult::Rejected(RejectReason::Storage(e.to_string()));
                }
                // 5. Mark seen only after the commit stuck.
                self.dedup.mark_seen(&event.node_id, event.seq);
                self.metrics.incr(&self.metrics.events_applied);
                ApplicationResult::Applied
            }
            LwwOutcome::LocalWins => {
                self.metrics.incr(&self.metrics.events_stale);
                ApplicationResult::Rejected(RejectReason::Older)
            }
            LwwOutcome::Duplicate => {
                self.dedup.mark_seen(&event.node_id, event.seq);
                self.metrics.incr(&self.metrics.events_duplicate);
                ApplicationResult::Duplicate
            }
            LwwOutcome::Conflict => {
                warn!(
                    "applicator: content conflict at equal version for key {} ({} vs {})",
                    event.key,
                    event.node_id,
                    existing.as_ref().map(|e| e.node_id.as_str()).unwrap_or("?"),
                );
                self.metrics.incr(&self.metrics.lww_anomalies);
                ApplicationResult::Conflict(
                    "equal compare key with differing content; kept existing entry".to_string(),
                )
            }
        }
    }

    async fn notify(&self, outcome: &ApplicationOutcome) {
        let mut observers = self.observers.lock().await;
        observers.retain(|tx| match tx.try_send(outcome.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEngine;
    use std::sync::atomic::Ordering;

    struct Fixture {
        applicator: EventApplicator,
        storage: Arc<MemoryEngine>,
        metrics: Arc<Metrics>,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(Metrics::new());
        let storage = Arc::new(MemoryEngine::new());
        let dedup = Arc::new(DedupTracker::new(
            4096,
            100,
            Duration::from_secs(3600),
            metrics.clone(),
        ));
        let applicator = EventApplicator::new(
            storage.clone(),
            dedup,
            300_000,
            256,
            262_144,
            metrics.clone(),
        );
        Fixture {
            applicator,
            storage,
            metrics,
        }
    }

    fn event(key: &str, value: &str, ts: i64, node: &str, seq: u64) -> ReplicationEvent {
        ReplicationEvent::value(key, node, seq, ts, value)
    }

    #[tokio::test]
    async fn applies_fresh_event() {
        let f = fixture();
        let outcome = f.applicator.apply(event("k", "v1", 1_000, "A", 1)).await;
        assert_eq!(outcome.result, ApplicationResult::Applied);
        assert_eq!(f.storage.get("k").unwrap().value.as_deref(), Some("v1"));
        assert_eq!(f.metrics.events_applied.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn second_delivery_is_duplicate_without_second_write() {
        let f = fixture();
        let e = event("k", "v", 1_000, "X", 42);
        assert_eq!(
            f.applicator.apply(e.clone()).await.result,
            ApplicationResult::Applied
        );
        for _ in 0..3 {
            assert_eq!(
                f.applicator.apply(e.clone()).await.result,
                ApplicationResult::Duplicate
            );
        }
        assert_eq!(f.metrics.events_applied.load(Ordering::Relaxed), 1);
        assert_eq!(f.metrics.events_duplicate.load(Ordering::Relaxed), 3);
        assert_eq!(f.storage.get("k").unwrap().seq, 42);
    }

    #[tokio::test]
    async fn newer_event_overwrites_older_rejected() {
        let f = fixture();
        f.applicator.apply(event("k", "v2", 2_000, "B", 1)).await;
        let outcome = f.applicator.apply(event("k", "v1", 1_000, "A", 1)).await;
        assert_eq!(
            outcome.result,
            ApplicationResult::Rejected(RejectReason::Older)
        );
        assert_eq!(f.storage.get("k").unwrap().value.as_deref(), Some("v2"));
        assert_eq!(f.metrics.events_stale.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn stale_rejection_leaves_seq_unmarked() {
        let f = fixture();
        f.applicator.apply(event("k", "new", 2_000, "B", 9)).await;
        // A stale event from A: rejected, and NOT remembered as seen.
        let stale = event("k", "old", 1_000, "A", 5);
        f.applicator.apply(stale.clone()).await;
        // The same (node, seq) later carrying a winning write gets a full
        // look instead of being swallowed as a duplicate.
        let winning = event("k", "corrected", 3_000, "A", 5);
        assert_eq!(
            f.applicator.apply(winning).await.result,
            ApplicationResult::Applied
        );
    }

    #[tokio::test]
    async fn tombstone_wins_and_deletes() {
        let f = fixture();
        f.applicator.apply(event("k", "v", 1_000, "A", 1)).await;
        let outcome = f
            .applicator
            .apply(ReplicationEvent::tombstone("k", "B", 2, 2_000))
            .await;
        assert_eq!(outcome.result, ApplicationResult::Applied);
        let entry = f.storage.get("k").unwrap();
        assert!(entry.is_tombstone());
        assert_eq!(entry.node_id, "B");
        assert_eq!(entry.seq, 2);
    }

    #[tokio::test]
    async fn equal_timestamp_converges_on_greater_node_id() {
        let f = fixture();
        f.applicator.apply(event("k", "vA", 1_000, "A", 1)).await;
        let outcome = f.applicator.apply(event("k", "vB", 1_000, "B", 1)).await;
        assert_eq!(outcome.result, ApplicationResult::Applied);
        assert_eq!(f.storage.get("k").unwrap().value.as_deref(), Some("vB"));

        // And in reverse arrival order on another key.
        let f = fixture();
        f.applicator.apply(event("j", "vB", 1_000, "B", 1)).await;
        let outcome = f.applicator.apply(event("j", "vA", 1_000, "A", 1)).await;
        assert_eq!(
            outcome.result,
            ApplicationResult::Rejected(RejectReason::Older)
        );
        assert_eq!(f.storage.get("j").unwrap().value.as_deref(), Some("vB"));
    }

    #[tokio::test]
    async fn conflict_keeps_existing_and_counts_anomaly() {
        let f = fixture();
        f.applicator.apply(event("k", "original", 1_000, "A", 1)).await;
        let outcome = f.applicator.apply(event("k", "mutant", 1_000, "A", 2)).await;
        assert!(matches!(outcome.result, ApplicationResult::Conflict(_)));
        assert_eq!(
            f.storage.get("k").unwrap().value.as_deref(),
            Some("original")
        );
        assert_eq!(f.metrics.lww_anomalies.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn malformed_events_rejected_stream_continues() {
        let f = fixture();
        let bad_key = event("", "v", 1_000, "A", 1);
        let bad_ts = event("k", "v", 0, "A", 2);
        let mut contradictory = event("k", "v", 1_000, "A", 3);
        contradictory.tombstone = true;

        for bad in [bad_key, bad_ts, contradictory] {
            assert!(matches!(
                f.applicator.apply(bad).await.result,
                ApplicationResult::Rejected(RejectReason::Invalid(_))
            ));
        }
        assert_eq!(f.metrics.events_rejected.load(Ordering::Relaxed), 3);

        // The stream is still healthy.
        assert_eq!(
            f.applicator.apply(event("k", "v", 1_000, "A", 4)).await.result,
            ApplicationResult::Applied
        );
    }

    #[tokio::test]
    async fn future_timestamp_clamped_before_storage() {
        let f = fixture();
        let far_future = now_ms() + 3_600_000;
        f.applicator.apply(event("k", "v", far_future, "A", 1)).await;
        let stored = f.storage.get("k").unwrap();
        // Stored timestamp was pulled down to now + skew.
        assert!(stored.timestamp_ms <= now_ms() + 300_000);
        assert!(stored.timestamp_ms < far_future);
    }

    #[tokio::test]
    async fn observers_receive_outcomes() {
        let f = fixture();
        let mut rx = f.applicator.subscribe_outcomes(16).await;
        f.applicator.apply(event("k", "v", 1_000, "A", 1)).await;
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.key, "k");
        assert_eq!(outcome.node_id, "A");
        assert_eq!(outcome.seq, 1);
        assert_eq!(outcome.result, ApplicationResult::Applied);
    }
}
