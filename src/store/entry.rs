//! # Storage Entries and Last-Write-Wins Resolution
//!
//! A `StorageEntry` is the unit stored per key: either a value or a
//! tombstone, stamped with the originator's wall clock and `(node_id, seq)`
//! version vector. Deletes are retained as tombstones so they can win over
//! concurrent writes.
//!
//! Conflict resolution is skew-tolerant LWW: entries are ordered by the
//! lexicographic pair `(clamp(timestamp_ms), node_id)`. Clamping bounds
//! future-dated remote timestamps at `now + max_future_skew_ms` for
//! comparison and storage; outbound events always carry the authoring
//! clock unchanged. Two entries with equal compare keys and equal content
//! are the same write seen twice; equal compare keys with different
//! content is an anomaly, and the existing entry is kept.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::ReplicationEvent;

/// Current wall clock in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The unit stored per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: String,

    /// Absent iff this entry is a tombstone.
    pub value: Option<String>,

    /// Wall-clock milliseconds at the authoring node.
    pub timestamp_ms: i64,

    /// Originator identity.
    pub node_id: String,

    /// Originator sequence; `(node_id, seq)` identifies the write attempt.
    pub seq: u64,
}

impl StorageEntry {
    pub fn value(
        key: impl Into<String>,
        value: impl Into<String>,
        timestamp_ms: i64,
        node_id: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            timestamp_ms,
            node_id: node_id.into(),
            seq,
        }
    }

    pub fn tombstone(
        key: impl Into<String>,
        timestamp_ms: i64,
        node_id: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value: None,
            timestamp_ms,
            node_id: node_id.into(),
            seq,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Project this entry onto the wire, carrying the stored (authoring)
    /// timestamp.
    pub fn to_event(&self) -> ReplicationEvent {
        ReplicationEvent {
            key: self.key.clone(),
            node_id: self.node_id.clone(),
            seq: self.seq,
            timestamp_ms: self.timestamp_ms,
            tombstone: self.is_tombstone(),
            value: self.value.clone(),
        }
    }

    /// Build the entry a received event would commit as. The caller passes
    /// the timestamp to store, which for inbound events is the clamped one.
    pub fn from_event(event: &ReplicationEvent, timestamp_ms: i64) -> Self {
        Self {
            key: event.key.clone(),
            value: event.value.clone(),
            timestamp_ms,
            node_id: event.node_id.clone(),
            seq: event.seq,
        }
    }

    /// Deterministic hash of the entry content: the tombstone bit plus the
    /// value bytes, domain-separated so an empty value and a tombstone can
    /// never collide.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        match &self.value {
            Some(v) => {
                hasher.update([0u8]);
                hasher.update(v.as_bytes());
            }
            None => {
                hasher.update([1u8]);
            }
        }
        hasher.finalize().into()
    }
}

/// Bound a timestamp at `now + max_future_skew_ms`. Timestamps at or below
/// the bound pass through untouched; the result never moves below the
/// bound itself.
pub fn clamp_timestamp(timestamp_ms: i64, now_ms: i64, max_future_skew_ms: i64) -> i64 {
    let bound = now_ms.saturating_add(max_future_skew_ms);
    timestamp_ms.min(bound)
}

/// Outcome of comparing an incoming entry against the existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LwwOutcome {
    /// The incoming entry is newer and should replace the existing state.
    RemoteWins,

    /// The existing entry is newer; the incoming one is stale.
    LocalWins,

    /// Same compare key, same content: the same write seen again.
    Duplicate,

    /// Same compare key, different content. The existing entry is kept and
    /// the anomaly is reported.
    Conflict,
}

/// Skew-tolerant LWW resolver.
#[derive(Debug, Clone, Copy)]
pub struct LwwResolver {
    max_future_skew_ms: i64,
}

impl LwwResolver {
    pub fn new(max_future_skew_ms: i64) -> Self {
        Self { max_future_skew_ms }
    }

    /// The local compare key of an entry at a given instant.
    fn compare_key<'a>(&self, entry: &'a StorageEntry, now_ms: i64) -> (i64, &'a str) {
        (
            clamp_timestamp(entry.timestamp_ms, now_ms, self.max_future_skew_ms),
            entry.node_id.as_str(),
        )
    }

    /// Does `a` win over `b` at instant `now_ms`? Strict: equal compare
    /// keys mean neither wins.
    pub fn wins_over(&self, a: &StorageEntry, b: &StorageEntry, now_ms: i64) -> bool {
        self.compare_key(a, now_ms) > self.compare_key(b, now_ms)
    }

    /// Resolve an incoming entry against the existing one, if any.
    pub fn resolve(
        &self,
        existing: Option<&StorageEntry>,
        incoming: &StorageEntry,
        now_ms: i64,
    ) -> LwwOutcome {
        let Some(existing) = existing else {
            return LwwOutcome::RemoteWins;
        };
        let existing_key = self.compare_key(existing, now_ms);
        let incoming_key = self.compare_key(incoming, now_ms);
        if incoming_key > existing_key {
            LwwOutcome::RemoteWins
        } else if incoming_key < existing_key {
            LwwOutcome::LocalWins
        } else if existing.content_hash() == incoming.content_hash() {
            LwwOutcome::Duplicate
        } else {
            LwwOutcome::Conflict
        }
    }
}
