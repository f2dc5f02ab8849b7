//! # Storage Backend Trait
//!
//! Common interface for the key-value storage backends. The replication
//! core only ever talks to storage through this trait; engines are swapped
//! via configuration without touching the rest of the codebase.
//!
//! Engines store full `StorageEntry` records, tombstones included: a
//! delete is a write of a tombstone entry carrying the deleting write's
//! `(timestamp_ms, node_id, seq)`, so deletes can win LWW races against
//! concurrent writes. Physical removal only happens through `purge`, which
//! the tombstone sweeper calls once a tombstone has aged past retention.

use anyhow::Result;

use super::entry::StorageEntry;

/// Common interface for all storage backends.
///
/// Implementations must be safe to share across tasks (`Send + Sync`) and
/// must make each individual operation atomic.
#[cfg_attr(test, mockall::automock)]
pub trait Storage: Send + Sync {
    /// Retrieve the entry stored at `key`, tombstones included.
    fn get(&self, key: &str) -> Option<StorageEntry>;

    /// Store an entry, replacing whatever was at its key.
    fn put(&self, entry: StorageEntry) -> Result<()>;

    /// Store a tombstone at `key` carrying the deleting write's version.
    fn delete(&self, key: &str, timestamp_ms: i64, node_id: &str, seq: u64) -> Result<()>;

    /// All keys currently present, tombstoned keys included.
    fn keys(&self) -> Vec<String>;

    /// Number of entries, tombstones included.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physically remove an entry. Returns whether anything was removed.
    /// Only the tombstone sweeper should call this.
    fn purge(&self, key: &str) -> bool;

    /// Flush pending changes to durable media. No-op for in-memory engines.
    fn sync(&self) -> Result<()>;
}
