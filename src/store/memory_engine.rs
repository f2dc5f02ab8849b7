//! # In-Memory Storage Backend
//!
//! Thread-safe in-memory backend using `RwLock<HashMap>`: concurrent
//! readers, one writer at a time, every operation atomic. Nothing survives
//! process exit; select the sled engine for durable state.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::entry::StorageEntry;
use super::kv_trait::Storage;

/// Thread-safe in-memory storage backend.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    data: Arc<RwLock<HashMap<String, StorageEntry>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryEngine {
    fn get(&self, key: &str) -> Option<StorageEntry> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(key).cloned()
    }

    fn put(&self, entry: StorageEntry) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn delete(&self, key: &str, timestamp_ms: i64, node_id: &str, seq: u64) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.insert(
            key.to_string(),
            StorageEntry::tombstone(key, timestamp_ms, node_id, seq),
        );
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.len()
    }

    fn purge(&self, key: &str) -> bool {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.remove(key).is_some()
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
