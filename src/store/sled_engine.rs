//! Persistent storage backend over sled. Entries are bincode-encoded;
//! tombstones live in the tree like any other entry until the sweeper
//! purges them.

use anyhow::Result;
use sled::{Db, Tree};

use super::entry::StorageEntry;
use super::kv_trait::Storage;

pub struct SledEngine {
    _db: Db,
    tree: Tree,
}

impl SledEngine {
    pub fn new(storage_path: &str) -> Result<Self> {
        let db = sled::open(storage_path)?;
        let tree = db.open_tree(b"merklekv_entries")?;
        Ok(Self { _db: db, tree })
    }

    fn decode(bytes: &[u8]) -> Option<StorageEntry> {
        bincode::deserialize(bytes).ok()
    }
}

impl Storage for SledEngine {
    fn get(&self, key: &str) -> Option<StorageEntry> {
        match self.tree.get(key) {
            Ok(Some(ivec)) => Self::decode(&ivec),
            _ => None,
        }
    }

    fn put(&self, entry: StorageEntry) -> Result<()> {
        let bytes = bincode::serialize(&entry)?;
        self.tree.insert(entry.key.as_bytes(), bytes)?;
        Ok(())
    }

    fn delete(&self, key: &str, timestamp_ms: i64, node_id: &str, seq: u64) -> Result<()> {
        self.put(StorageEntry::tombstone(key, timestamp_ms, node_id, seq))
    }

    fn keys(&self) -> Vec<String> {
        self.tree
            .iter()
            .keys()
            .filter_map(|r| r.ok())
            .filter_map(|k| String::from_utf8(k.to_vec()).ok())
            .collect()
    }

    fn len(&self) -> usize {
        self.tree.len()
    }

    fn purge(&self, key: &str) -> bool {
        match self.tree.remove(key) {
            Ok(opt) => opt.is_some(),
            Err(_) => false,
        }
    }

    fn sync(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }
}
