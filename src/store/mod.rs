//! # Storage Module
//!
//! - **`entry`**: the per-key record (`StorageEntry`) and LWW resolution
//! - **`kv_trait`**: the backend interface consumed by the replication core
//! - **`memory_engine`**: in-memory backend over `RwLock<HashMap>`
//! - **`sled_engine`**: persistent backend over sled
//!
//! Backends are modular and replaceable; everything above this layer holds
//! a `Arc<dyn Storage>` and never cares which engine is underneath.

pub mod entry;
pub mod kv_trait;
pub mod memory_engine;
pub mod sled_engine;

pub use entry::{clamp_timestamp, now_ms, LwwOutcome, LwwResolver, StorageEntry};
pub use kv_trait::Storage;
pub use memory_engine::MemoryEngine;
pub use sled_engine::SledEngine;
