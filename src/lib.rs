//! # MerkleKV: Replication and Command Core
//!
//! A distributed key-value store whose nodes exchange changes over MQTT
//! and converge via Last-Write-Wins using per-node version vectors. This
//! crate implements the replication and command core:
//!
//! - **Command processing** with request-scoped idempotency (`processor`)
//! - **Version assignment** from a durable monotonic clock (`clock`)
//! - **Outbound replication** with offline buffering and at-least-once
//!   delivery (`publisher`, `outbox`)
//! - **Inbound application** with deduplication, timestamp clamping, and
//!   LWW conflict resolution (`applicator`, `dedup`, `store::entry`)
//! - **Deterministic wire format** for events: canonical CBOR over base64
//!   (`event`)
//!
//! The transport (`transport`), storage backends (`store`), and metrics
//! (`metrics`) are injected collaborators; `node` wires everything into a
//! running instance and `correlator`/`retry` form the client side.

pub mod applicator;
pub mod clock;
pub mod command;
pub mod config;
pub mod correlator;
pub mod dedup;
pub mod error;
pub mod event;
pub mod metrics;
pub mod node;
pub mod outbox;
pub mod processor;
pub mod publisher;
pub mod retry;
pub mod store;
pub mod transport;

pub use applicator::{ApplicationOutcome, ApplicationResult, EventApplicator, RejectReason};
pub use clock::VersionClock;
pub use command::{CommandRequest, KeyResult, Operation, Response, Status};
pub use config::Config;
pub use correlator::CommandCorrelator;
pub use dedup::DedupTracker;
pub use error::{CodecError, CommandError, ErrorCode, TransportError};
pub use event::{EventCodec, ReplicationEvent};
pub use metrics::Metrics;
pub use node::Node;
pub use outbox::OutboxQueue;
pub use processor::{CommandProcessor, IdempotencyCache};
pub use publisher::EventPublisher;
pub use retry::RetryPolicy;
pub use store::{LwwOutcome, LwwResolver, MemoryEngine, SledEngine, Storage, StorageEntry};
pub use transport::{ConnectionState, InboundMessage, MqttTransport, Transport};
