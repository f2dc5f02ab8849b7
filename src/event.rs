//! # Replication Events and the Wire Codec
//!
//! Every local write produces a `ReplicationEvent` that is published over
//! MQTT and applied idempotently by remote nodes. The wire format is
//! canonical CBOR: a definite-length map whose keys appear in the fixed
//! order `key, node_id, seq, timestamp_ms, tombstone, value`, with the
//! smallest integer encodings and no floats. Two field-wise equal events
//! therefore encode to byte-identical output, which is what lets Merkle
//! leaf hashes match across implementations and lets consumers
//! content-compare events.
//!
//! For deletions the `value` key is omitted entirely (not encoded as null),
//! so a tombstone's encoding carries exactly five keys.
//!
//! On the transport the CBOR bytes are wrapped in standard base64, the
//! interop-compatible payload form for the replication topic.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// On-the-wire projection of a write.
///
/// Field declaration order is load-bearing: it fixes the canonical CBOR key
/// order. Do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationEvent {
    /// Key under mutation.
    pub key: String,

    /// Originating node identity.
    pub node_id: String,

    /// Originator sequence number; `(node_id, seq)` uniquely identifies
    /// this write attempt.
    pub seq: u64,

    /// Authoring wall clock in milliseconds. Carried unclamped on the wire;
    /// receivers clamp for comparison and storage only.
    pub timestamp_ms: i64,

    /// Whether this event deletes the key.
    pub tombstone: bool,

    /// Resulting value; omitted from the encoding when `tombstone`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ReplicationEvent {
    /// Build a value-carrying event.
    pub fn value(
        key: impl Into<String>,
        node_id: impl Into<String>,
        seq: u64,
        timestamp_ms: i64,
        value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            node_id: node_id.into(),
            seq,
            timestamp_ms,
            tombstone: false,
            value: Some(value.into()),
        }
    }

    /// Build a tombstone event.
    pub fn tombstone(
        key: impl Into<String>,
        node_id: impl Into<String>,
        seq: u64,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            key: key.into(),
            node_id: node_id.into(),
            seq,
            timestamp_ms,
            tombstone: true,
            value: None,
        }
    }

    /// Structural consistency: the tombstone flag and the presence of a
    /// value must agree.
    pub fn is_consistent(&self) -> bool {
        self.tombstone == self.value.is_none()
    }

    /// Full field validation against the configured limits. Used by the
    /// applicator before any other inbound step.
    pub fn validate(&self, max_key_bytes: usize, max_value_bytes: usize) -> Result<(), String> {
        if self.key.is_empty() {
            return Err("empty key".to_string());
        }
        if self.key.len() > max_key_bytes {
            return Err(format!(
                "key is {} bytes (limit {})",
                self.key.len(),
                max_key_bytes
            ));
        }
        if let Some(value) = &self.value {
            if value.len() > max_value_bytes {
                return Err(format!(
                    "value is {} bytes (limit {})",
                    value.len(),
                    max_value_bytes
                ));
            }
        }
        if !self.is_consistent() {
            return Err("tombstone flag contradicts value presence".to_string());
        }
        if self.timestamp_ms <= 0 {
            return Err(format!("non-positive timestamp: {}", self.timestamp_ms));
        }
        if self.node_id.is_empty() {
            return Err("empty node_id".to_string());
        }
        Ok(())
    }
}

/// Deterministic binary codec for replication events.
///
/// Encoding and decoding both enforce the payload size cap so oversize
/// events can neither be produced nor accepted.
#[derive(Debug, Clone)]
pub struct EventCodec {
    max_payload_bytes: usize,
}

impl EventCodec {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    /// Encode to canonical CBOR bytes.
    pub fn encode(&self, event: &ReplicationEvent) -> Result<Vec<u8>, CodecError> {
        if !event.is_consistent() {
            return Err(CodecError::InvalidPayload(
                "tombstone flag contradicts value presence".to_string(),
            ));
        }
        let bytes = serde_cbor::to_vec(event)
            .map_err(|e| CodecError::InvalidPayload(format!("cbor encode: {}", e)))?;
        if bytes.len() > self.max_payload_bytes {
            return Err(CodecError::PayloadTooLarge {
                actual: bytes.len(),
                limit: self.max_payload_bytes,
            });
        }
        Ok(bytes)
    }

    /// Decode CBOR bytes, enforcing the size cap, map shape, field types,
    /// and tombstone/value consistency.
    pub fn decode(&self, bytes: &[u8]) -> Result<ReplicationEvent, CodecError> {
        if bytes.len() > self.max_payload_bytes {
            return Err(CodecError::PayloadTooLarge {
                actual: bytes.len(),
                limit: self.max_payload_bytes,
            });
        }
        let event: ReplicationEvent = serde_cbor::from_slice(bytes)
            .map_err(|e| CodecError::InvalidPayload(format!("cbor decode: {}", e)))?;
        if !event.is_consistent() {
            return Err(CodecError::InvalidPayload(
                "tombstone flag contradicts value presence".to_string(),
            ));
        }
        Ok(event)
    }

    /// Encode for the MQTT payload: canonical CBOR wrapped in base64.
    pub fn encode_transport(&self, event: &ReplicationEvent) -> Result<Vec<u8>, CodecError> {
        let cbor = self.encode(event)?;
        Ok(BASE64.encode(cbor).into_bytes())
    }

    /// Decode an MQTT payload: base64 unwrap, then CBOR decode.
    pub fn decode_transport(&self, payload: &[u8]) -> Result<ReplicationEvent, CodecError> {
        let cbor = BASE64
            .decode(payload)
            .map_err(|e| CodecError::InvalidPayload(format!("base64: {}", e)))?;
        self.decode(&cbor)
    }
}
