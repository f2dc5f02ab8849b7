//! # Command Processor
//!
//! Executes client commands against local storage and turns every
//! successful write into an outbound replication event. This is where
//! version assignment happens: each write takes `seq = clock.next()` and
//! `timestamp_ms = now()` and commits to storage *before* the publisher is
//! invoked, so a crash between the two can leave an unpublished local
//! write (repaired later by anti-entropy) but never a published event
//! that local storage doesn't have.
//!
//! Requests carrying a non-empty `id` are idempotent: the response is
//! cached for ten minutes and an identical `id` inside that window gets
//! the cached response back verbatim, without re-executing anything. The
//! cache is consulted before any side effect.
//!
//! All size limits are enforced before the first storage mutation; a bulk
//! command that exceeds the total payload cap performs no writes at all.

use log::warn;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::VersionClock;
use crate::command::{CommandRequest, KeyResult, Operation, Response, Status};
use crate::config::LimitsConfig;
use crate::error::CommandError;
use crate::metrics::Metrics;
use crate::publisher::EventPublisher;
use crate::store::{now_ms, Storage, StorageEntry};

/// Inclusive bound on the magnitude of INCR/DECR amounts.
const MAX_NUMERIC_AMOUNT: i64 = 9_000_000_000_000_000;

struct CachedResponse {
    response: Response,
    expires_at: Instant,
}

/// LRU + TTL cache of responses keyed by request id.
pub struct IdempotencyCache {
    entries: LruCache<String, CachedResponse>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Fetch a live cached response, promoting it to most recently used.
    /// Expired entries are dropped on the way out.
    pub fn get(&mut self, id: &str) -> Option<Response> {
        match self.entries.get(id) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.response.clone()),
            Some(_) => {
                self.entries.pop(id);
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, id: String, response: Response) {
        self.entries.push(
            id,
            CachedResponse {
                response,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Executes client commands and generates outbound events.
pub struct CommandProcessor {
    node_id: String,
    limits: LimitsConfig,
    storage: Arc<dyn Storage>,
    clock: Arc<VersionClock>,
    publisher: Arc<EventPublisher>,
    cache: Mutex<IdempotencyCache>,
    metrics: Arc<Metrics>,
}

impl CommandProcessor {
    pub fn new(
        node_id: String,
        limits: LimitsConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<VersionClock>,
        publisher: Arc<EventPublisher>,
        cache: IdempotencyCache,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id,
            limits,
            storage,
            clock,
            publisher,
            cache: Mutex::new(cache),
            metrics,
        }
    }

    /// Process one command. `payload_len` is the size of the raw request
    /// payload as received, checked against the total payload cap.
    pub async fn process(&self, request: CommandRequest, payload_len: usize) -> Response {
        self.metrics.incr(&self.metrics.commands_processed);
        self.count_op(request.op);

        if payload_len > self.limits.max_bulk_payload_bytes {
            let err = CommandError::PayloadTooLarge {
                actual: payload_len,
                limit: self.limits.max_bulk_payload_bytes,
            };
            self.metrics.incr(&self.metrics.command_errors);
            return Response::error(&request.id, &err);
        }

        // Idempotency lookup happens before any side effect.
        if !request.id.is_empty() {
            let cached = self
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&request.id);
            if let Some(response) = cached {
                self.metrics.incr(&self.metrics.idempotent_hits);
                return response;
            }
        }

        let response = match self.execute(&request).await {
            Ok(response) => response,
            Err(err) => {
                self.metrics.incr(&self.metrics.command_errors);
                Response::error(&request.id, &err)
            }
        };

        // Only successes are cached; a failed command retried under the
        // same id deserves a fresh execution.
        if !request.id.is_empty() && response.status == Status::Ok {
            self.cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .put(request.id.clone(), response.clone());
        }
        response
    }

    async fn execute(&self, request: &CommandRequest) -> Result<Response, CommandError> {
        match request.op {
            Operation::Get => self.do_get(request),
            Operation::Set => self.do_set(request).await,
            Operation::Del => self.do_del(request).await,
            Operation::Incr => self.do_numeric(request, false).await,
            Operation::Decr => self.do_numeric(request, true).await,
            Operation::Append => self.do_concat(request, false).await,
            Operation::Prepend => self.do_concat(request, true).await,
            Operation::Mget => self.do_mget(request),
            Operation::Mset => self.do_mset(request).await,
        }
    }

    fn do_get(&self, request: &CommandRequest) -> Result<Response, CommandError> {
        let key = self.require_key(request)?;
        match self.storage.get(key) {
            Some(entry) if !entry.is_tombstone() => {
                let value = entry.value.unwrap_or_default();
                Ok(Response::ok_value(&request.id, value))
            }
            _ => Err(CommandError::NotFound),
        }
    }

    async fn do_set(&self, request: &CommandRequest) -> Result<Response, CommandError> {
        let key = self.require_key(request)?.to_string();
        let value = self.require_value(request)?.to_string();
        self.commit_write(&key, Some(value)).await?;
        Ok(Response::ok(&request.id))
    }

    async fn do_del(&self, request: &CommandRequest) -> Result<Response, CommandError> {
        let key = self.require_key(request)?.to_string();
        self.commit_write(&key, None).await?;
        Ok(Response::ok(&request.id))
    }

    async fn do_numeric(
        &self,
        request: &CommandRequest,
        negate: bool,
    ) -> Result<Response, CommandError> {
        let key = self.require_key(request)?.to_string();
        let amount = request.amount.unwrap_or(1);
        if amount == 0 {
            return Err(CommandError::invalid("amount must not be zero"));
        }
        if !(-MAX_NUMERIC_AMOUNT..=MAX_NUMERIC_AMOUNT).contains(&amount) {
            return Err(CommandError::invalid(format!(
                "amount out of range: {}",
                amount
            )));
        }

        // Missing and tombstoned keys count from zero.
        let current = match self.storage.get(&key) {
            Some(entry) if !entry.is_tombstone() => entry
                .value
                .as_deref()
                .unwrap_or("0")
                .parse::<i64>()
                .map_err(|_| CommandError::InvalidType)?,
            _ => 0,
        };

        let delta = if negate { amount.checked_neg() } else { Some(amount) };
        let result = delta
            .and_then(|d| current.checked_add(d))
            .ok_or(CommandError::RangeOverflow)?;

        // i64 formatting is already canonical decimal: no leading zeros,
        // minus sign only when negative.
        let stored = result.to_string();
        self.commit_write(&key, Some(stored.clone())).await?;
        Ok(Response::ok_value(&request.id, stored))
    }

    async fn do_concat(
        &self,
        request: &CommandRequest,
        prepend: bool,
    ) -> Result<Response, CommandError> {
        let key = self.require_key(request)?.to_string();
        let addition = self.require_value(request)?.to_string();

        // Missing and tombstoned keys concatenate against the empty string.
        let base = match self.storage.get(&key) {
            Some(entry) if !entry.is_tombstone() => entry.value.unwrap_or_default(),
            _ => String::new(),
        };
        let combined = if prepend {
            format!("{}{}", addition, base)
        } else {
            format!("{}{}", base, addition)
        };
        if combined.len() > self.limits.max_value_bytes {
            return Err(CommandError::PayloadTooLarge {
                actual: combined.len(),
                limit: self.limits.max_value_bytes,
            });
        }
        self.commit_write(&key, Some(combined.clone())).await?;
        Ok(Response::ok_value(&request.id, combined))
    }

    fn do_mget(&self, request: &CommandRequest) -> Result<Response, CommandError> {
        let keys = request
            .keys
            .as_ref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CommandError::invalid("MGET requires keys"))?;

        let total: usize = keys.iter().map(|k| k.len()).sum();
        if total > self.limits.max_bulk_payload_bytes {
            return Err(CommandError::PayloadTooLarge {
                actual: total,
                limit: self.limits.max_bulk_payload_bytes,
            });
        }

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            if let Err(e) = self.check_key(key) {
                results.push(KeyResult::err(key, &e));
                continue;
            }
            match self.storage.get(key) {
                Some(entry) if !entry.is_tombstone() => {
                    results.push(KeyResult::ok(key, entry.value));
                }
                _ => results.push(KeyResult::err(key, &CommandError::NotFound)),
            }
        }
        Ok(Response::ok_results(&request.id, results))
    }

    async fn do_mset(&self, request: &CommandRequest) -> Result<Response, CommandError> {
        let pairs = request
            .key_values
            .as_ref()
            .filter(|kv| !kv.is_empty())
            .ok_or_else(|| CommandError::invalid("MSET requires keyValues"))?;

        // Total cap before any mutation: a too-large bulk write must not
        // partially apply.
        let mut total = 0usize;
        for (key, value) in pairs.iter() {
            total += key.len();
            if let Some(s) = value.as_str() {
                total += s.len();
            }
        }
        if total > self.limits.max_bulk_payload_bytes {
            return Err(CommandError::PayloadTooLarge {
                actual: total,
                limit: self.limits.max_bulk_payload_bytes,
            });
        }

        let mut results = Vec::with_capacity(pairs.len());
        for (key, raw) in pairs.iter() {
            let Some(value) = raw.as_str() else {
                results.push(KeyResult::err(
                    key,
                    &CommandError::invalid("value must be a string"),
                ));
                continue;
            };
            let outcome = async {
                self.check_key(key)?;
                self.check_value(value)?;
                self.commit_write(key, Some(value.to_string())).await
            }
            .await;
            match outcome {
                Ok(()) => results.push(KeyResult::ok(key, None)),
                Err(e) => results.push(KeyResult::err(key, &e)),
            }
        }
        Ok(Response::ok_results(&request.id, results))
    }

    /// Stamp, commit, publish. Storage commit strictly precedes event
    /// generation.
    async fn commit_write(&self, key: &str, value: Option<String>) -> Result<(), CommandError> {
        let seq = self.clock.next();
        let timestamp_ms = now_ms();

        let entry = match value {
            Some(v) => StorageEntry::value(key, v, timestamp_ms, &self.node_id, seq),
            None => StorageEntry::tombstone(key, timestamp_ms, &self.node_id, seq),
        };

        if entry.is_tombstone() {
            self.storage
                .delete(key, timestamp_ms, &self.node_id, seq)
                .map_err(|e| CommandError::internal(e.to_string()))?;
        } else {
            self.storage
                .put(entry.clone())
                .map_err(|e| CommandError::internal(e.to_string()))?;
        }

        // Transport trouble is the publisher's business (it buffers); the
        // command has already succeeded locally.
        if let Err(e) = self.publisher.publish(entry.to_event()).await {
            warn!("processor: event for {} not publishable: {}", key, e);
        }
        Ok(())
    }

    fn require_key<'a>(&self, request: &'a CommandRequest) -> Result<&'a str, CommandError> {
        let key = request
            .key
            .as_deref()
            .ok_or_else(|| CommandError::invalid("missing key"))?;
        self.check_key(key)?;
        Ok(key)
    }

    fn require_value<'a>(&self, request: &'a CommandRequest) -> Result<&'a str, CommandError> {
        let value = request
            .value
            .as_deref()
            .ok_or_else(|| CommandError::invalid("missing value"))?;
        self.check_value(value)?;
        Ok(value)
    }

    fn check_key(&self, key: &str) -> Result<(), CommandError> {
        if key.is_empty() {
            return Err(CommandError::invalid("empty key"));
        }
        if key.len() > self.limits.max_key_bytes {
            return Err(CommandError::PayloadTooLarge {
                actual: key.len(),
                limit: self.limits.max_key_bytes,
            });
        }
        Ok(())
    }

    fn check_value(&self, value: &str) -> Result<(), CommandError> {
        if value.len() > self.limits.max_value_bytes {
            return Err(CommandError::PayloadTooLarge {
                actual: value.len(),
                limit: self.limits.max_value_bytes,
            });
        }
        Ok(())
    }

    fn count_op(&self, op: Operation) {
        let counter = match op {
            Operation::Get => &self.metrics.get_commands,
            Operation::Set => &self.metrics.set_commands,
            Operation::Del => &self.metrics.delete_commands,
            Operation::Incr | Operation::Decr => &self.metrics.numeric_commands,
            Operation::Append | Operation::Prepend => &self.metrics.string_commands,
            Operation::Mget | Operation::Mset => &self.metrics.bulk_commands,
        };
        self.metrics.incr(counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Status;
    use crate::error::ErrorCode;
    use crate::event::EventCodec;
    use crate::outbox::OutboxQueue;
    use crate::store::MemoryEngine;
    use crate::transport::testing::MemoryTransport;
    use std::sync::atomic::Ordering;

    struct Fixture {
        processor: CommandProcessor,
        storage: Arc<MemoryEngine>,
        transport: Arc<MemoryTransport>,
        metrics: Arc<Metrics>,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(Metrics::new());
        let storage = Arc::new(MemoryEngine::new());
        let transport = MemoryTransport::new();
        let outbox = Arc::new(OutboxQueue::ephemeral(100, metrics.clone()));
        let publisher = Arc::new(EventPublisher::new(
            transport.clone(),
            outbox,
            EventCodec::new(307_200),
            "merkle_kv/replication/events".to_string(),
            100,
            metrics.clone(),
        ));
        let processor = CommandProcessor::new(
            "node-a".to_string(),
            LimitsConfig::default(),
            storage.clone(),
            Arc::new(VersionClock::ephemeral(metrics.clone())),
            publisher,
            IdempotencyCache::new(1000, Duration::from_secs(600)),
            metrics.clone(),
        );
        Fixture {
            processor,
            storage,
            transport,
            metrics,
        }
    }

    async fn run(f: &Fixture, request: CommandRequest) -> Response {
        let len = serde_json::to_vec(&request).map(|b| b.len()).unwrap_or(0);
        f.processor.process(request, len).await
    }

    fn with_id(mut request: CommandRequest, id: &str) -> CommandRequest {
        request.id = id.to_string();
        request
    }

    async fn published_events(f: &Fixture) -> Vec<crate::event::ReplicationEvent> {
        let codec = EventCodec::new(307_200);
        f.transport
            .published()
            .await
            .iter()
            .map(|(_, payload)| codec.decode_transport(payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let f = fixture();
        let response = run(&f, with_id(CommandRequest::set("k", "v"), "r1")).await;
        assert_eq!(response.status, Status::Ok);

        let response = run(&f, with_id(CommandRequest::get("k"), "r2")).await;
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.value.as_deref(), Some("v"));

        // The stored entry carries this node's version stamp.
        let entry = f.storage.get("k").unwrap();
        assert_eq!(entry.node_id, "node-a");
        assert_eq!(entry.seq, 1);

        // And the event mirrors the entry.
        let events = published_events(&f).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[0].value.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn get_missing_and_tombstoned_is_not_found() {
        let f = fixture();
        let response = run(&f, CommandRequest::get("ghost")).await;
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error_code, Some(ErrorCode::NotFound));

        run(&f, CommandRequest::set("k", "v")).await;
        run(&f, CommandRequest::del("k")).await;
        let response = run(&f, CommandRequest::get("k")).await;
        assert_eq!(response.error_code, Some(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn del_produces_tombstone_event() {
        let f = fixture();
        run(&f, CommandRequest::set("k", "v")).await;
        run(&f, CommandRequest::del("k")).await;

        let entry = f.storage.get("k").unwrap();
        assert!(entry.is_tombstone());
        assert_eq!(entry.seq, 2);

        let events = published_events(&f).await;
        assert!(events[1].tombstone);
        assert!(events[1].value.is_none());
    }

    #[tokio::test]
    async fn incr_on_missing_key_counts_from_zero() {
        let f = fixture();
        let response = run(&f, CommandRequest::incr("counter", 5)).await;
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.value.as_deref(), Some("5"));
        assert_eq!(
            f.storage.get("counter").unwrap().value.as_deref(),
            Some("5")
        );
        let events = published_events(&f).await;
        assert_eq!(events[0].value.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn decr_and_canonical_negative_form() {
        let f = fixture();
        run(&f, CommandRequest::set("n", "3")).await;
        let response = run(&f, CommandRequest::decr("n", 10)).await;
        assert_eq!(response.value.as_deref(), Some("-7"));
    }

    #[tokio::test]
    async fn numeric_on_non_integer_is_invalid_type() {
        let f = fixture();
        run(&f, CommandRequest::set("k", "not-a-number")).await;
        let response = run(&f, CommandRequest::incr("k", 1)).await;
        assert_eq!(response.error_code, Some(ErrorCode::InvalidType));
    }

    #[tokio::test]
    async fn numeric_overflow_is_range_overflow() {
        let f = fixture();
        run(&f, CommandRequest::set("k", i64::MAX.to_string())).await;
        let response = run(&f, CommandRequest::incr("k", 1)).await;
        assert_eq!(response.error_code, Some(ErrorCode::RangeOverflow));
        // Value untouched.
        assert_eq!(
            f.storage.get("k").unwrap().value.as_deref(),
            Some(i64::MAX.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn numeric_amount_bounds_enforced() {
        let f = fixture();
        let response = run(&f, CommandRequest::incr("k", 0)).await;
        assert_eq!(response.error_code, Some(ErrorCode::InvalidRequest));

        let response = run(&f, CommandRequest::incr("k", MAX_NUMERIC_AMOUNT + 1)).await;
        assert_eq!(response.error_code, Some(ErrorCode::InvalidRequest));

        let response = run(&f, CommandRequest::decr("k", -(MAX_NUMERIC_AMOUNT + 1))).await;
        assert_eq!(response.error_code, Some(ErrorCode::InvalidRequest));

        let response = run(&f, CommandRequest::incr("k", MAX_NUMERIC_AMOUNT)).await;
        assert_eq!(response.status, Status::Ok);
    }

    #[tokio::test]
    async fn append_prepend_treat_missing_as_empty() {
        let f = fixture();
        let response = run(&f, CommandRequest::append("s", "tail")).await;
        assert_eq!(response.value.as_deref(), Some("tail"));

        let response = run(&f, CommandRequest::prepend("s", "head-")).await;
        assert_eq!(response.value.as_deref(), Some("head-tail"));

        run(&f, CommandRequest::del("s")).await;
        let response = run(&f, CommandRequest::append("s", "fresh")).await;
        assert_eq!(response.value.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn append_beyond_value_limit_rejected() {
        let f = fixture();
        run(&f, CommandRequest::set("s", "x".repeat(262_000))).await;
        let response = run(&f, CommandRequest::append("s", "y".repeat(200))).await;
        assert_eq!(response.error_code, Some(ErrorCode::PayloadTooLarge));
        // No mutation, no extra event.
        assert_eq!(
            f.storage.get("s").unwrap().value.map(|v| v.len()),
            Some(262_000)
        );
        assert_eq!(published_events(&f).await.len(), 1);
    }

    #[tokio::test]
    async fn oversize_set_rejected_without_side_effects() {
        let f = fixture();
        let response = run(&f, with_id(CommandRequest::set("k", "v".repeat(262_145)), "r1")).await;
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error_code, Some(ErrorCode::PayloadTooLarge));
        assert!(f.storage.get("k").is_none());
        assert!(published_events(&f).await.is_empty());
    }

    #[tokio::test]
    async fn oversize_key_rejected() {
        let f = fixture();
        let response = run(&f, CommandRequest::set("k".repeat(257), "v")).await;
        assert_eq!(response.error_code, Some(ErrorCode::PayloadTooLarge));
    }

    #[tokio::test]
    async fn total_payload_cap_enforced() {
        let f = fixture();
        let request = CommandRequest::set("k", "v");
        let response = f.processor.process(request, 524_289).await;
        assert_eq!(response.error_code, Some(ErrorCode::PayloadTooLarge));
    }

    #[tokio::test]
    async fn idempotent_replay_returns_cached_response_verbatim() {
        let f = fixture();
        let first = run(&f, with_id(CommandRequest::incr("c", 5), "req-7")).await;
        assert_eq!(first.value.as_deref(), Some("5"));

        // Mutate the underlying key; a replay must NOT re-execute.
        run(&f, CommandRequest::incr("c", 5)).await;

        let replay = run(&f, with_id(CommandRequest::incr("c", 5), "req-7")).await;
        assert_eq!(replay, first);
        assert_eq!(replay.to_bytes(), first.to_bytes());
        assert_eq!(f.metrics.idempotent_hits.load(Ordering::Relaxed), 1);
        // Storage reflects exactly two executions.
        assert_eq!(f.storage.get("c").unwrap().value.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn expired_cache_entry_recomputes() {
        let metrics = Arc::new(Metrics::new());
        let storage = Arc::new(MemoryEngine::new());
        let transport = MemoryTransport::new();
        let outbox = Arc::new(OutboxQueue::ephemeral(100, metrics.clone()));
        let publisher = Arc::new(EventPublisher::new(
            transport,
            outbox,
            EventCodec::new(307_200),
            "t".to_string(),
            100,
            metrics.clone(),
        ));
        let processor = CommandProcessor::new(
            "node-a".to_string(),
            LimitsConfig::default(),
            storage,
            Arc::new(VersionClock::ephemeral(metrics.clone())),
            publisher,
            IdempotencyCache::new(1000, Duration::from_millis(5)),
            metrics,
        );

        let request = with_id(CommandRequest::incr("c", 1), "req-1");
        let first = processor.process(request.clone(), 64).await;
        assert_eq!(first.value.as_deref(), Some("1"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = processor.process(request, 64).await;
        assert_eq!(second.value.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn empty_id_is_never_cached() {
        let f = fixture();
        run(&f, CommandRequest::incr("c", 1)).await;
        run(&f, CommandRequest::incr("c", 1)).await;
        assert_eq!(f.storage.get("c").unwrap().value.as_deref(), Some("2"));
        assert_eq!(f.metrics.idempotent_hits.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn mget_returns_per_key_results_in_order() {
        let f = fixture();
        run(&f, CommandRequest::set("a", "1")).await;
        run(&f, CommandRequest::set("c", "3")).await;

        let response = run(
            &f,
            CommandRequest::mget(vec!["a".into(), "missing".into(), "c".into()]),
        )
        .await;
        assert_eq!(response.status, Status::Ok);
        let results = response.results.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].value.as_deref(), Some("1"));
        assert_eq!(results[1].status, Status::Error);
        assert_eq!(results[1].error_code, Some(ErrorCode::NotFound));
        assert_eq!(results[2].value.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn mset_applies_in_order_with_per_key_errors() {
        let f = fixture();
        let mut request = CommandRequest::mset(vec![
            ("x".to_string(), "1".to_string()),
            ("k".repeat(300), "2".to_string()),
            ("z".to_string(), "3".to_string()),
        ]);
        request.id = "bulk-1".to_string();
        let response = run(&f, request).await;
        assert_eq!(response.status, Status::Ok);

        let results = response.results.unwrap();
        assert_eq!(results[0].status, Status::Ok);
        assert_eq!(results[1].status, Status::Error);
        assert_eq!(results[1].error_code, Some(ErrorCode::PayloadTooLarge));
        assert_eq!(results[2].status, Status::Ok);

        // The failing key did not block the later one, and events carry
        // increasing sequence numbers in submission order.
        let events = published_events(&f).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, "x");
        assert_eq!(events[1].key, "z");
        assert!(events[0].seq < events[1].seq);
    }

    #[tokio::test]
    async fn mset_total_cap_blocks_all_writes() {
        let f = fixture();
        // Each value passes the per-value limit; the three together cross
        // the 512 KiB bulk cap.
        let big = "v".repeat(200_000);
        let request = CommandRequest::mset(vec![
            ("a".to_string(), big.clone()),
            ("b".to_string(), big.clone()),
            ("c".to_string(), big),
        ]);
        let response = f.processor.process(request, 1024).await;
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error_code, Some(ErrorCode::PayloadTooLarge));
        assert!(f.storage.get("a").is_none());
        assert!(f.storage.get("b").is_none());
        assert!(f.storage.get("c").is_none());
        assert!(published_events(&f).await.is_empty());
    }

    #[tokio::test]
    async fn storage_failure_surfaces_internal_error() {
        use crate::store::kv_trait::MockStorage;

        let metrics = Arc::new(Metrics::new());
        let mut mock = MockStorage::new();
        mock.expect_get().returning(|_| None);
        mock.expect_put()
            .returning(|_| Err(anyhow::anyhow!("disk on fire")));

        let transport = MemoryTransport::new();
        let outbox = Arc::new(OutboxQueue::ephemeral(100, metrics.clone()));
        let publisher = Arc::new(EventPublisher::new(
            transport,
            outbox,
            EventCodec::new(307_200),
            "t".to_string(),
            100,
            metrics.clone(),
        ));
        let processor = CommandProcessor::new(
            "node-a".to_string(),
            LimitsConfig::default(),
            Arc::new(mock),
            Arc::new(VersionClock::ephemeral(metrics.clone())),
            publisher,
            IdempotencyCache::new(1000, Duration::from_secs(600)),
            metrics,
        );

        let response = processor.process(CommandRequest::set("k", "v"), 64).await;
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error_code, Some(ErrorCode::InternalError));
    }

    #[tokio::test]
    async fn writes_get_strictly_increasing_sequences() {
        let f = fixture();
        for i in 0..5 {
            run(&f, CommandRequest::set(format!("k{}", i), "v")).await;
        }
        let events = published_events(&f).await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }
}
