//! # Command Correlator
//!
//! Client-side counterpart of the command processor for dispatching
//! commands over the async transport. Each command gets a request id
//! (assigned UUIDv4 when the caller didn't provide one), is published on
//! `{prefix}/{clientId}/cmd`, and resolves when the matching response
//! arrives on `{prefix}/{clientId}/res` or the timeout window closes.
//!
//! Three layers of duplicate handling:
//! - concurrent sends with the same id coalesce onto one in-flight
//!   request (a single publish, every caller gets the response);
//! - a reply-dedup cache answers repeated sends of an already-completed id
//!   with the cached response, tagged `IdempotentReplay`;
//! - responses that arrive after their request timed out are cached
//!   rather than dropped, so the caller's retry becomes a cache hit.
//!
//! A timeout completes the waiting caller with `Timeout` but does not
//! cancel the underlying publish; the server may still execute the
//! command, which is exactly why its response is worth caching late.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::{Uuid, Version};

use crate::command::{CommandRequest, Response, Status};
use crate::config::TimeoutConfig;
use crate::error::CommandError;
use crate::metrics::Metrics;
use crate::processor::IdempotencyCache;
use crate::transport::Transport;

/// Request ids longer than this are rejected outright.
const MAX_REQUEST_ID_LEN: usize = 64;

/// Client-side request/response correlation over the pub/sub transport.
pub struct CommandCorrelator {
    transport: Arc<dyn Transport>,
    cmd_topic: String,
    res_topic: String,
    timeouts: TimeoutConfig,
    max_payload_bytes: usize,
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<Response>>>>,
    replies: Mutex<IdempotencyCache>,
    metrics: Arc<Metrics>,
}

impl CommandCorrelator {
    pub fn new(
        transport: Arc<dyn Transport>,
        topic_prefix: &str,
        client_id: &str,
        timeouts: TimeoutConfig,
        max_payload_bytes: usize,
        reply_cache: IdempotencyCache,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            transport,
            cmd_topic: format!("{}/{}/cmd", topic_prefix, client_id),
            res_topic: format!("{}/{}/res", topic_prefix, client_id),
            timeouts,
            max_payload_bytes,
            pending: Mutex::new(HashMap::new()),
            replies: Mutex::new(reply_cache),
            metrics,
        }
    }

    /// Subscribe to the response topic and route replies until the
    /// transport goes away.
    pub async fn start(self: Arc<Self>) -> Result<tokio::task::JoinHandle<()>, CommandError> {
        let mut rx = self
            .transport
            .subscribe(&self.res_topic)
            .await
            .map_err(|e| CommandError::internal(e.to_string()))?;
        let correlator = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                correlator.on_response(&message.payload);
            }
        }))
    }

    /// Dispatch a command and wait for its response.
    pub async fn send(&self, mut command: CommandRequest) -> Result<Response, CommandError> {
        if command.id.is_empty() {
            command.id = Uuid::new_v4().to_string();
        } else {
            Self::validate_id(&command.id)?;
        }
        let id = command.id.clone();

        let payload = serde_json::to_vec(&command)
            .map_err(|e| CommandError::invalid(format!("unserializable command: {}", e)))?;
        if payload.len() > self.max_payload_bytes {
            return Err(CommandError::PayloadTooLarge {
                actual: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        let timeout = self.timeout_for(&command);
        let (tx, rx) = oneshot::channel();
        let is_first = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get_mut(&id) {
                Some(waiters) => {
                    // Same id already in flight: piggyback on it.
                    waiters.push(tx);
                    false
                }
                None => {
                    // Completed earlier? Serve the cached reply.
                    let cached = self
                        .replies
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .get(&id);
                    if let Some(response) = cached {
                        self.metrics.incr(&self.metrics.replayed_replies);
                        debug!("correlator: replaying cached reply for {}", id);
                        return Ok(response.tagged_replay());
                    }
                    pending.insert(id.clone(), vec![tx]);
                    true
                }
            }
        };

        if is_first {
            self.metrics.incr(&self.metrics.requests_sent);
            if let Err(e) = self.transport.publish(&self.cmd_topic, payload).await {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                return Err(CommandError::internal(format!("publish failed: {}", e)));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: another waiter's timeout tore the entry down.
            Ok(Err(_)) => Err(CommandError::Timeout(timeout)),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                self.metrics.incr(&self.metrics.request_timeouts);
                warn!("correlator: request {} timed out after {:?}", id, timeout);
                Err(CommandError::Timeout(timeout))
            }
        }
    }

    /// Route one raw reply payload. Malformed replies are counted and
    /// dropped; replies nobody is waiting for are cached for later.
    pub fn on_response(&self, payload: &[u8]) {
        let response = match Response::parse(payload) {
            Ok(r) => r,
            Err(e) => {
                self.metrics.incr(&self.metrics.malformed_replies);
                warn!("correlator: dropping malformed reply: {}", e);
                return;
            }
        };
        self.metrics.incr(&self.metrics.responses_received);

        let waiters = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&response.id);

        if response.status == Status::Ok {
            self.replies
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .put(response.id.clone(), response.clone());
        }

        match waiters {
            Some(waiters) => {
                for tx in waiters {
                    let _ = tx.send(response.clone());
                }
            }
            None => {
                debug!("correlator: reply for {} arrived late, cached", response.id);
            }
        }
    }

    fn timeout_for(&self, command: &CommandRequest) -> Duration {
        if command.op.is_multi_key() {
            Duration::from_millis(self.timeouts.multi_key_ms)
        } else {
            Duration::from_millis(self.timeouts.single_key_ms)
        }
    }

    /// Ids must be 1..=64 bytes; ids shaped like a UUID (36 bytes) must be
    /// a canonical v4.
    fn validate_id(id: &str) -> Result<(), CommandError> {
        if id.len() > MAX_REQUEST_ID_LEN {
            return Err(CommandError::invalid(format!(
                "request id is {} bytes (limit {})",
                id.len(),
                MAX_REQUEST_ID_LEN
            )));
        }
        if id.len() == 36 {
            let parsed = Uuid::try_parse(id)
                .map_err(|_| CommandError::invalid("request id is not a canonical UUID"))?;
            if parsed.get_version() != Some(Version::Random) {
                return Err(CommandError::invalid("request id must be a UUIDv4"));
            }
        }
        Ok(())
    }
}
