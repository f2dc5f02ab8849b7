//! # Node Wiring
//!
//! Assembles the replication core into a running node: the command surface
//! over MQTT, the inbound replication pipeline, the outbound publisher
//! with its auto-flush, and the periodic maintenance tasks (tombstone
//! sweep, dedup cleanup).
//!
//! ## Topics
//!
//! - `{prefix}/{clientId}/cmd`: commands in (wildcard-subscribed)
//! - `{prefix}/{clientId}/res`: responses out
//! - `{prefix}/replication/events`: replication fanout, shared by the
//!   whole cluster; a node skips events carrying its own `node_id`
//!
//! Event flow is acyclic: command → storage → publisher → outbox →
//! transport on the way out, transport → applicator → storage on the way
//! in. All cross-component state lives in the component that owns it.

use anyhow::Result;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::applicator::EventApplicator;
use crate::clock::VersionClock;
use crate::command::{CommandRequest, Response};
use crate::config::Config;
use crate::dedup::DedupTracker;
use crate::error::CommandError;
use crate::event::EventCodec;
use crate::metrics::Metrics;
use crate::outbox::OutboxQueue;
use crate::processor::{CommandProcessor, IdempotencyCache};
use crate::publisher::EventPublisher;
use crate::store::{now_ms, MemoryEngine, SledEngine, Storage};
use crate::transport::Transport;

/// Open the storage backend named in the configuration.
pub fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match config.engine.as_str() {
        "memory" => Ok(Arc::new(MemoryEngine::new())),
        "sled" => Ok(Arc::new(SledEngine::new(&config.storage_path)?)),
        other => anyhow::bail!("unknown storage engine '{}' (expected memory or sled)", other),
    }
}

/// A fully wired MerkleKV node.
pub struct Node {
    config: Config,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    dedup: Arc<DedupTracker>,
    publisher: Arc<EventPublisher>,
    processor: Arc<CommandProcessor>,
    applicator: Arc<EventApplicator>,
    codec: EventCodec,
    metrics: Arc<Metrics>,
}

impl Node {
    /// Wire the node from its collaborators. The transport and storage
    /// are injected so tests and alternative deployments can swap them.
    pub async fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new());
        let codec = EventCodec::new(config.limits.max_cbor_bytes);

        let clock = if config.persistence_enabled {
            Arc::new(VersionClock::open(config.clock_path(), metrics.clone()))
        } else {
            Arc::new(VersionClock::ephemeral(metrics.clone()))
        };

        let outbox = if config.persistence_enabled {
            Arc::new(OutboxQueue::open(config.outbox_path(), config.outbox.max_size, metrics.clone()).await)
        } else {
            Arc::new(OutboxQueue::ephemeral(config.outbox.max_size, metrics.clone()))
        };

        let dedup = Arc::new(DedupTracker::new(
            config.dedup.window_size,
            config.dedup.max_nodes,
            config.dedup_ttl(),
            metrics.clone(),
        ));

        let publisher = Arc::new(EventPublisher::new(
            transport.clone(),
            outbox,
            codec.clone(),
            config.replication_topic(),
            config.outbox.batch_size,
            metrics.clone(),
        ));

        let processor = Arc::new(CommandProcessor::new(
            config.node_id.clone(),
            config.limits.clone(),
            storage.clone(),
            clock,
            publisher.clone(),
            IdempotencyCache::new(config.idempotency.max_entries, config.idempotency_ttl()),
            metrics.clone(),
        ));

        let applicator = Arc::new(EventApplicator::new(
            storage.clone(),
            dedup.clone(),
            config.replication.max_future_skew_ms,
            config.limits.max_key_bytes,
            config.limits.max_value_bytes,
            metrics.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            transport,
            storage,
            dedup,
            publisher,
            processor,
            applicator,
            codec,
            metrics,
        }))
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn applicator(&self) -> &Arc<EventApplicator> {
        &self.applicator
    }

    /// Execute a command in-process, exactly as if it had arrived over the
    /// command topic.
    pub async fn process(&self, request: CommandRequest) -> Response {
        let len = serde_json::to_vec(&request).map(|b| b.len()).unwrap_or(0);
        self.processor.process(request, len).await
    }

    /// Subscribe and spawn every long-running task. Returns the handles;
    /// aborting them shuts the node down.
    pub async fn start(self: Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        handles.push(Self::spawn_replication_loop(&self).await?);
        handles.push(Self::spawn_command_loop(&self).await?);
        handles.push(self.publisher.clone().spawn_auto_flush());
        handles.push(Self::spawn_tombstone_sweeper(&self));
        handles.push(Self::spawn_dedup_cleanup(&self));
        info!(
            "node {} started (prefix {}, engine {})",
            self.config.node_id, self.config.topic_prefix, self.config.engine
        );
        Ok(handles)
    }

    /// Start and park forever. The binary's entry point.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let _handles = self.clone().start().await?;
        std::future::pending::<()>().await;
        Ok(())
    }

    /// Inbound replication: decode, skip own events, apply. Malformed
    /// payloads are counted and skipped, never fatal.
    async fn spawn_replication_loop(node: &Arc<Self>) -> Result<JoinHandle<()>> {
        let topic = node.config.replication_topic();
        let mut rx = node
            .transport
            .subscribe(&topic)
            .await
            .map_err(|e| anyhow::anyhow!("subscribe {}: {}", topic, e))?;
        let node = node.clone();
        Ok(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let event = match node.codec.decode_transport(&message.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("replication: undecodable event: {}", e);
                        node.metrics.incr(&node.metrics.events_rejected);
                        continue;
                    }
                };
                if event.node_id == node.config.node_id {
                    node.metrics.incr(&node.metrics.events_self_origin);
                    continue;
                }
                node.applicator.apply(event).await;
            }
        }))
    }

    /// Command surface: wildcard-subscribe the cmd topics, respond on the
    /// per-client res topic.
    async fn spawn_command_loop(node: &Arc<Self>) -> Result<JoinHandle<()>> {
        let filter = format!("{}/+/cmd", node.config.topic_prefix);
        let mut rx = node
            .transport
            .subscribe(&filter)
            .await
            .map_err(|e| anyhow::anyhow!("subscribe {}: {}", filter, e))?;
        let node = node.clone();
        Ok(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(client_id) = node.client_id_of(&message.topic) else {
                    continue;
                };
                let response = match CommandRequest::parse(&message.payload) {
                    Ok(request) => node.processor.process(request, message.payload.len()).await,
                    Err(e) => {
                        node.metrics.incr(&node.metrics.command_errors);
                        Response::error("", &CommandError::invalid(e.to_string()))
                    }
                };
                let res_topic = node.config.response_topic(&client_id);
                if let Err(e) = node
                    .transport
                    .publish(&res_topic, response.to_bytes())
                    .await
                {
                    error!("command: response publish to {} failed: {}", res_topic, e);
                }
            }
        }))
    }

    /// Periodically purge tombstones older than the retention window.
    fn spawn_tombstone_sweeper(node: &Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(node.config.replication.sweep_interval_seconds);
        let node = node.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = node.sweep_tombstones();
                if swept > 0 {
                    info!("sweeper: purged {} expired tombstone(s)", swept);
                }
            }
        })
    }

    fn spawn_dedup_cleanup(node: &Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(node.config.dedup.cleanup_interval_seconds);
        let node = node.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.dedup.evict_expired();
            }
        })
    }

    /// One sweep pass: purge every tombstone older than the retention
    /// window. Returns how many were removed.
    pub fn sweep_tombstones(&self) -> usize {
        let cutoff = now_ms() - self.config.replication.tombstone_retention_ms;
        let mut swept = 0usize;
        for key in self.storage.keys() {
            if let Some(entry) = self.storage.get(&key) {
                if entry.is_tombstone() && entry.timestamp_ms < cutoff && self.storage.purge(&key) {
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            self.metrics.add(&self.metrics.tombstones_swept, swept as u64);
        }
        swept
    }

    fn client_id_of(&self, topic: &str) -> Option<String> {
        topic
            .strip_prefix(&format!("{}/", self.config.topic_prefix))?
            .strip_suffix("/cmd")
            .map(str::to_string)
    }
}
