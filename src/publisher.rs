//! # Event Publisher
//!
//! Drives the outbound replication path. A locally committed write becomes
//! a `ReplicationEvent`; the publisher encodes it and pushes it to the
//! replication topic when the transport is up, or parks it in the outbox
//! when it isn't. Once the transport reports connected again, the buffered
//! backlog is flushed in FIFO batches.
//!
//! Transport failures are absorbed here: a failed publish turns into an
//! outbox enqueue, never into an error for the command that produced the
//! event. The only error `publish` surfaces is an oversize event, which is
//! rejected at encode time and never admitted to the outbox.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::error::CodecError;
use crate::event::{EventCodec, ReplicationEvent};
use crate::metrics::Metrics;
use crate::outbox::OutboxQueue;
use crate::transport::{ConnectionState, Transport};

/// Outbound replication driver.
pub struct EventPublisher {
    transport: Arc<dyn Transport>,
    outbox: Arc<OutboxQueue>,
    codec: EventCodec,
    topic: String,
    batch_size: usize,
    metrics: Arc<Metrics>,
    // One flush at a time; concurrent triggers coalesce onto the running one.
    flush_lock: Mutex<()>,
}

impl EventPublisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        outbox: Arc<OutboxQueue>,
        codec: EventCodec,
        topic: String,
        batch_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            transport,
            outbox,
            codec,
            topic,
            batch_size,
            metrics,
            flush_lock: Mutex::new(()),
        }
    }

    /// Publish one event, or buffer it if the transport is down or the
    /// publish fails. Only oversize events error out.
    pub async fn publish(&self, event: ReplicationEvent) -> Result<(), CodecError> {
        let payload = self.codec.encode_transport(&event)?;

        if !self.transport.is_connected() {
            debug!("publisher: offline, buffering ({}, {})", event.node_id, event.seq);
            self.outbox.enqueue(event).await;
            return Ok(());
        }

        let started = Instant::now();
        match self.transport.publish(&self.topic, payload).await {
            Ok(()) => {
                self.metrics.incr(&self.metrics.events_published);
                self.metrics.publish_latency.observe(started.elapsed());
                Ok(())
            }
            Err(e) => {
                warn!("publisher: publish failed, buffering: {}", e);
                self.metrics.incr(&self.metrics.publish_errors);
                self.outbox.enqueue(event).await;
                Ok(())
            }
        }
    }

    /// Drain the outbox while the transport stays up. Returns how many
    /// events were flushed. Stops on the first publish failure, keeping
    /// every unacknowledged event in order.
    pub async fn flush_outbox(&self) -> usize {
        let _guard = self.flush_lock.lock().await;
        let mut flushed = 0usize;

        while self.transport.is_connected() {
            let batch = self.outbox.peek_batch(self.batch_size).await;
            if batch.is_empty() {
                break;
            }
            let mut sent = 0usize;
            for event in &batch {
                let payload = match self.codec.encode_transport(event) {
                    Ok(p) => p,
                    Err(e) => {
                        // Cannot happen for events that passed encode on the
                        // way in; ack past it rather than wedging the queue.
                        warn!("publisher: dropping unencodable outbox event: {}", e);
                        sent += 1;
                        continue;
                    }
                };
                let started = Instant::now();
                match self.transport.publish(&self.topic, payload).await {
                    Ok(()) => {
                        sent += 1;
                        self.metrics.incr(&self.metrics.events_published);
                        self.metrics.publish_latency.observe(started.elapsed());
                    }
                    Err(e) => {
                        warn!("publisher: flush interrupted after {} event(s): {}", flushed + sent, e);
                        self.metrics.incr(&self.metrics.publish_errors);
                        self.outbox.ack_batch(sent).await;
                        self.metrics.add(&self.metrics.outbox_flushed, sent as u64);
                        return flushed + sent;
                    }
                }
                tokio::task::yield_now().await;
            }
            self.outbox.ack_batch(sent).await;
            self.metrics.add(&self.metrics.outbox_flushed, sent as u64);
            flushed += sent;
        }

        if flushed > 0 {
            info!("publisher: flushed {} buffered event(s)", flushed);
        }
        flushed
    }

    /// Watch the transport connection state and flush whenever it comes
    /// back up. The task ends when the transport side of the channel goes
    /// away (publisher disposal).
    pub fn spawn_auto_flush(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let publisher = self;
        let mut state_rx = publisher.transport.connection_state();
        tokio::spawn(async move {
            // Flush once at startup in case the outbox restored a backlog
            // while the transport was already up.
            if publisher.transport.is_connected() {
                publisher.flush_outbox().await;
            }
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow_and_update();
                if state == ConnectionState::Connected {
                    debug!("publisher: reconnect detected, flushing outbox");
                    publisher.flush_outbox().await;
                }
            }
        })
    }
}
