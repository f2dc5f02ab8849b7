//! # Pub/Sub Transport
//!
//! Abstracts the message transport behind a trait so the replication core
//! can be driven by a real MQTT broker in production and by an in-memory
//! transport in tests. All publishes go out at QoS 1 (at-least-once) with
//! retain off; duplicate delivery is the dedup tracker's problem, not the
//! transport's.
//!
//! Connection state is exposed as a `watch` channel: the publisher
//! observes transitions to `Connected` to trigger outbox flushes.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::MqttConfig;
use crate::error::TransportError;

/// Connectivity of the underlying transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Pub/sub transport consumed by the replication core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish at QoS 1, retain off.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to a topic filter (MQTT wildcards allowed) and receive
    /// matching messages on the returned channel.
    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<InboundMessage>, TransportError>;

    /// Observable connection state.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    fn is_connected(&self) -> bool {
        *self.connection_state().borrow() == ConnectionState::Connected
    }
}

/// Does an MQTT topic filter match a concrete topic?
///
/// `+` matches exactly one level, `#` matches the remainder.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

type SubscriberList = Arc<Mutex<Vec<(String, mpsc::Sender<InboundMessage>)>>>;

/// MQTT transport over rumqttc.
///
/// The event loop runs in a background task: it drives the connection,
/// routes inbound publishes to subscribers by topic filter, and tracks
/// connectivity. rumqttc reconnects on its own; each poll error flips the
/// state to `Disconnected` and the next successful ConnAck flips it back.
pub struct MqttTransport {
    client: AsyncClient,
    subscribers: SubscriberList,
    state_rx: watch::Receiver<ConnectionState>,
}

impl MqttTransport {
    /// Connect to the broker and start the event-loop task.
    pub fn connect(client_id: &str, mqtt: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(client_id, &mqtt.broker, mqtt.port);
        options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_seconds));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let subscribers: SubscriberList = Arc::new(Mutex::new(Vec::new()));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let route_to = subscribers.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt: connected");
                        let _ = state_tx.send(ConnectionState::Connected);
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        let mut subs = route_to.lock().await;
                        subs.retain(|(filter, tx)| {
                            if filter_matches(filter, &message.topic) {
                                if tx.try_send(message.clone()).is_err() {
                                    warn!("mqtt: subscriber for {} lagging or gone", filter);
                                    return !tx.is_closed();
                                }
                            }
                            true
                        });
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        warn!("mqtt: broker disconnect");
                        let _ = state_tx.send(ConnectionState::Disconnected);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("mqtt: event loop error: {}", e);
                        let _ = state_tx.send(ConnectionState::Disconnected);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Self {
            client,
            subscribers,
            state_rx,
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<InboundMessage>, TransportError> {
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        let (tx, rx) = mpsc::channel(1024);
        self.subscribers.lock().await.push((filter.to_string(), tx));
        debug!("mqtt: subscribed to {}", filter);
        Ok(rx)
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}
