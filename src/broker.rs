//! MQTT broker adapter.
//!
//! Each worker owns one [`MqttBroker`]. The rumqttc event loop runs in its own
//! task and forwards incoming publishes through a bounded channel, so storage
//! work in the consumer never stalls keep-alives or acknowledgements.

use crate::config::MqttConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::model::QoS;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, Packet};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

/// A message to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    /// Also carried inside the payload as `CorrelationId`
    pub correlation_id: Uuid,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn subscribe(&self, pattern: &str, qos: QoS) -> BridgeResult<()>;

    async fn unsubscribe(&self, pattern: &str) -> BridgeResult<()>;

    /// Hand a message to the client's outbound queue
    async fn publish(&self, message: OutboundMessage) -> BridgeResult<()>;
}

type Subscriptions = Arc<Mutex<HashMap<String, rumqttc::QoS>>>;

/// rumqttc-backed broker connection
pub struct MqttBroker {
    client: AsyncClient,
    client_id: String,
    subscriptions: Subscriptions,
    event_loop: JoinHandle<()>,
    cancel: CancellationToken,
}

impl MqttBroker {
    /// Create the client and spawn its event loop.
    ///
    /// `role` distinguishes the connections of one process (`receiver`,
    /// `publisher`). The returned receiver yields every incoming publish.
    pub fn connect(
        config: &MqttConfig,
        role: &str,
        cancel: CancellationToken,
    ) -> (Self, Receiver<InboundMessage>) {
        let client_id = config.client_id_for(role);
        info!(
            "Connecting to MQTT broker {}:{} as {}",
            config.broker_host, config.broker_port, client_id
        );

        let (client, mut event_loop) =
            AsyncClient::new(config.mqtt_options(&client_id), config.request_capacity);
        event_loop.network_options = config.network_options();

        let (message_tx, message_rx) = mpsc::channel(config.inbound_capacity);
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));

        let event_loop = Self::spawn_event_loop(
            event_loop,
            client.clone(),
            message_tx,
            Arc::clone(&subscriptions),
            config.reconnect_delay(),
            cancel.clone(),
        );

        (
            Self {
                client,
                client_id,
                subscriptions,
                event_loop,
                cancel,
            },
            message_rx,
        )
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Spawn MQTT event loop task
    fn spawn_event_loop(
        mut event_loop: rumqttc::EventLoop,
        client: AsyncClient,
        message_tx: Sender<InboundMessage>,
        subscriptions: Subscriptions,
        reconnect_delay: std::time::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("MQTT event loop started");
            let mut connected_before = false;
            let mut consumer_gone = false;

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = event_loop.poll() => event,
                };

                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!(
                            "Received MQTT message: topic={}, qos={}, size={}",
                            publish.topic,
                            publish.qos as u8,
                            publish.payload.len()
                        );

                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.clone(),
                            retain: publish.retain,
                        };
                        if message_tx.send(message).await.is_err() && !consumer_gone {
                            warn!("No consumer for incoming MQTT messages, dropping them");
                            consumer_gone = true;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                        info!(
                            "MQTT connected: session_present={}",
                            connack.session_present
                        );
                        if connected_before && !connack.session_present {
                            Self::resubscribe(&client, &subscriptions);
                        }
                        connected_before = true;
                    }
                    Ok(Event::Incoming(Packet::SubAck(suback))) => {
                        info!("MQTT subscription acknowledged: {:?}", suback.return_codes);
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        debug!("MQTT ping response received");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("MQTT disconnected");
                    }
                    Ok(Event::Outgoing(_)) => {}
                    Ok(event) => {
                        debug!("MQTT event: {:?}", event);
                    }
                    Err(e) => {
                        error!(
                            "MQTT event loop error: {}; reconnecting in {:?}",
                            e, reconnect_delay
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(reconnect_delay) => {}
                        }
                    }
                }
            }

            info!("MQTT event loop stopped");
        })
    }

    fn resubscribe(client: &AsyncClient, subscriptions: &Subscriptions) {
        let patterns: Vec<(String, rumqttc::QoS)> = match subscriptions.lock() {
            Ok(guard) => guard.iter().map(|(p, q)| (p.clone(), *q)).collect(),
            Err(_) => return,
        };
        for (pattern, qos) in patterns {
            info!("Re-subscribing to MQTT topic: {}", pattern);
            if let Err(e) = client.try_subscribe(pattern.as_str(), qos) {
                error!("Failed to re-subscribe to {}: {}", pattern, e);
            }
        }
    }

    fn track(&self, pattern: &str, qos: Option<rumqttc::QoS>) {
        if let Ok(mut guard) = self.subscriptions.lock() {
            match qos {
                Some(qos) => {
                    guard.insert(pattern.to_string(), qos);
                }
                None => {
                    guard.remove(pattern);
                }
            }
        }
    }

    /// Disconnect and stop the event loop
    pub async fn shutdown(self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("Error disconnecting MQTT client {}: {}", self.client_id, e);
        }
        self.cancel.cancel();
        if let Err(e) = self.event_loop.await {
            warn!("MQTT event loop task ended abnormally: {}", e);
        }
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn subscribe(&self, pattern: &str, qos: QoS) -> BridgeResult<()> {
        info!("Subscribing to MQTT topic: {} (QoS: {:?})", pattern, qos);
        self.client
            .subscribe(pattern, qos.into())
            .await
            .map_err(|e| {
                BridgeError::broker(format!("Failed to subscribe to topic {}: {}", pattern, e))
            })?;
        self.track(pattern, Some(qos.into()));
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> BridgeResult<()> {
        info!("Unsubscribing from MQTT topic: {}", pattern);
        self.track(pattern, None);
        self.client.unsubscribe(pattern).await.map_err(|e| {
            BridgeError::broker(format!("Failed to unsubscribe from {}: {}", pattern, e))
        })
    }

    async fn publish(&self, message: OutboundMessage) -> BridgeResult<()> {
        debug!(
            "Publishing to {} (correlation {}, {} bytes)",
            message.topic,
            message.correlation_id,
            message.payload.len()
        );
        self.client
            .publish(
                message.topic.as_str(),
                message.qos.into(),
                message.retain,
                message.payload,
            )
            .await
            .map_err(|e| BridgeError::publish(format!("Failed to publish to {}: {}", message.topic, e)))
    }
}
