//! Statestream bridge.
//!
//! The host's statestream publishes `<prefix>/<domain>/<object_id>/state`
//! with the raw state and `<prefix>/<domain>/<object_id>/<attribute>` with
//! JSON-encoded attribute values. Sensor topics are mirrored into the
//! in-memory host, which then notifies the plants as usual.

use super::client::{MqttClient, MqttMessage};
use crate::config::MqttConfig;
use crate::host::{HostState, InMemoryHost, StateStore};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum StatestreamMessage {
    State {
        entity_id: String,
        state: String,
    },
    Attribute {
        entity_id: String,
        key: String,
        value: Value,
    },
}

impl StatestreamMessage {
    /// Parse a sensor statestream message. `None` for anything else.
    pub fn parse(prefix: &str, topic: &str, payload: &str) -> Option<Self> {
        let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let (Some("sensor"), Some(object_id), Some(suffix), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        if object_id.is_empty() {
            return None;
        }
        let entity_id = format!("sensor.{}", object_id);

        if suffix == "state" {
            return Some(StatestreamMessage::State {
                entity_id,
                state: payload.trim().to_string(),
            });
        }
        // Attributes are JSON; fall back to the raw text.
        let value = serde_json::from_str(payload)
            .unwrap_or_else(|_| Value::String(payload.to_string()));
        Some(StatestreamMessage::Attribute {
            entity_id,
            key: suffix.to_string(),
            value,
        })
    }

    /// Mirror the message into the host.
    pub fn apply(self, host: &InMemoryHost, now: DateTime<Utc>) {
        match self {
            StatestreamMessage::State { entity_id, state } => {
                let mut host_state = host
                    .get_state(&entity_id)
                    .unwrap_or_else(|| HostState::new(state.clone(), now));
                host_state.state = state;
                host_state.last_updated = now;
                host.write_state(&entity_id, host_state);
            }
            StatestreamMessage::Attribute {
                entity_id,
                key,
                value,
            } => host.write_attribute(&entity_id, &key, value, now),
        }
    }
}

pub struct StatestreamBridge {
    config: MqttConfig,
    host: Arc<InMemoryHost>,
}

impl StatestreamBridge {
    pub fn new(config: MqttConfig, host: Arc<InMemoryHost>) -> Self {
        Self { config, host }
    }

    fn topic(&self) -> String {
        format!("{}/sensor/+/+", self.config.statestream_prefix)
    }

    /// Spawn the bridge. The returned handle can be aborted on shutdown.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        info!(
            "[MQTT] Connecting to {}:{}",
            self.config.broker_host, self.config.broker_port
        );

        let mqtt_client = MqttClient::new(&self.config);
        let (msg_tx, mut msg_rx) = mpsc::channel::<MqttMessage>(64);
        let (connected_tx, connected_rx) = oneshot::channel();

        // The event loop must run for the connection to come up.
        let subscriber = mqtt_client.client();
        let mqtt_loop = tokio::spawn(async move {
            mqtt_client.run(msg_tx, Some(connected_tx)).await;
        });

        match tokio::time::timeout(CONNECT_TIMEOUT, connected_rx).await {
            Ok(Ok(())) => {
                info!("[MQTT] Connection established, subscribing to statestream");
            }
            Ok(Err(_)) => {
                warn!("[MQTT] Connection signal channel dropped");
                return;
            }
            Err(_) => {
                warn!(
                    "[MQTT] Connection timeout after {} seconds",
                    CONNECT_TIMEOUT.as_secs()
                );
                mqtt_loop.abort();
                return;
            }
        }

        let topic = self.topic();
        if let Err(e) = subscriber.subscribe(&topic, rumqttc::QoS::AtMostOnce).await {
            warn!("[MQTT] Failed to subscribe to {}: {:?}", topic, e);
            mqtt_loop.abort();
            return;
        }
        info!("[MQTT] Following {}", topic);

        while let Some(msg) = msg_rx.recv().await {
            match StatestreamMessage::parse(&self.config.statestream_prefix, &msg.topic, &msg.payload) {
                Some(message) => message.apply(&self.host, Utc::now()),
                None => debug!("[MQTT] Ignoring {}", msg.topic),
            }
        }

        mqtt_loop.abort();
    }
}
