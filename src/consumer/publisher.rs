//! `MqttOut`: the publishing consumer

use super::{connect_action, disconnect_action, ActionOutcome, ConsumerError};
use crate::broker::publish::parse_qos;
use crate::broker::{BrokerError, SharedBroker};
use crate::protocol::{OutboundMessage, PropertyValue};
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Defaults a publisher applies to every message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub id: String,
    /// Overrides the message topic when non-empty
    #[serde(default)]
    pub topic: Option<String>,
    pub qos: Option<u8>,
    pub retain: Option<bool>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<String>,
    pub content_type: Option<String>,
    pub message_expiry_interval: Option<u32>,
    #[serde(default)]
    pub user_properties: IndexMap<String, String>,
}

impl PublisherConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Fill in defaults. An explicit message QoS or retain wins over the
    /// configured one; configured v5 properties win over the message's.
    pub fn apply(&self, mut message: OutboundMessage, v5: bool) -> OutboundMessage {
        if let Some(topic) = self.topic.as_deref().filter(|t| !t.is_empty()) {
            message.topic = Some(topic.to_string());
        }

        let qos = parse_qos(message.qos.as_ref())
            .or(self.qos.filter(|q| *q <= 2))
            .unwrap_or(0);
        message.qos = Some(PropertyValue::Int(i64::from(qos)));

        let retain = match &message.retain {
            Some(PropertyValue::Bool(b)) => *b,
            Some(PropertyValue::Str(s)) if s == "true" || s == "false" => s == "true",
            _ => self.retain.unwrap_or(false),
        };
        message.retain = Some(PropertyValue::Bool(retain));

        if v5 {
            let props = &mut message.properties;
            if !self.user_properties.is_empty() {
                let map = self
                    .user_properties
                    .iter()
                    .map(|(k, v)| (k.clone(), PropertyValue::Str(v.clone())))
                    .collect();
                props.insert("userProperties".to_string(), PropertyValue::Map(map));
            }
            if let Some(topic) = self.response_topic.as_deref().filter(|t| !t.is_empty()) {
                props.insert("responseTopic".to_string(), PropertyValue::from(topic));
            }
            if let Some(data) = self.correlation_data.as_deref().filter(|d| !d.is_empty()) {
                props.insert(
                    "correlationData".to_string(),
                    PropertyValue::Bytes(Bytes::copy_from_slice(data.as_bytes())),
                );
            }
            if let Some(content_type) = self.content_type.as_deref().filter(|c| !c.is_empty()) {
                props.insert("contentType".to_string(), PropertyValue::from(content_type));
            }
            if let Some(expiry) = self.message_expiry_interval {
                props.insert(
                    "messageExpiryInterval".to_string(),
                    PropertyValue::Int(i64::from(expiry)),
                );
            }
        }
        message
    }
}

/// Publishing consumer
pub struct MqttOut {
    config: PublisherConfig,
    broker: SharedBroker,
}

impl MqttOut {
    pub fn new(config: PublisherConfig, broker: SharedBroker) -> Self {
        Self { config, broker }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub async fn start(&self) -> Result<(), ConsumerError> {
        self.broker.register(&self.config.id).await?;
        Ok(())
    }

    /// Run an action or publish a message.
    ///
    /// Messages without a payload are skipped. Publish validation failures
    /// are logged at warn level and returned.
    pub async fn handle(&self, message: OutboundMessage) -> Result<ActionOutcome, ConsumerError> {
        if let Some(action) = message.action.as_deref() {
            return match action {
                "connect" => connect_action(&self.broker).await,
                "disconnect" => disconnect_action(&self.broker).await,
                other => Err(ConsumerError::InvalidAction(other.to_string())),
            };
        }

        if message.payload.is_none() {
            debug!(consumer = %self.config.id, "Message without payload skipped");
            return Ok(ActionOutcome::Done);
        }

        let message = self.config.apply(message, self.broker.is_v5());
        match self.broker.publish(&message).await {
            Ok(outcome) => Ok(ActionOutcome::Published(outcome)),
            Err(BrokerError::Publish(e)) => {
                warn!(consumer = %self.config.id, error = %e, "Publish rejected");
                Err(ConsumerError::Publish(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn close(&self, removed: bool) {
        self.broker.linker().wait_in_flight().await;
        self.broker.deregister(&self.config.id, removed).await;
        info!(consumer = %self.config.id, removed, "Publisher closed");
    }
}
