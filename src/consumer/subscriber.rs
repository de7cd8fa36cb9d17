//! `MqttIn`: the subscribing consumer
//!
//! Either subscribes to one static filter for its whole life, or runs in
//! dynamic mode where `subscribe`/`unsubscribe` actions manage a list of
//! subscriptions at runtime.

use super::{connect_action, disconnect_action, ActionOutcome, ConsumerError, Delivery};
use crate::broker::{MessageCallback, SharedBroker, SubscriptionRequest};
use crate::protocol::properties::{bag, set_bool_prop, set_int_prop};
use crate::protocol::{
    decode_inbound, is_valid_subscription_filter, DataType, PropertyBag, PropertyBagExt,
    PropertyValue,
};
use crate::transport::{InboundPacket, SubscribeOptions};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub id: String,
    /// Static filter; ignored in dynamic mode
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub dynamic: bool,
    pub qos: Option<i64>,
    #[serde(default)]
    pub datatype: DataType,
    pub nl: Option<bool>,
    pub rap: Option<bool>,
    pub rh: Option<i64>,
}

impl SubscriberConfig {
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn dynamic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dynamic: true,
            ..Default::default()
        }
    }

    pub fn with_datatype(mut self, datatype: DataType) -> Self {
        self.datatype = datatype;
        self
    }

    /// Configured QoS; missing or invalid becomes 2
    pub fn qos(&self) -> u8 {
        self.qos
            .filter(|q| (0..=2).contains(q))
            .map(|q| q as u8)
            .unwrap_or(2)
    }

    /// Options for the static subscription. v5-only flags are left out on
    /// older protocols.
    pub fn subscribe_options(&self, v5: bool) -> SubscribeOptions {
        let mut options = SubscribeOptions {
            qos: self.qos(),
            ..Default::default()
        };
        if v5 {
            options.retain_handling = match self.rh {
                None => Some(0),
                Some(rh) if (0..=2).contains(&rh) => Some(rh as u8),
                Some(_) => None,
            };
            options.no_local = self.nl;
            options.retain_as_published = self.rap;
        }
        options
    }
}

/// One runtime subscription of a dynamic subscriber
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DynamicSubscription {
    pub topic: String,
    pub qos: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rh: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rap: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nl: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datatype: Option<DataType>,
}

impl DynamicSubscription {
    /// Parse a string filter or a subscription object. Defaults are qos 2,
    /// and on v5 rh 0 with rap true.
    pub fn parse(value: &Value, v5: bool) -> Result<Self, ConsumerError> {
        let record: PropertyBag = match value {
            Value::String(topic) => bag([("topic", topic.as_str())]),
            Value::Object(_) => match PropertyValue::from(value.clone()) {
                PropertyValue::Map(map) => map,
                _ => return Err(ConsumerError::BadSubscription),
            },
            _ => return Err(ConsumerError::BadSubscription),
        };

        let topic = record.get_str("topic").unwrap_or_default().to_string();
        if topic.is_empty() || !is_valid_subscription_filter(&topic) {
            return Err(ConsumerError::InvalidTopic(topic));
        }

        let mut options = PropertyBag::new();
        set_int_prop(&record, &mut options, "qos", Some(0), Some(2), Some(2));
        if v5 {
            set_int_prop(&record, &mut options, "rh", Some(0), Some(2), Some(0));
            set_bool_prop(&record, &mut options, "rap", Some(true));
            set_bool_prop(&record, &mut options, "nl", None);
        }

        Ok(Self {
            topic,
            qos: options.get_int("qos").map(|q| q as u8).unwrap_or(2),
            rh: options.get_int("rh").map(|rh| rh as u8),
            rap: options.get_bool("rap"),
            nl: options.get_bool("nl"),
            datatype: record.get_str("datatype").and_then(|d| d.parse().ok()),
        })
    }

    pub fn options(&self) -> SubscribeOptions {
        SubscribeOptions {
            qos: self.qos,
            no_local: self.nl,
            retain_as_published: self.rap,
            retain_handling: self.rh,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnsubscribeTarget {
    All,
    Topics(Vec<String>),
}

/// Actions a subscriber accepts
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberAction {
    Connect,
    Disconnect,
    Subscribe(Vec<DynamicSubscription>),
    Unsubscribe(UnsubscribeTarget),
    GetSubscriptions,
}

impl SubscriberAction {
    /// Parse an action name and its `topic` argument.
    ///
    /// `topic` may be a filter, a subscription object or a list of either;
    /// `unsubscribe` also takes `true` for every dynamic subscription.
    pub fn parse(action: &str, topic: Option<&Value>, v5: bool) -> Result<Self, ConsumerError> {
        match action {
            "connect" => Ok(SubscriberAction::Connect),
            "disconnect" => Ok(SubscriberAction::Disconnect),
            "getSubscriptions" => Ok(SubscriberAction::GetSubscriptions),
            "subscribe" => Ok(SubscriberAction::Subscribe(parse_subscriptions(topic, v5)?)),
            "unsubscribe" => {
                if matches!(topic, Some(Value::Bool(true))) {
                    return Ok(SubscriberAction::Unsubscribe(UnsubscribeTarget::All));
                }
                let topics = parse_subscriptions(topic, v5)?
                    .into_iter()
                    .map(|sub| sub.topic)
                    .collect();
                Ok(SubscriberAction::Unsubscribe(UnsubscribeTarget::Topics(topics)))
            }
            other => Err(ConsumerError::InvalidAction(other.to_string())),
        }
    }
}

fn parse_subscriptions(
    topic: Option<&Value>,
    v5: bool,
) -> Result<Vec<DynamicSubscription>, ConsumerError> {
    match topic {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| DynamicSubscription::parse(item, v5))
            .collect(),
        Some(item @ (Value::String(_) | Value::Object(_))) => {
            Ok(vec![DynamicSubscription::parse(item, v5)?])
        }
        _ => Err(ConsumerError::BadSubscription),
    }
}

/// Subscribing consumer. Decoded messages and decode errors go to `sink`,
/// which is unbounded so a slow host never loses messages.
pub struct MqttIn {
    config: SubscriberConfig,
    broker: SharedBroker,
    sink: mpsc::UnboundedSender<Delivery>,
    dynamic_subs: Mutex<IndexMap<String, DynamicSubscription>>,
}

impl MqttIn {
    /// Build the consumer. A static subscriber with an invalid filter is
    /// rejected.
    pub fn new(
        config: SubscriberConfig,
        broker: SharedBroker,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Result<Self, ConsumerError> {
        if !config.dynamic && !is_valid_subscription_filter(&config.topic) {
            return Err(ConsumerError::InvalidTopic(config.topic));
        }
        Ok(Self {
            config,
            broker,
            sink,
            dynamic_subs: Mutex::new(IndexMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Register with the broker and subscribe to the static filter.
    ///
    /// The static subscription is stored even when registration fails, so
    /// it is replayed once the connection recovers.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let registered = self.broker.register(&self.config.id).await;
        if let Err(e) = &registered {
            warn!(consumer = %self.config.id, error = %e, "Registration failed");
        }
        if !self.config.dynamic {
            let options = self.config.subscribe_options(self.broker.is_v5());
            self.broker
                .subscribe(SubscriptionRequest::new(
                    self.config.topic.clone(),
                    options,
                    self.config.id.clone(),
                    self.callback(self.config.datatype),
                ))
                .await?;
            info!(consumer = %self.config.id, topic = %self.config.topic, "Subscribed");
        }
        registered?;
        Ok(())
    }

    fn callback(&self, datatype: DataType) -> MessageCallback {
        let sink = self.sink.clone();
        let v5 = self.broker.is_v5();
        let consumer = self.config.id.clone();
        Arc::new(move |packet: &InboundPacket| {
            let delivery = decode_inbound(datatype, packet, v5);
            if let Err(e) = &delivery {
                warn!(consumer = %consumer, topic = %packet.topic, code = %e.code, "Payload decode failed");
            }
            if sink.send(delivery).is_err() {
                warn!(consumer = %consumer, topic = %packet.topic, "Sink closed, message dropped");
            }
        })
    }

    /// Parse and run an action from the host
    pub async fn handle(
        &self,
        action: &str,
        topic: Option<&Value>,
    ) -> Result<ActionOutcome, ConsumerError> {
        let action = SubscriberAction::parse(action, topic, self.broker.is_v5())?;
        self.handle_action(action).await
    }

    pub async fn handle_action(
        &self,
        action: SubscriberAction,
    ) -> Result<ActionOutcome, ConsumerError> {
        match action {
            SubscriberAction::Connect => connect_action(&self.broker).await,
            SubscriberAction::Disconnect => disconnect_action(&self.broker).await,
            SubscriberAction::GetSubscriptions => {
                Ok(ActionOutcome::Subscriptions(self.dynamic_subscriptions().await))
            }
            SubscriberAction::Subscribe(subscriptions) => {
                let mut dynamic = self.dynamic_subs.lock().await;
                for sub in subscriptions {
                    if dynamic.shift_remove(&sub.topic).is_some() {
                        self.broker.unsubscribe(&sub.topic, &self.config.id, true).await;
                    }
                    let datatype = sub.datatype.unwrap_or(self.config.datatype);
                    self.broker
                        .subscribe(SubscriptionRequest::new(
                            sub.topic.clone(),
                            sub.options(),
                            self.config.id.clone(),
                            self.callback(datatype),
                        ))
                        .await?;
                    debug!(consumer = %self.config.id, topic = %sub.topic, "Dynamic subscription added");
                    dynamic.insert(sub.topic.clone(), sub);
                }
                Ok(ActionOutcome::Subscriptions(dynamic.values().cloned().collect()))
            }
            SubscriberAction::Unsubscribe(target) => {
                let mut dynamic = self.dynamic_subs.lock().await;
                let topics = match target {
                    UnsubscribeTarget::All => dynamic.keys().cloned().collect(),
                    UnsubscribeTarget::Topics(topics) => topics,
                };
                for topic in topics {
                    self.broker.unsubscribe(&topic, &self.config.id, true).await;
                    dynamic.shift_remove(&topic);
                }
                Ok(ActionOutcome::Subscriptions(dynamic.values().cloned().collect()))
            }
        }
    }

    pub async fn dynamic_subscriptions(&self) -> Vec<DynamicSubscription> {
        self.dynamic_subs.lock().await.values().cloned().collect()
    }

    /// Leave the broker. `removed` forces broker-level unsubscribes and lets
    /// the last consumer close the connection.
    pub async fn close(&self, removed: bool) {
        self.broker.linker().wait_in_flight().await;
        if self.config.dynamic {
            let mut dynamic = self.dynamic_subs.lock().await;
            for topic in dynamic.keys() {
                self.broker.unsubscribe(topic, &self.config.id, removed).await;
            }
            dynamic.clear();
        } else {
            self.broker
                .unsubscribe(&self.config.topic, &self.config.id, removed)
                .await;
        }
        self.broker.deregister(&self.config.id, removed).await;
        info!(consumer = %self.config.id, removed, "Subscriber closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_static_qos_defaults() {
        let mut config = SubscriberConfig::new("n1", "a/#");
        assert_eq!(config.qos(), 2);
        config.qos = Some(5);
        assert_eq!(config.qos(), 2);
        config.qos = Some(0);
        assert_eq!(config.qos(), 0);
    }

    #[test]
    fn test_static_options_v5_only_flags() {
        let mut config = SubscriberConfig::new("n1", "a/#");
        config.nl = Some(true);
        config.rh = Some(7);

        let v4 = config.subscribe_options(false);
        assert_eq!(v4.no_local, None);
        assert_eq!(v4.retain_handling, None);

        let v5 = config.subscribe_options(true);
        assert_eq!(v5.no_local, Some(true));
        assert_eq!(v5.retain_handling, None);

        config.rh = None;
        assert_eq!(config.subscribe_options(true).retain_handling, Some(0));
    }

    #[test]
    fn test_dynamic_subscription_defaults() {
        let sub = DynamicSubscription::parse(&json!("x/+"), true).unwrap();
        assert_eq!(sub.topic, "x/+");
        assert_eq!(sub.qos, 2);
        assert_eq!(sub.rh, Some(0));
        assert_eq!(sub.rap, Some(true));
        assert_eq!(sub.nl, None);

        let sub = DynamicSubscription::parse(
            &json!({"topic": "y", "qos": "1", "nl": "true", "datatype": "json"}),
            true,
        )
        .unwrap();
        assert_eq!(sub.qos, 1);
        assert_eq!(sub.nl, Some(true));
        assert_eq!(sub.datatype, Some(DataType::Json));

        let v4 = DynamicSubscription::parse(&json!("z"), false).unwrap();
        assert_eq!(v4.rap, None);
        assert_eq!(v4.rh, None);
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!(
            SubscriberAction::parse("connect", None, true).unwrap(),
            SubscriberAction::Connect
        );
        assert_eq!(
            SubscriberAction::parse("unsubscribe", Some(&json!(true)), true).unwrap(),
            SubscriberAction::Unsubscribe(UnsubscribeTarget::All)
        );
        assert_eq!(
            SubscriberAction::parse("unsubscribe", Some(&json!(["a", {"topic": "b"}])), true)
                .unwrap(),
            SubscriberAction::Unsubscribe(UnsubscribeTarget::Topics(vec![
                "a".to_string(),
                "b".to_string()
            ]))
        );

        assert!(matches!(
            SubscriberAction::parse("explode", None, true),
            Err(ConsumerError::InvalidAction(a)) if a == "explode"
        ));
        assert!(matches!(
            SubscriberAction::parse("subscribe", Some(&json!(["ok", "bad/#/x"])), true),
            Err(ConsumerError::InvalidTopic(_))
        ));
        assert!(matches!(
            SubscriberAction::parse("subscribe", Some(&json!({"qos": 1})), true),
            Err(ConsumerError::InvalidTopic(_))
        ));
        assert!(matches!(
            SubscriberAction::parse("subscribe", Some(&json!(5)), true),
            Err(ConsumerError::BadSubscription)
        ));
        assert!(matches!(
            SubscriberAction::parse("subscribe", None, true),
            Err(ConsumerError::BadSubscription)
        ));
    }
}
