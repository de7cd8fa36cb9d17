//! Outbound publish normalization
//!
//! Turns a loosely typed [`OutboundMessage`] into a [`PublishRequest`]:
//! QoS is clamped, retain coerced, v5 properties validated and topic aliases
//! substituted. Nothing here touches the network.

use super::server_properties::ServerProperties;
use crate::protocol::properties::{copy_fields, parse_int, FieldSpec};
use crate::protocol::{
    is_valid_publish_topic, OutboundMessage, Payload, PropertyBag, PropertyBagExt, PropertyValue,
};
use crate::transport::{PublishProperties, PublishRequest};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

const PUBLISH_SCHEMA: [FieldSpec; 6] = [
    FieldSpec::string("responseTopic"),
    FieldSpec::bytes("correlationData"),
    FieldSpec::string("contentType"),
    FieldSpec::int("messageExpiryInterval", Some(0), Some(u32::MAX as i64)),
    FieldSpec::user_properties("userProperties"),
    FieldSpec::boolean("payloadFormatIndicator", None),
];

/// Publish-time validation failures. All of them are warn-class: the caller
/// reports them but the connection is unaffected.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PublishError {
    #[error("Invalid topic specified: {0:?}")]
    InvalidTopic(String),
    #[error("Invalid topicAlias: {0}")]
    InvalidTopicAlias(i64),
}

impl PublishError {
    pub fn is_warning(&self) -> bool {
        true
    }
}

/// QoS 0, 1 or 2; anything else falls back to 0
pub fn sanitize_qos(value: Option<&PropertyValue>) -> u8 {
    parse_qos(value).unwrap_or(0)
}

/// Parse a QoS value, `None` when absent or outside 0..=2
pub fn parse_qos(value: Option<&PropertyValue>) -> Option<u8> {
    value
        .and_then(parse_int)
        .filter(|q| (0..=2).contains(q))
        .map(|q| q as u8)
}

/// Only `true` and `"true"` retain
pub fn coerce_retain(value: Option<&PropertyValue>) -> bool {
    match value {
        Some(PropertyValue::Bool(b)) => *b,
        Some(PropertyValue::Str(s)) => s == "true",
        _ => false,
    }
}

/// Alias to topic bindings for one connection
#[derive(Debug, Default, Clone)]
pub struct TopicAliases {
    bindings: HashMap<u16, String>,
}

impl TopicAliases {
    pub fn get(&self, alias: u16) -> Option<&str> {
        self.bindings.get(&alias).map(String::as_str)
    }

    pub fn bind(&mut self, alias: u16, topic: impl Into<String>) {
        self.bindings.insert(alias, topic.into());
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Validate and normalize `msg` for the wire.
///
/// With `v5` false no properties are attached and aliases are ignored.
pub fn prepare_publish(
    msg: &OutboundMessage,
    v5: bool,
    server: &ServerProperties,
    aliases: &mut TopicAliases,
) -> Result<PublishRequest, PublishError> {
    let qos = sanitize_qos(msg.qos.as_ref());
    let retain = coerce_retain(msg.retain.as_ref());
    let payload = msg
        .payload
        .as_ref()
        .map(Payload::to_bytes)
        .unwrap_or_default();
    let mut topic = msg.topic.clone().unwrap_or_default();

    if !v5 {
        if !is_valid_publish_topic(&topic) {
            return Err(PublishError::InvalidTopic(topic));
        }
        return Ok(PublishRequest {
            topic,
            payload,
            qos,
            retain,
            properties: None,
        });
    }

    let mut props = PropertyBag::new();
    copy_fields(&msg.properties, &mut props, &PUBLISH_SCHEMA);
    let mut properties = PublishProperties {
        payload_format_indicator: props.get_bool("payloadFormatIndicator"),
        message_expiry_interval: props
            .get_int("messageExpiryInterval")
            .and_then(|v| u32::try_from(v).ok()),
        topic_alias: None,
        response_topic: props.get_str("responseTopic").map(str::to_string),
        correlation_data: props.get_bytes("correlationData").cloned(),
        user_properties: props
            .get_string_map("userProperties")
            .map(|m| m.into_iter().collect())
            .unwrap_or_default(),
        content_type: props.get_str("contentType").map(str::to_string),
    };

    let requested_alias = msg.properties.get("topicAlias").and_then(parse_int);
    let topic_ok = is_valid_publish_topic(&topic);

    match requested_alias {
        Some(alias) if topic_ok => {
            let max = i64::from(server.topic_alias_maximum());
            if alias < 1 || alias > max {
                debug!(alias, max, topic = %topic, "Topic alias outside the server range, rejecting publish");
                return Err(PublishError::InvalidTopicAlias(alias));
            }
            let alias = alias as u16;
            properties.topic_alias = Some(alias);
            if aliases.get(alias) == Some(topic.as_str()) {
                debug!(alias, topic = %topic, "Topic alias reused");
                topic.clear();
            } else {
                aliases.bind(alias, topic.clone());
            }
        }
        _ if topic.is_empty() && properties.response_topic.is_some() => {
            topic = properties.response_topic.clone().unwrap_or_default();
            if !is_valid_publish_topic(&topic) {
                return Err(PublishError::InvalidTopic(topic));
            }
        }
        _ if !topic_ok => return Err(PublishError::InvalidTopic(topic)),
        _ => {}
    }

    Ok(PublishRequest {
        topic,
        payload,
        qos,
        retain,
        properties: Some(properties),
    })
}
