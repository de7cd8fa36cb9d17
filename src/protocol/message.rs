//! Outbound and inbound message model shared by consumers and the broker

use super::properties::{
    copy_fields, FieldSpec, PropertyBag, PropertyBagExt, PropertyValue,
};
use bytes::Bytes;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};

/// Names of the v5 properties a host message may carry
pub const OUTBOUND_PROPERTY_NAMES: [&str; 7] = [
    "responseTopic",
    "correlationData",
    "contentType",
    "messageExpiryInterval",
    "userProperties",
    "payloadFormatIndicator",
    "topicAlias",
];

/// Message payload: raw bytes, UTF-8 text or a parsed structured value
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Json(Value),
}

impl Payload {
    /// Normalize to wire bytes. Structured values become JSON text and a
    /// JSON null becomes the empty payload.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Bytes(b) => b.clone(),
            Payload::Text(s) => Bytes::from(s.clone()),
            Payload::Json(Value::Null) => Bytes::new(),
            Payload::Json(Value::String(s)) => Bytes::from(s.clone()),
            Payload::Json(other) => Bytes::from(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Payload::Bytes(b) => PropertyValue::Bytes(b.clone()).to_json(),
            Payload::Text(s) => Value::String(s.clone()),
            Payload::Json(v) => v.clone(),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(value))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match PropertyValue::from(value) {
            PropertyValue::Bytes(b) => Payload::Bytes(b),
            PropertyValue::Str(s) => Payload::Text(s),
            other => Payload::Json(other.to_json()),
        }
    }
}

/// A publish request as handed over by the host runtime.
///
/// `qos` and `retain` stay loosely typed; the publish path clamps and
/// coerces them. `properties` holds v5 fields under their wire names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub topic: Option<String>,
    pub payload: Option<Payload>,
    pub qos: Option<PropertyValue>,
    pub retain: Option<PropertyValue>,
    pub properties: PropertyBag,
    pub action: Option<String>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            topic: Some(topic.into()),
            payload: Some(payload.into()),
            ..Default::default()
        }
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = Some(PropertyValue::Int(i64::from(qos)));
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = Some(PropertyValue::Bool(retain));
        self
    }

    pub fn with_property(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    /// Build from a host JSON record such as
    /// `{"topic": "a/b", "payload": {...}, "qos": 1, "contentType": "application/json"}`.
    pub fn from_json(value: Value) -> Self {
        let Value::Object(mut record) = value else {
            return Self {
                payload: Some(Payload::from(value)),
                ..Default::default()
            };
        };

        let topic = match record.remove("topic") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let action = match record.remove("action") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let payload = record.remove("payload").map(Payload::from);
        let qos = record.remove("qos").map(PropertyValue::from);
        let retain = record.remove("retain").map(PropertyValue::from);
        let properties = take_properties(&mut record);

        Self {
            topic,
            payload,
            qos,
            retain,
            properties,
            action,
        }
    }
}

fn take_properties(record: &mut Map<String, Value>) -> PropertyBag {
    OUTBOUND_PROPERTY_NAMES
        .iter()
        .filter_map(|name| {
            record
                .remove(*name)
                .map(|v| (name.to_string(), PropertyValue::from(v)))
        })
        .collect()
}

/// v5 properties surfaced on a delivered message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub content_type: Option<String>,
    pub message_expiry_interval: Option<u32>,
    pub payload_format_indicator: Option<bool>,
    pub reason_string: Option<String>,
    pub user_properties: Option<IndexMap<String, String>>,
}

impl MessageProperties {
    const SCHEMA: [FieldSpec; 7] = [
        FieldSpec::string("responseTopic"),
        FieldSpec::bytes("correlationData"),
        FieldSpec::string("contentType"),
        FieldSpec::int("messageExpiryInterval", Some(0), Some(u32::MAX as i64)),
        FieldSpec::boolean("payloadFormatIndicator", None),
        FieldSpec::string("reasonString"),
        FieldSpec::user_properties("userProperties"),
    ];

    /// Extract the recognised fields from an inbound PUBLISH property bag
    pub fn from_bag(packet_properties: &PropertyBag) -> Self {
        let mut props = PropertyBag::new();
        copy_fields(packet_properties, &mut props, &Self::SCHEMA);

        Self {
            response_topic: props.get_str("responseTopic").map(str::to_string),
            correlation_data: props.get_bytes("correlationData").cloned(),
            content_type: props.get_str("contentType").map(str::to_string),
            message_expiry_interval: props
                .get_int("messageExpiryInterval")
                .and_then(|v| u32::try_from(v).ok()),
            payload_format_indicator: props.get_bool("payloadFormatIndicator"),
            reason_string: props.get_str("reasonString").map(str::to_string),
            user_properties: props.get_string_map("userProperties"),
        }
    }
}

/// A message delivered to a subscribing consumer
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Payload,
    pub qos: u8,
    pub retain: bool,
    pub properties: MessageProperties,
}

impl InboundMessage {
    pub fn to_json(&self) -> Value {
        let mut record = json!({
            "topic": self.topic,
            "payload": self.payload.to_json(),
            "qos": self.qos,
            "retain": self.retain,
        });
        let props = &self.properties;
        if let Value::Object(map) = &mut record {
            if let Some(v) = &props.response_topic {
                map.insert("responseTopic".into(), json!(v));
            }
            if let Some(v) = &props.correlation_data {
                map.insert(
                    "correlationData".into(),
                    PropertyValue::Bytes(v.clone()).to_json(),
                );
            }
            if let Some(v) = &props.content_type {
                map.insert("contentType".into(), json!(v));
            }
            if let Some(v) = props.message_expiry_interval {
                map.insert("messageExpiryInterval".into(), json!(v));
            }
            if let Some(v) = &props.user_properties {
                map.insert("userProperties".into(), json!(v));
            }
        }
        record
    }
}
