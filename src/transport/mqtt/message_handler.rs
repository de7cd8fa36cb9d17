//! Pure translation of rumqttc events into [`TransportEvent`]s
//!
//! v5 properties are flattened into a [`PropertyBag`] under their wire names
//! (`topicAliasMaximum`, `contentType`, ...) so the property codec can
//! validate them the same way it validates host messages.

use crate::protocol::{PropertyBag, PropertyValue};
use crate::transport::{InboundPacket, TransportEvent};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnAckProperties, Packet, Publish, PublishProperties};
use tracing::debug;

/// Pure routing of rumqttc events
pub struct MessageHandler;

impl MessageHandler {
    /// Route a v5 event. Outgoing packets and pings yield `None`.
    pub fn route_v5_event(event: &rumqttc::v5::Event) -> Option<TransportEvent> {
        let rumqttc::v5::Event::Incoming(packet) = event else {
            return None;
        };
        match packet {
            Packet::ConnAck(connack) => Some(TransportEvent::Connected {
                properties: connack.properties.as_ref().map(connack_properties_bag),
            }),
            Packet::Publish(publish) => Some(TransportEvent::Message(v5_inbound(publish))),
            Packet::Disconnect(disconnect) => Some(TransportEvent::Disconnect {
                reason_code: format!("{:?}", disconnect.reason_code),
                reason_string: disconnect
                    .properties
                    .as_ref()
                    .and_then(|p| p.reason_string.clone()),
            }),
            other => {
                debug!(target: "mqtt_transport", "MQTT event: {:?}", other);
                None
            }
        }
    }

    /// Route a v3.1.1 event
    pub fn route_v4_event(event: &rumqttc::Event) -> Option<TransportEvent> {
        let rumqttc::Event::Incoming(packet) = event else {
            return None;
        };
        match packet {
            rumqttc::Packet::ConnAck(_) => Some(TransportEvent::Connected { properties: None }),
            rumqttc::Packet::Publish(publish) => {
                let mut inbound = InboundPacket::new(publish.topic.clone(), publish.payload.clone());
                inbound.qos = publish.qos as u8;
                inbound.retain = publish.retain;
                Some(TransportEvent::Message(inbound))
            }
            rumqttc::Packet::Disconnect => Some(TransportEvent::Disconnect {
                reason_code: "NormalDisconnection".to_string(),
                reason_string: None,
            }),
            other => {
                debug!(target: "mqtt_transport", "MQTT event: {:?}", other);
                None
            }
        }
    }
}

fn v5_inbound(publish: &Publish) -> InboundPacket {
    let mut inbound = InboundPacket::new(
        String::from_utf8_lossy(&publish.topic).into_owned(),
        publish.payload.clone(),
    );
    inbound.qos = publish.qos as u8;
    inbound.retain = publish.retain;
    if let Some(props) = &publish.properties {
        inbound.subscription_identifiers = props
            .subscription_identifiers
            .iter()
            .filter_map(|id| u32::try_from(*id).ok())
            .collect();
        inbound.properties = Some(publish_properties_bag(props));
    } else {
        inbound.properties = Some(PropertyBag::new());
    }
    inbound
}

fn insert_opt<V: Into<PropertyValue>>(bag: &mut PropertyBag, name: &str, value: Option<V>) {
    if let Some(value) = value {
        bag.insert(name.to_string(), value.into());
    }
}

fn user_properties_value(pairs: &[(String, String)]) -> PropertyValue {
    PropertyValue::Map(
        pairs
            .iter()
            .map(|(k, v)| (k.clone(), PropertyValue::Str(v.clone())))
            .collect(),
    )
}

/// Flatten inbound PUBLISH properties
pub fn publish_properties_bag(props: &PublishProperties) -> PropertyBag {
    let mut bag = PropertyBag::new();
    insert_opt(
        &mut bag,
        "payloadFormatIndicator",
        props.payload_format_indicator.map(|v| v == 1),
    );
    insert_opt(
        &mut bag,
        "messageExpiryInterval",
        props.message_expiry_interval.map(i64::from),
    );
    insert_opt(&mut bag, "topicAlias", props.topic_alias.map(i64::from));
    insert_opt(&mut bag, "responseTopic", props.response_topic.clone());
    insert_opt::<Bytes>(&mut bag, "correlationData", props.correlation_data.clone());
    insert_opt(&mut bag, "contentType", props.content_type.clone());
    if !props.user_properties.is_empty() {
        bag.insert(
            "userProperties".into(),
            user_properties_value(&props.user_properties),
        );
    }
    bag
}

/// Flatten CONNACK properties
pub fn connack_properties_bag(props: &ConnAckProperties) -> PropertyBag {
    let flag = |v: Option<u8>| v.map(|v| v != 0);
    let mut bag = PropertyBag::new();
    insert_opt(
        &mut bag,
        "sessionExpiryInterval",
        props.session_expiry_interval.map(i64::from),
    );
    insert_opt(&mut bag, "receiveMaximum", props.receive_max.map(i64::from));
    insert_opt(&mut bag, "maximumQoS", props.max_qos.map(i64::from));
    insert_opt(&mut bag, "retainAvailable", flag(props.retain_available));
    insert_opt(
        &mut bag,
        "maximumPacketSize",
        props.max_packet_size.map(i64::from),
    );
    insert_opt(
        &mut bag,
        "assignedClientIdentifier",
        props.assigned_client_identifier.clone(),
    );
    insert_opt(
        &mut bag,
        "topicAliasMaximum",
        props.topic_alias_max.map(i64::from),
    );
    insert_opt(&mut bag, "reasonString", props.reason_string.clone());
    insert_opt(
        &mut bag,
        "wildcardSubscriptionAvailable",
        flag(props.wildcard_subscription_available),
    );
    insert_opt(
        &mut bag,
        "subscriptionIdentifiersAvailable",
        flag(props.subscription_identifiers_available),
    );
    insert_opt(
        &mut bag,
        "sharedSubscriptionAvailable",
        flag(props.shared_subscription_available),
    );
    insert_opt(
        &mut bag,
        "serverKeepAlive",
        props.server_keep_alive.map(i64::from),
    );
    insert_opt(
        &mut bag,
        "responseInformation",
        props.response_information.clone(),
    );
    insert_opt(&mut bag, "serverReference", props.server_reference.clone());
    if !props.user_properties.is_empty() {
        bag.insert(
            "userProperties".into(),
            user_properties_value(&props.user_properties),
        );
    }
    bag
}
