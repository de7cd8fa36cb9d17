//! Server capabilities announced in the v5 CONNACK

use crate::protocol::properties::{copy_fields, FieldSpec};
use crate::protocol::{PropertyBag, PropertyBagExt};
use indexmap::IndexMap;

const CONNACK_SCHEMA: [FieldSpec; 15] = [
    FieldSpec::int("topicAliasMaximum", Some(0), None),
    FieldSpec::int("receiveMaximum", Some(0), None),
    FieldSpec::int("sessionExpiryInterval", Some(0), Some(0xFFFF_FFFF)),
    FieldSpec::int("maximumQoS", Some(0), Some(2)),
    FieldSpec::boolean("retainAvailable", Some(true)),
    FieldSpec::boolean("wildcardSubscriptionAvailable", Some(true)),
    FieldSpec::boolean("subscriptionIdentifiersAvailable", Some(true)),
    FieldSpec::boolean("sharedSubscriptionAvailable", None),
    FieldSpec::int("maximumPacketSize", Some(0), None),
    FieldSpec::int("serverKeepAlive", None, None),
    FieldSpec::string("responseInformation"),
    FieldSpec::string("serverReference"),
    FieldSpec::string("assignedClientIdentifier"),
    FieldSpec::string("reasonString"),
    FieldSpec::user_properties("userProperties"),
];

/// Snapshot of what the server allows. Replaced on every CONNACK.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerProperties {
    pub topic_alias_maximum: Option<u16>,
    pub receive_maximum: Option<u32>,
    pub session_expiry_interval: Option<u32>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<bool>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
    pub maximum_packet_size: Option<u32>,
    pub server_keep_alive: Option<i64>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub assigned_client_identifier: Option<String>,
    pub reason_string: Option<String>,
    pub user_properties: Option<IndexMap<String, String>>,
}

fn narrow<T: TryFrom<i64>>(value: Option<i64>) -> Option<T> {
    value.and_then(|v| T::try_from(v).ok())
}

impl ServerProperties {
    /// Build from CONNACK properties; `None` yields the empty snapshot
    pub fn from_connack(properties: Option<&PropertyBag>) -> Self {
        let Some(source) = properties else {
            return Self::default();
        };
        let mut props = PropertyBag::new();
        copy_fields(source, &mut props, &CONNACK_SCHEMA);

        Self {
            topic_alias_maximum: narrow(props.get_int("topicAliasMaximum")),
            receive_maximum: narrow(props.get_int("receiveMaximum")),
            session_expiry_interval: narrow(props.get_int("sessionExpiryInterval")),
            maximum_qos: narrow(props.get_int("maximumQoS")),
            retain_available: props.get_bool("retainAvailable"),
            wildcard_subscription_available: props.get_bool("wildcardSubscriptionAvailable"),
            subscription_identifiers_available: props
                .get_bool("subscriptionIdentifiersAvailable"),
            shared_subscription_available: props.get_bool("sharedSubscriptionAvailable"),
            maximum_packet_size: narrow(props.get_int("maximumPacketSize")),
            server_keep_alive: props.get_int("serverKeepAlive"),
            response_information: props.get_str("responseInformation").map(str::to_string),
            server_reference: props.get_str("serverReference").map(str::to_string),
            assigned_client_identifier: props
                .get_str("assignedClientIdentifier")
                .map(str::to_string),
            reason_string: props.get_str("reasonString").map(str::to_string),
            user_properties: props.get_string_map("userProperties"),
        }
    }

    /// Subscription identifiers are used only when the server said so
    pub fn subscription_identifiers_available(&self) -> bool {
        self.subscription_identifiers_available == Some(true)
    }

    /// Largest topic alias the server accepts, 0 when aliases are off
    pub fn topic_alias_maximum(&self) -> u16 {
        self.topic_alias_maximum.unwrap_or(0)
    }
}
