//! Pure connection option building
//!
//! Turns configuration into a [`BrokerUrl`] and [`ConnectOptions`] without
//! touching the network, so every rule here is unit tested.

use super::TransportError;
use crate::config::{BrokerSection, MessageTemplate};
use crate::protocol::properties::{copy_fields, FieldSpec, PropertyBag, PropertyBagExt};
use crate::protocol::ClientIdentity;
use bytes::Bytes;
use std::fmt;
use std::net::Ipv6Addr;
use std::time::Duration;
use tracing::warn;
use url::{Host, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlScheme {
    Mqtt,
    Mqtts,
    Ws,
    Wss,
}

impl UrlScheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "mqtt" | "tcp" => Some(UrlScheme::Mqtt),
            "mqtts" | "ssl" | "tls" => Some(UrlScheme::Mqtts),
            "ws" => Some(UrlScheme::Ws),
            "wss" => Some(UrlScheme::Wss),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            UrlScheme::Mqtt => 1883,
            UrlScheme::Mqtts => 8883,
            UrlScheme::Ws => 80,
            UrlScheme::Wss => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UrlScheme::Mqtt => "mqtt",
            UrlScheme::Mqtts => "mqtts",
            UrlScheme::Ws => "ws",
            UrlScheme::Wss => "wss",
        }
    }
}

/// Where the shared connection goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    pub scheme: UrlScheme,
    /// Host without IPv6 brackets
    pub host: String,
    pub port: u16,
    /// Request path, only meaningful for WebSocket transports
    pub path: String,
}

impl BrokerUrl {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidBrokerUrl(raw.to_string());
        let url = Url::parse(raw).map_err(|_| invalid())?;
        let scheme = UrlScheme::parse(url.scheme()).ok_or_else(invalid)?;
        let host = match url.host().ok_or_else(invalid)? {
            Host::Domain(domain) => domain.to_string(),
            Host::Ipv4(addr) => addr.to_string(),
            Host::Ipv6(addr) => addr.to_string(),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        Ok(Self {
            scheme,
            host,
            port,
            path: url.path().to_string(),
        })
    }

    /// Build from a bare host and port. An empty host means `localhost`.
    pub fn from_host(host: &str, port: Option<u16>, use_tls: bool) -> Self {
        let scheme = if use_tls {
            UrlScheme::Mqtts
        } else {
            UrlScheme::Mqtt
        };
        let host = host.trim();
        let host = if host.is_empty() {
            "localhost".to_string()
        } else {
            host.trim_start_matches('[').trim_end_matches(']').to_string()
        };
        Self {
            scheme,
            host,
            port: port.unwrap_or_else(|| scheme.default_port()),
            path: "/".to_string(),
        }
    }

    /// Pick the URL from settings: an explicit url wins, then a host that is
    /// itself a URL, then host and port.
    pub fn resolve(
        url: Option<&str>,
        host: Option<&str>,
        port: Option<u16>,
        use_tls: bool,
    ) -> Result<Self, TransportError> {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            return Self::parse(url.trim());
        }
        let host = host.unwrap_or_default();
        if host.contains("://") {
            return Self::parse(host);
        }
        Ok(Self::from_host(host, port, use_tls))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.scheme, UrlScheme::Mqtts | UrlScheme::Wss)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.scheme, UrlScheme::Ws | UrlScheme::Wss)
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        write!(f, "{}://{}:{}", self.scheme.as_str(), host, self.port)?;
        if self.is_websocket() {
            f.write_str(&self.path)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// MQIsdp 3.1 compatibility mode
    V3,
    V4,
    V5,
}

impl ProtocolVersion {
    pub fn from_settings(version: u8, compat_mode: bool) -> Self {
        if compat_mode || version == 3 {
            ProtocolVersion::V3
        } else if version == 5 {
            ProtocolVersion::V5
        } else {
            ProtocolVersion::V4
        }
    }

    pub fn is_v5(&self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WillProperties {
    pub will_delay_interval: Option<u32>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
}

/// Last will registered with the broker at connect time
#[derive(Debug, Clone, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    pub properties: Option<WillProperties>,
}

const WILL_SCHEMA: [FieldSpec; 6] = [
    FieldSpec::string("contentType"),
    FieldSpec::string("responseTopic"),
    FieldSpec::bytes("correlationData"),
    FieldSpec::int("messageExpiryInterval", Some(0), Some(u32::MAX as i64)),
    FieldSpec::int("willDelayInterval", Some(0), Some(u32::MAX as i64)),
    FieldSpec::user_properties("userProperties"),
];

impl WillMessage {
    /// Build the will from its template. Malformed v5 fields are dropped.
    pub fn from_template(template: &MessageTemplate, v5: bool) -> Option<Self> {
        if template.topic.trim().is_empty() {
            return None;
        }
        let properties = v5.then(|| {
            let mut props = PropertyBag::new();
            copy_fields(&template.property_bag(), &mut props, &WILL_SCHEMA);
            WillProperties {
                will_delay_interval: to_u32(props.get_int("willDelayInterval")),
                message_expiry_interval: to_u32(props.get_int("messageExpiryInterval")),
                content_type: props.get_str("contentType").map(str::to_string),
                response_topic: props.get_str("responseTopic").map(str::to_string),
                correlation_data: props.get_bytes("correlationData").cloned(),
                user_properties: props
                    .get_string_map("userProperties")
                    .map(|m| m.into_iter().collect())
                    .unwrap_or_default(),
            }
        });
        Some(Self {
            topic: template.topic.clone(),
            payload: Bytes::from(template.payload.clone()),
            qos: template.qos.min(2),
            retain: template.retain,
            properties,
        })
    }
}

fn to_u32(value: Option<i64>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

/// Everything the transport needs to open the connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
    pub clean_session: bool,
    pub reconnect_period: Duration,
    pub protocol: ProtocolVersion,
    pub session_expiry_interval: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub request_response_information: bool,
    pub request_problem_information: bool,
    pub user_properties: Vec<(String, String)>,
    pub will: Option<WillMessage>,
    pub verify_server_cert: bool,
}

impl ConnectOptions {
    /// Build options for this identity from the broker settings
    pub fn build(identity: &ClientIdentity, broker: &BrokerSection, password: Option<String>) -> Self {
        let protocol = ProtocolVersion::from_settings(broker.protocol_version, broker.compat_mode);
        let v5 = protocol.is_v5();
        let client_id = identity.client_id();

        let mut clean_session = broker.clean_session;
        if !clean_session && client_id.is_empty() {
            warn!("Clean session disabled without a client id, forcing clean session");
            clean_session = true;
        }

        let will = broker
            .will
            .as_ref()
            .and_then(|template| WillMessage::from_template(template, v5));

        Self {
            client_id,
            username: Some(identity.auth_id()),
            password,
            keepalive: Duration::from_secs(broker.keepalive_secs),
            clean_session,
            reconnect_period: Duration::from_millis(broker.reconnect_period_ms),
            protocol,
            session_expiry_interval: broker.session_expiry_interval.filter(|_| v5),
            topic_alias_maximum: broker.topic_alias_maximum.filter(|max| v5 && *max > 0),
            maximum_packet_size: broker.maximum_packet_size,
            request_response_information: v5,
            request_problem_information: v5,
            user_properties: if v5 {
                broker.user_property_pairs()
            } else {
                Vec::new()
            },
            will,
            verify_server_cert: broker.verify_server_cert,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSection;
    use crate::protocol::InstanceKind;

    fn identity() -> ClientIdentity {
        ClientIdentity::new("team1", InstanceKind::Device, "dev1")
    }

    #[test]
    fn test_parse_urls() {
        let url = BrokerUrl::parse("mqtts://broker.example.com").unwrap();
        assert_eq!(url.scheme, UrlScheme::Mqtts);
        assert_eq!(url.port, 8883);
        assert!(url.is_tls());

        let url = BrokerUrl::parse("ws://broker.example.com:9001/mqtt").unwrap();
        assert!(url.is_websocket());
        assert_eq!(url.to_string(), "ws://broker.example.com:9001/mqtt");

        let url = BrokerUrl::parse("mqtt://[::1]:1884").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.to_string(), "mqtt://[::1]:1884");

        assert!(BrokerUrl::parse("http://broker").is_err());
        assert!(BrokerUrl::parse("not a url").is_err());
    }

    #[test]
    fn test_resolve_prefers_url_then_host() {
        let url = BrokerUrl::resolve(Some("mqtt://a:1"), Some("b"), Some(2), false).unwrap();
        assert_eq!(url.host, "a");

        let url = BrokerUrl::resolve(None, Some("wss://b/mqtt"), None, false).unwrap();
        assert_eq!(url.scheme, UrlScheme::Wss);
        assert_eq!(url.port, 443);

        let url = BrokerUrl::resolve(Some(""), Some(""), None, false).unwrap();
        assert_eq!(url.to_string(), "mqtt://localhost:1883");

        let url = BrokerUrl::resolve(None, Some("fe80::1"), Some(1999), true).unwrap();
        assert_eq!(url.to_string(), "mqtts://[fe80::1]:1999");
    }

    #[test]
    fn test_protocol_selection() {
        assert_eq!(ProtocolVersion::from_settings(5, false), ProtocolVersion::V5);
        assert_eq!(ProtocolVersion::from_settings(5, true), ProtocolVersion::V3);
        assert_eq!(ProtocolVersion::from_settings(3, false), ProtocolVersion::V3);
        assert_eq!(ProtocolVersion::from_settings(4, false), ProtocolVersion::V4);
    }

    #[test]
    fn test_connect_options_for_v5() {
        let broker = BrokerSection {
            url: Some("mqtt://localhost:1883".into()),
            topic_alias_maximum: Some(10),
            session_expiry_interval: Some(60),
            ..BrokerSection::default()
        };
        let options = ConnectOptions::build(&identity(), &broker, Some("secret".into()));

        assert_eq!(options.client_id, "mq:remote:team1:dev1");
        assert_eq!(options.username.as_deref(), Some("mq:remote:team1:dev1"));
        assert_eq!(options.password.as_deref(), Some("secret"));
        assert_eq!(options.keepalive, Duration::from_secs(60));
        assert!(options.request_response_information);
        assert!(options.request_problem_information);
        assert_eq!(options.topic_alias_maximum, Some(10));
        assert_eq!(options.session_expiry_interval, Some(60));
    }

    #[test]
    fn test_connect_options_for_v4_drop_v5_fields() {
        let broker = BrokerSection {
            protocol_version: 4,
            topic_alias_maximum: Some(10),
            session_expiry_interval: Some(60),
            ..BrokerSection::default()
        };
        let options = ConnectOptions::build(&identity(), &broker, None);

        assert_eq!(options.protocol, ProtocolVersion::V4);
        assert!(!options.request_response_information);
        assert_eq!(options.topic_alias_maximum, None);
        assert_eq!(options.session_expiry_interval, None);
    }

    #[test]
    fn test_will_message_properties() {
        let template = MessageTemplate {
            topic: "status".into(),
            payload: "offline".into(),
            qos: 1,
            retain: true,
            content_type: Some("text/plain".into()),
            correlation_data: Some("abc".into()),
            message_expiry_interval: Some(-5),
            will_delay_interval: Some(10),
            ..MessageTemplate::default()
        };

        let will = WillMessage::from_template(&template, true).unwrap();
        let props = will.properties.unwrap();
        assert_eq!(will.payload, Bytes::from("offline"));
        assert_eq!(props.content_type.as_deref(), Some("text/plain"));
        assert_eq!(props.correlation_data, Some(Bytes::from("abc")));
        assert_eq!(props.message_expiry_interval, None);
        assert_eq!(props.will_delay_interval, Some(10));

        let v4 = WillMessage::from_template(&template, false).unwrap();
        assert!(v4.properties.is_none());

        let empty = MessageTemplate::default();
        assert!(WillMessage::from_template(&empty, true).is_none());
    }
}
