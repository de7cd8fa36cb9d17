//! Configuration for the shared broker connection
//!
//! Loaded from TOML. Secrets never live in the file: `token_env` and
//! `password_env` name environment variables that are read at runtime.

use crate::protocol::properties::PropertyValue;
use crate::protocol::{ClientIdentity, InstanceKind, OutboundMessage, Payload, PropertyBag};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub platform: PlatformSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub link: LinkSection,
}

/// Platform identity and the link API endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformSection {
    /// Base URL of the platform API
    pub forge_url: String,
    pub team_id: String,
    pub instance_type: InstanceKind,
    pub instance_id: String,
    /// Short replica id for hosted instances running in HA mode
    pub ha_id: Option<String>,
    /// Environment variable holding the platform bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,
}

fn default_token_env() -> String {
    "FORGE_TEAM_TOKEN".to_string()
}

fn default_api_timeout_ms() -> u64 {
    5000
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Full broker URL; wins over `host`/`port`
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_true")]
    pub verify_server_cert: bool,
    /// Environment variable holding the broker password
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
    /// Force the MQIsdp 3.1 handshake
    #[serde(default)]
    pub compat_mode: bool,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period_ms: u64,
    pub session_expiry_interval: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    #[serde(default)]
    pub user_properties: IndexMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_true")]
    pub auto_unsubscribe: bool,
    pub birth: Option<MessageTemplate>,
    pub close: Option<MessageTemplate>,
    pub will: Option<MessageTemplate>,
}

fn default_true() -> bool {
    true
}

fn default_password_env() -> String {
    "FORGE_BROKER_PASSWORD".to_string()
}

fn default_protocol_version() -> u8 {
    5
}

fn default_keepalive() -> u64 {
    60
}

fn default_reconnect_period() -> u64 {
    5000
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: None,
            use_tls: false,
            verify_server_cert: true,
            password_env: default_password_env(),
            protocol_version: default_protocol_version(),
            compat_mode: false,
            keepalive_secs: default_keepalive(),
            clean_session: true,
            reconnect_period_ms: default_reconnect_period(),
            session_expiry_interval: None,
            topic_alias_maximum: None,
            maximum_packet_size: None,
            user_properties: IndexMap::new(),
            auto_connect: true,
            auto_unsubscribe: true,
            birth: None,
            close: None,
            will: None,
        }
    }
}

impl BrokerSection {
    /// Connect-level user properties as string pairs
    pub fn user_property_pairs(&self) -> Vec<(String, String)> {
        self.user_properties
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect()
    }
}

/// Birth, close or will message
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageTemplate {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<String>,
    pub message_expiry_interval: Option<i64>,
    /// Only meaningful for the will
    pub will_delay_interval: Option<i64>,
    #[serde(default)]
    pub user_properties: IndexMap<String, serde_json::Value>,
}

impl MessageTemplate {
    /// v5 fields under their wire names, ready for the property codec
    pub fn property_bag(&self) -> PropertyBag {
        let mut props = PropertyBag::new();
        if let Some(content_type) = &self.content_type {
            props.insert("contentType".into(), content_type.as_str().into());
        }
        if let Some(response_topic) = &self.response_topic {
            props.insert("responseTopic".into(), response_topic.as_str().into());
        }
        if let Some(correlation_data) = &self.correlation_data {
            props.insert(
                "correlationData".into(),
                PropertyValue::Bytes(correlation_data.clone().into_bytes().into()),
            );
        }
        if let Some(expiry) = self.message_expiry_interval {
            props.insert("messageExpiryInterval".into(), expiry.into());
        }
        if let Some(delay) = self.will_delay_interval {
            props.insert("willDelayInterval".into(), delay.into());
        }
        if !self.user_properties.is_empty() {
            let map = self
                .user_properties
                .iter()
                .map(|(k, v)| (k.clone(), PropertyValue::from(v.clone())))
                .collect();
            props.insert("userProperties".into(), PropertyValue::Map(map));
        }
        props
    }

    /// The template as a publishable message, `None` without a topic
    pub fn to_outbound(&self) -> Option<OutboundMessage> {
        if self.topic.trim().is_empty() {
            return None;
        }
        Some(OutboundMessage {
            topic: Some(self.topic.clone()),
            payload: Some(Payload::Text(self.payload.clone())),
            qos: Some(PropertyValue::Int(i64::from(self.qos))),
            retain: Some(PropertyValue::Bool(self.retain)),
            properties: self.property_bag(),
            action: None,
        })
    }
}

/// Link-health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_monitor_min")]
    pub monitor_min_secs: u64,
    #[serde(default = "default_monitor_max")]
    pub monitor_max_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_monitor_min() -> u64 {
    55
}

fn default_monitor_max() -> u64 {
    65
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            monitor_min_secs: default_monitor_min(),
            monitor_max_secs: default_monitor_max(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_string()));

        if self.platform.team_id.trim().is_empty() {
            return invalid("platform.team_id is required");
        }
        if self.platform.instance_id.trim().is_empty() {
            return invalid("platform.instance_id is required");
        }
        if self.platform.forge_url.trim().is_empty() {
            return invalid("platform.forge_url is required");
        }
        let has_url = self.broker.url.as_deref().is_some_and(|u| !u.trim().is_empty());
        let has_host = self.broker.host.as_deref().is_some_and(|h| !h.trim().is_empty());
        if !has_url && !has_host {
            return invalid("broker.url or broker.host is required");
        }
        if !matches!(self.broker.protocol_version, 3..=5) {
            return Err(ConfigError::InvalidConfig(format!(
                "Unsupported broker.protocol_version {}",
                self.broker.protocol_version
            )));
        }
        if self.link.monitor_min_secs == 0 {
            return invalid("link.monitor_min_secs must be positive");
        }
        if self.link.monitor_min_secs > self.link.monitor_max_secs {
            return invalid("link.monitor_min_secs must not exceed link.monitor_max_secs");
        }
        Ok(())
    }

    /// Identity strings derived from the platform section
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(
            self.platform.team_id.clone(),
            self.platform.instance_type,
            self.platform.instance_id.clone(),
        )
        .with_ha_id(self.platform.ha_id.clone())
    }

    fn get_env_var_optional(env_var_name: &str) -> Option<String> {
        std::env::var(env_var_name).ok().filter(|v| !v.is_empty())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        Self::get_env_var_optional(env_var_name)
            .ok_or_else(|| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Platform bearer token from the environment
    pub fn get_platform_token(&self) -> Result<String, ConfigError> {
        Self::get_env_var_required(&self.platform.token_env)
    }

    /// Broker password from the environment
    pub fn get_broker_password(&self) -> Result<String, ConfigError> {
        Self::get_env_var_required(&self.broker.password_env)
    }

    /// Configuration used by unit tests
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[platform]
forge_url = "http://localhost:3000"
team_id = "team1"
instance_type = "device"
instance_id = "dev1"

[broker]
url = "mqtt://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[platform]
forge_url = "https://forge.example.com"
team_id = "team1"
instance_type = "instance"
instance_id = "proj1"
ha_id = "ab12"
token_env = "MY_TOKEN"
api_timeout_ms = 2000

[broker]
host = "broker.example.com"
port = 8883
use_tls = true
protocol_version = 4
keepalive_secs = 30
auto_unsubscribe = false

[broker.user_properties]
region = "eu"
replicas = 2

[broker.will]
topic = "status"
payload = "gone"
qos = 1
retain = true
will_delay_interval = 5

[link]
max_attempts = 3
"#;

        let config = AppConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.platform.instance_type, InstanceKind::Instance);
        assert_eq!(config.platform.api_timeout_ms, 2000);
        assert_eq!(config.broker.port, Some(8883));
        assert_eq!(config.broker.protocol_version, 4);
        assert!(!config.broker.auto_unsubscribe);
        assert!(config.broker.auto_connect);
        assert_eq!(
            config.broker.user_property_pairs(),
            vec![
                ("region".to_string(), "eu".to_string()),
                ("replicas".to_string(), "2".to_string())
            ]
        );
        assert_eq!(config.broker.will.as_ref().unwrap().will_delay_interval, Some(5));
        assert_eq!(config.link.max_attempts, 3);
        assert_eq!(config.link.monitor_min_secs, 55);
        assert_eq!(config.identity().client_id(), "mq:hosted:team1:proj1:ab12");
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = AppConfig::test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.broker.protocol_version, 5);
        assert_eq!(config.broker.keepalive_secs, 60);
        assert_eq!(config.broker.reconnect_period_ms, 5000);
        assert!(config.broker.clean_session);
        assert!(config.broker.auto_unsubscribe);
        assert_eq!(config.link, LinkSection::default());
        assert_eq!(config.platform.api_timeout_ms, 5000);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AppConfig::test_config();
        config.broker.url = None;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        let mut config = AppConfig::test_config();
        config.broker.protocol_version = 6;
        assert!(config.validate().is_err());

        let mut config = AppConfig::test_config();
        config.link.monitor_min_secs = 70;
        assert!(config.validate().is_err());

        let mut config = AppConfig::test_config();
        config.link.monitor_min_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::test_config();
        config.platform.team_id = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_env_var() {
        let mut config = AppConfig::test_config();
        config.broker.password_env = "TEAM_MQTT_TEST_UNSET_VARIABLE".into();
        assert!(matches!(
            config.get_broker_password(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "TEAM_MQTT_TEST_UNSET_VARIABLE"
        ));
    }

    #[test]
    fn test_template_property_bag() {
        let template = MessageTemplate {
            topic: "t".into(),
            content_type: Some("application/json".into()),
            message_expiry_interval: Some(30),
            ..MessageTemplate::default()
        };
        let props = template.property_bag();
        assert_eq!(props.len(), 2);
        assert!(props.contains_key("contentType"));
        assert!(props.contains_key("messageExpiryInterval"));
    }
}
