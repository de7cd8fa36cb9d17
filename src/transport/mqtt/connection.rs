//! Pure rumqttc option building
//!
//! Maps [`ConnectOptions`] onto rumqttc's v5 and v3.1.1 option types and
//! holds the retry pacing used by the event loop.

use crate::transport::options::{BrokerUrl, ConnectOptions, ProtocolVersion, UrlScheme, WillMessage};
use rumqttc::v5::mqttbytes::v5::{ConnectProperties, LastWill, LastWillProperties};
use rumqttc::Transport;
use std::time::Duration;
use tracing::warn;

/// Pacing between failed polls of the event loop
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed polls (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delay per attempt in milliseconds; the last entry is sustained
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from_period(Duration::from_millis(5000))
    }
}

impl ReconnectConfig {
    /// Constant delay equal to the configured reconnect period
    pub fn from_period(period: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: Vec::new(),
            sustained_delay: period.as_millis() as u64,
        }
    }

    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

pub fn v5_qos(qos: u8) -> rumqttc::v5::mqttbytes::QoS {
    use rumqttc::v5::mqttbytes::QoS;
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub fn v4_qos(qos: u8) -> rumqttc::QoS {
    use rumqttc::QoS;
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Host argument for `MqttOptions::new`; WebSocket transports take the whole URL
fn broker_address(url: &BrokerUrl) -> String {
    if url.is_websocket() {
        url.to_string()
    } else {
        url.host.clone()
    }
}

fn transport_for(url: &BrokerUrl) -> Transport {
    match url.scheme {
        UrlScheme::Mqtt => Transport::Tcp,
        UrlScheme::Mqtts => Transport::tls_with_default_config(),
        UrlScheme::Ws => Transport::Ws,
        UrlScheme::Wss => Transport::wss_with_default_config(),
    }
}

fn v5_last_will(will: &WillMessage) -> LastWill {
    let properties = will.properties.as_ref().map(|props| LastWillProperties {
        delay_interval: props.will_delay_interval,
        payload_format_indicator: None,
        message_expiry_interval: props.message_expiry_interval,
        content_type: props.content_type.clone(),
        response_topic: props.response_topic.clone(),
        correlation_data: props.correlation_data.clone(),
        user_properties: props.user_properties.clone(),
    });
    LastWill::new(
        &will.topic,
        will.payload.clone(),
        v5_qos(will.qos),
        will.retain,
        properties,
    )
}

/// CONNECT properties for the v5 client. rumqttc keeps these in one struct
/// that its individual setters also write into, so they are set together.
pub fn v5_connect_properties(options: &ConnectOptions) -> ConnectProperties {
    ConnectProperties {
        session_expiry_interval: options.session_expiry_interval,
        receive_maximum: None,
        max_packet_size: options.maximum_packet_size,
        topic_alias_max: options.topic_alias_maximum,
        request_response_info: options.request_response_information.then_some(1),
        request_problem_info: options.request_problem_information.then_some(1),
        user_properties: options.user_properties.clone(),
        authentication_method: None,
        authentication_data: None,
    }
}

/// Build options for the v5 client
pub fn configure_v5_options(url: &BrokerUrl, options: &ConnectOptions) -> rumqttc::v5::MqttOptions {
    let mut mqtt_options =
        rumqttc::v5::MqttOptions::new(options.client_id.clone(), broker_address(url), url.port);
    mqtt_options.set_transport(transport_for(url));
    mqtt_options.set_keep_alive(options.keepalive);
    mqtt_options.set_clean_start(options.clean_session);

    if let Some(username) = &options.username {
        mqtt_options.set_credentials(username.clone(), options.password.clone().unwrap_or_default());
    }
    mqtt_options.set_connect_properties(v5_connect_properties(options));
    if let Some(will) = &options.will {
        mqtt_options.set_last_will(v5_last_will(will));
    }
    mqtt_options
}

/// Build options for the v3.1.1 client
pub fn configure_v4_options(url: &BrokerUrl, options: &ConnectOptions) -> rumqttc::MqttOptions {
    if options.protocol == ProtocolVersion::V3 {
        warn!("MQIsdp 3.1 is not supported by the transport, connecting with 3.1.1");
    }
    let mut mqtt_options =
        rumqttc::MqttOptions::new(options.client_id.clone(), broker_address(url), url.port);
    mqtt_options.set_transport(transport_for(url));
    mqtt_options.set_keep_alive(options.keepalive);
    mqtt_options.set_clean_session(options.clean_session);

    if let Some(username) = &options.username {
        mqtt_options.set_credentials(username.clone(), options.password.clone().unwrap_or_default());
    }
    if let Some(max) = options.maximum_packet_size {
        mqtt_options.set_max_packet_size(max as usize, max as usize);
    }
    if let Some(will) = &options.will {
        mqtt_options.set_last_will(rumqttc::LastWill::new(
            &will.topic,
            will.payload.clone(),
            v4_qos(will.qos),
            will.retain,
        ));
    }
    mqtt_options
}
