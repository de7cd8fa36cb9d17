//! Transport layer for the shared broker connection
//!
//! The connection manager never talks to an MQTT library directly. It opens
//! a [`BrokerTransport`] through a [`TransportConnector`] and consumes the
//! lifecycle as a stream of [`TransportEvent`]s, which keeps the manager
//! testable against the in-memory transport in [`crate::testing`].

use crate::protocol::PropertyBag;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;
pub mod options;

pub use options::{BrokerUrl, ConnectOptions, ProtocolVersion, UrlScheme, WillMessage};

/// Errors raised by a transport binding
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Transport closed")]
    Closed,
}

/// v5 properties attached to an outgoing PUBLISH
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    pub payload_format_indicator: Option<bool>,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
    pub content_type: Option<String>,
}

/// A fully validated publish handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    /// Empty when a bound topic alias stands in for the topic
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    /// `None` for v3/v4 connections
    pub properties: Option<PublishProperties>,
}

/// Subscription options sent with a SUBSCRIBE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub qos: u8,
    pub no_local: Option<bool>,
    pub retain_as_published: Option<bool>,
    pub retain_handling: Option<u8>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            qos: 1,
            no_local: None,
            retain_as_published: None,
            retain_handling: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub filter: String,
    pub options: SubscribeOptions,
    /// Omitted when the server does not support subscription identifiers
    pub subscription_identifier: Option<u32>,
}

/// A PUBLISH received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    /// v5 properties under their wire names; `None` on v3/v4
    pub properties: Option<PropertyBag>,
    pub subscription_identifiers: Vec<u32>,
}

impl InboundPacket {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
            properties: None,
            subscription_identifiers: Vec::new(),
        }
    }
}

/// Lifecycle and data events emitted by an open transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// CONNACK received; carries the v5 CONNACK properties when present
    Connected { properties: Option<PropertyBag> },
    /// The transport is about to retry the connection
    Reconnecting,
    /// The broker sent a protocol-level DISCONNECT
    Disconnect {
        reason_code: String,
        reason_string: Option<String>,
    },
    /// The network connection closed
    Closed,
    /// A transport error; reconnect is handled by the transport itself
    Error(String),
    Message(InboundPacket),
}

/// Operations on one open broker connection
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn publish(&self, request: PublishRequest) -> Result<(), TransportError>;

    /// End the connection. `force` skips the graceful DISCONNECT handshake.
    async fn end(&self, force: bool) -> Result<(), TransportError>;
}

/// Opened transport plus its event stream
pub type TransportHandle = (Arc<dyn BrokerTransport>, mpsc::Receiver<TransportEvent>);

/// Opens transports. The connection manager holds exactly one open transport
/// at a time.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        url: &BrokerUrl,
        options: &ConnectOptions,
    ) -> Result<TransportHandle, TransportError>;
}
