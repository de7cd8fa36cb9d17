//! Team MQTT - one broker connection, many consumers
//!
//! A multiplexed MQTT client core. Independent consumers register with a
//! single [`SharedBroker`], subscribe and publish through it, and never see
//! the connection lifecycle underneath.
//!
//! # Overview
//!
//! - [`protocol`] - topic matching, the v5 property codec, payload decoding
//! - [`link`] - credential linking against the team platform API
//! - [`transport`] - transport traits and the rumqttc binding
//! - [`broker`] - connection state machine, subscription registry, publish path
//! - [`consumer`] - `MqttIn` and `MqttOut`
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use team_mqtt::config::AppConfig;
//! use team_mqtt::consumer::{MqttIn, SubscriberConfig};
//! use team_mqtt::SharedBroker;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load_from_file(Path::new("team-mqtt.toml"))?;
//! let broker = SharedBroker::from_config(config)?;
//!
//! let (sink, mut messages) = tokio::sync::mpsc::unbounded_channel();
//! let consumer = MqttIn::new(SubscriberConfig::new("sensors", "sensors/#"), broker, sink)?;
//! consumer.start().await?;
//!
//! while let Some(Ok(message)) = messages.recv().await {
//!     println!("{} {:?}", message.topic, message.payload);
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod link;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use broker::{ConnectionState, ConnectionStatus, SharedBroker};
pub use config::{AppConfig, ConfigError};
pub use consumer::{ConsumerError, MqttIn, MqttOut, PublisherConfig, SubscriberConfig};
pub use error::{CoreError, CoreResult};
pub use protocol::{DataType, InboundMessage, OutboundMessage, Payload};
