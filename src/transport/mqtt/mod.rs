//! rumqttc binding for the broker transport
//!
//! Split the same way as the rest of the transport code: pure decisions
//! first, I/O last.
//!
//! - [`connection`] - option building and poll pacing
//! - [`message_handler`] - translation of rumqttc events
//! - [`client`] - the spawned event loop and [`BrokerTransport`] impl
//!
//! [`BrokerTransport`]: crate::transport::BrokerTransport

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{RumqttcConnector, RumqttcTransport};
pub use connection::ReconnectConfig;
pub use message_handler::MessageHandler;
