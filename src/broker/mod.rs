//! The shared broker connection and everything it owns
//!
//! - [`state`] - connection state machine
//! - [`server_properties`] - CONNACK capability snapshot
//! - [`subscriptions`] - ref-counted subscription registry
//! - [`publish`] - outbound message normalization
//! - [`manager`] - [`SharedBroker`], which drives the transport

pub mod manager;
pub mod publish;
pub mod server_properties;
pub mod state;
pub mod subscriptions;

pub use manager::{BrokerError, ConnectOutcome, PublishOutcome, SharedBroker};
pub use publish::{prepare_publish, PublishError, TopicAliases};
pub use server_properties::ServerProperties;
pub use state::{ConnectionState, ConnectionStatus};
pub use subscriptions::{
    BrokerCommand, MessageCallback, SubscriptionError, SubscriptionRegistry, SubscriptionRequest,
};
