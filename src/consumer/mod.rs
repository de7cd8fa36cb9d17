//! Consumers of the shared connection
//!
//! A consumer is one logical user of [`SharedBroker`]: [`MqttIn`] receives
//! messages and manages its subscriptions, [`MqttOut`] publishes. Both accept
//! the `connect` and `disconnect` actions.

pub mod publisher;
pub mod subscriber;

pub use publisher::{MqttOut, PublisherConfig};
pub use subscriber::{DynamicSubscription, MqttIn, SubscriberAction, SubscriberConfig, UnsubscribeTarget};

use crate::broker::{BrokerError, ConnectOutcome, PublishError, PublishOutcome, SharedBroker};
use crate::protocol::{DecodeError, InboundMessage};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// What a subscriber's sink receives for every routed message
pub type Delivery = Result<InboundMessage, DecodeError>;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Invalid action: {0}")]
    InvalidAction(String),
    #[error("Invalid topic specified: {0:?}")]
    InvalidTopic(String),
    #[error("Invalid subscription request")]
    BadSubscription,
    #[error(transparent)]
    Publish(PublishError),
    #[error(transparent)]
    Broker(BrokerError),
}

impl ConsumerError {
    pub fn is_warning(&self) -> bool {
        match self {
            ConsumerError::Publish(e) => e.is_warning(),
            ConsumerError::Broker(e) => e.is_warning(),
            _ => false,
        }
    }
}

impl From<BrokerError> for ConsumerError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::Publish(e) => ConsumerError::Publish(e),
            other => ConsumerError::Broker(other),
        }
    }
}

/// Result of a handled consumer input
#[derive(Debug)]
pub enum ActionOutcome {
    Done,
    /// A connect started; resolves on its first CONNACK
    Connecting(oneshot::Receiver<()>),
    /// Current dynamic subscriptions
    Subscriptions(Vec<DynamicSubscription>),
    Published(PublishOutcome),
}

/// `connect` action: start a connection unless one is active
pub(crate) async fn connect_action(broker: &SharedBroker) -> Result<ActionOutcome, ConsumerError> {
    if !broker.can_connect().await {
        debug!("Connect action ignored, already connected or connecting");
        return Ok(ActionOutcome::Done);
    }
    match broker.connect().await? {
        ConnectOutcome::Started(receiver) => Ok(ActionOutcome::Connecting(receiver)),
        ConnectOutcome::AlreadyActive => Ok(ActionOutcome::Done),
    }
}

/// `disconnect` action
pub(crate) async fn disconnect_action(broker: &SharedBroker) -> Result<ActionOutcome, ConsumerError> {
    broker.disconnect().await;
    Ok(ActionOutcome::Done)
}
