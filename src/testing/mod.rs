//! Testing utilities and mock implementations
//!
//! Lets the shared broker and the consumers run without an MQTT broker or
//! the platform API.

pub mod mocks;

pub use mocks::*;

use crate::broker::{ConnectionStatus, SharedBroker};
use std::time::Duration;

/// How long the polling helpers wait before giving up
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait until the broker reports `status`
pub async fn wait_for_status(broker: &SharedBroker, status: ConnectionStatus) -> bool {
    let mut receiver = broker.subscribe_status();
    let reached = matches!(
        tokio::time::timeout(WAIT_TIMEOUT, receiver.wait_for(|current| *current == status)).await,
        Ok(Ok(_))
    );
    reached
}
