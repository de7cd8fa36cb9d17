//! Credential linking with the team broker

pub mod api;
pub mod linker;
pub mod monitor;

pub use api::{ApiError, BrokerLinkApi, LinkOwner, LinkResult, TeamBrokerApi, TeamBrokerApiConfig};
pub use linker::{CredentialLinker, LinkError};
pub use monitor::{LinkCheck, LinkMonitor, LinkRetryPolicy, MonitoredLink};
