//! Team broker link API
//!
//! Registers this process's broker password with the platform so the team
//! broker accepts its connection.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Link API failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("Link API request failed: {0}")]
    Network(String),
    #[error("Link API timed out")]
    Timeout,
    #[error("Link API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Invalid link API response: {0}")]
    InvalidResponse(String),
    #[error("Link API not configured: {0}")]
    NotConfigured(String),
}

impl ApiError {
    /// Short error class name
    pub fn name(&self) -> &'static str {
        match self {
            ApiError::Network(_) => "RequestError",
            ApiError::Timeout => "TimeoutError",
            ApiError::Status { .. } => "HTTPError",
            ApiError::InvalidResponse(_) => "ParseError",
            ApiError::NotConfigured(_) => "ConfigError",
        }
    }

    /// HTTP status when there is one
    pub fn code(&self) -> String {
        match self {
            ApiError::Status { status, .. } => status.to_string(),
            ApiError::Timeout => "ETIMEDOUT".to_string(),
            _ => "unknown".to_string(),
        }
    }
}

/// Owner of a linked broker client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkOwner {
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Broker client record returned by the platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub acls: Vec<serde_json::Value>,
    #[serde(default)]
    pub owner: LinkOwner,
}

/// Operations the linker needs from the platform
#[async_trait]
pub trait BrokerLinkApi: Send + Sync {
    /// Link this client to the team broker with `password`
    async fn link(&self, password: &str) -> Result<LinkResult, ApiError>;

    /// Fetch the current broker client record
    async fn get_client(&self) -> Result<LinkResult, ApiError>;
}

#[derive(Debug, Clone)]
pub struct TeamBrokerApiConfig {
    pub forge_url: String,
    pub team_id: String,
    /// `{instance_type}:{instance_id}`
    pub owner_key: String,
    pub token: String,
    pub timeout: Duration,
}

/// HTTP implementation of [`BrokerLinkApi`]
pub struct TeamBrokerApi {
    config: TeamBrokerApiConfig,
    client: Client,
}

#[derive(Serialize)]
struct LinkRequest<'a> {
    password: &'a str,
}

impl TeamBrokerApi {
    pub fn new(config: TeamBrokerApiConfig) -> Result<Self, ApiError> {
        if config.forge_url.is_empty() {
            return Err(ApiError::NotConfigured("forge URL is required".to_string()));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// `{forge}/api/v1/teams/{team}/broker/client/{owner}`
    pub fn client_url(&self) -> String {
        format!(
            "{}/api/v1/teams/{}/broker/client/{}",
            self.config.forge_url.trim_end_matches('/'),
            self.config.team_id,
            self.config.owner_key
        )
    }

    fn request_error(e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            warn!(
                "Link API network error: {} (is_connect: {})",
                e,
                e.is_connect()
            );
            ApiError::Network(e.to_string())
        }
    }

    async fn parse_response(
        response: reqwest::Response,
        accepted: &[StatusCode],
    ) -> Result<LinkResult, ApiError> {
        let status = response.status();
        if !accepted.contains(&status) {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl BrokerLinkApi for TeamBrokerApi {
    async fn link(&self, password: &str) -> Result<LinkResult, ApiError> {
        let url = format!("{}/link", self.client_url());
        debug!(url = %url, "Linking to team broker client");
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.token)
            .json(&LinkRequest { password })
            .send()
            .await
            .map_err(Self::request_error)?;
        Self::parse_response(response, &[StatusCode::OK, StatusCode::CREATED]).await
    }

    async fn get_client(&self) -> Result<LinkResult, ApiError> {
        let response = self
            .client
            .get(self.client_url())
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(Self::request_error)?;
        Self::parse_response(response, &[StatusCode::OK]).await
    }
}
