//! Credential linker with coalesced in-flight requests

use super::api::{ApiError, BrokerLinkApi, LinkResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    #[error("Failed to link to team broker: {name} ({code})")]
    Failed {
        name: String,
        code: String,
        #[source]
        source: ApiError,
    },
}

impl From<ApiError> for LinkError {
    fn from(source: ApiError) -> Self {
        LinkError::Failed {
            name: source.name().to_string(),
            code: source.code(),
            source,
        }
    }
}

type LinkFuture = Shared<BoxFuture<'static, Result<LinkResult, ApiError>>>;

#[derive(Default)]
struct LinkState {
    in_flight: Option<LinkFuture>,
    linked: bool,
    link_failed: bool,
}

/// Links this client's broker password with the platform.
///
/// At most one request is in flight; concurrent callers await the same
/// outcome. `linked` and `link_failed` are never both true.
pub struct CredentialLinker {
    api: Arc<dyn BrokerLinkApi>,
    password: String,
    state: Mutex<LinkState>,
}

impl CredentialLinker {
    pub fn new(api: Arc<dyn BrokerLinkApi>, password: impl Into<String>) -> Self {
        Self {
            api,
            password: password.into(),
            state: Mutex::new(LinkState::default()),
        }
    }

    pub async fn link(&self) -> Result<LinkResult, LinkError> {
        let future = {
            let mut state = self.state.lock().await;
            match &state.in_flight {
                Some(existing) => {
                    debug!("Link already in flight, joining it");
                    existing.clone()
                }
                None => {
                    let api = Arc::clone(&self.api);
                    let password = self.password.clone();
                    let future = async move { api.link(&password).await }.boxed().shared();
                    state.in_flight = Some(future.clone());
                    future
                }
            }
        };

        let result = future.clone().await;

        let mut state = self.state.lock().await;
        if state
            .in_flight
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&future))
        {
            state.in_flight = None;
        }
        match result {
            Ok(link) => {
                state.linked = true;
                state.link_failed = false;
                info!(client = %link.id, "Linked to team broker");
                Ok(link)
            }
            Err(source) => {
                state.linked = false;
                state.link_failed = true;
                Err(LinkError::from(source))
            }
        }
    }

    /// Wait for an in-flight link, if any, ignoring its outcome
    pub async fn wait_in_flight(&self) {
        let in_flight = self.state.lock().await.in_flight.clone();
        if let Some(future) = in_flight {
            let _ = future.await;
        }
    }

    pub async fn is_linked(&self) -> bool {
        self.state.lock().await.linked
    }

    pub async fn link_failed(&self) -> bool {
        self.state.lock().await.link_failed
    }

    /// Fetch the current broker client record
    pub async fn client_info(&self) -> Result<LinkResult, LinkError> {
        Ok(self.api.get_client().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockLinkApi;
    use std::time::Duration;

    #[tokio::test]
    async fn test_successful_link_sets_flags() {
        let api = Arc::new(MockLinkApi::new());
        let linker = CredentialLinker::new(api.clone(), "pw");

        assert!(!linker.is_linked().await);
        linker.link().await.unwrap();
        assert!(linker.is_linked().await);
        assert!(!linker.link_failed().await);
        assert_eq!(api.passwords().await, vec!["pw".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_link_sets_flags_and_message() {
        let api = Arc::new(MockLinkApi::new());
        api.fail_with(ApiError::Status {
            status: 401,
            message: "denied".into(),
        })
        .await;
        let linker = CredentialLinker::new(api, "pw");

        let err = linker.link().await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to link to team broker: HTTPError (401)");
        assert!(!linker.is_linked().await);
        assert!(linker.link_failed().await);
    }

    #[tokio::test]
    async fn test_concurrent_links_share_one_request() {
        let api = Arc::new(MockLinkApi::new().with_delay(Duration::from_millis(50)));
        let linker = Arc::new(CredentialLinker::new(api.clone(), "pw"));

        let a = tokio::spawn({
            let linker = Arc::clone(&linker);
            async move { linker.link().await }
        });
        let b = tokio::spawn({
            let linker = Arc::clone(&linker);
            async move { linker.link().await }
        });

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(api.link_calls().await, 1);

        linker.link().await.unwrap();
        assert_eq!(api.link_calls().await, 2);
    }
}
