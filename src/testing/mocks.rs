//! Mock implementations for testing
//!
//! Provides an in-memory transport/connector pair and a link API so the
//! shared broker can be driven without a broker or the platform.

use super::WAIT_TIMEOUT;
use crate::link::{ApiError, BrokerLinkApi, LinkOwner, LinkResult};
use crate::transport::{
    BrokerTransport, BrokerUrl, ConnectOptions, PublishRequest, SubscribeRequest,
    TransportConnector, TransportError, TransportEvent, TransportHandle,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// One call made on a [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOp {
    Subscribe(SubscribeRequest),
    Unsubscribe(String),
    Publish(PublishRequest),
    End { force: bool },
}

/// Records every operation and lets tests inject transport events
#[derive(Debug)]
pub struct MockTransport {
    ops: Mutex<Vec<TransportOp>>,
    events: mpsc::Sender<TransportEvent>,
    end_delay: Option<Duration>,
}

impl MockTransport {
    fn new(events: mpsc::Sender<TransportEvent>, end_delay: Option<Duration>) -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            events,
            end_delay,
        }
    }

    /// Push an event as if the broker produced it
    pub async fn emit(&self, event: TransportEvent) {
        // the receiver is gone once the session is superseded
        let _ = self.events.send(event).await;
    }

    pub async fn ops(&self) -> Vec<TransportOp> {
        self.ops.lock().await.clone()
    }

    pub async fn subscribes(&self) -> Vec<SubscribeRequest> {
        self.ops
            .lock()
            .await
            .iter()
            .filter_map(|op| match op {
                TransportOp::Subscribe(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn unsubscribes(&self) -> Vec<String> {
        self.ops
            .lock()
            .await
            .iter()
            .filter_map(|op| match op {
                TransportOp::Unsubscribe(filter) => Some(filter.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn publishes(&self) -> Vec<PublishRequest> {
        self.ops
            .lock()
            .await
            .iter()
            .filter_map(|op| match op {
                TransportOp::Publish(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn ends(&self) -> Vec<bool> {
        self.ops
            .lock()
            .await
            .iter()
            .filter_map(|op| match op {
                TransportOp::End { force } => Some(*force),
                _ => None,
            })
            .collect()
    }

    pub async fn clear(&self) {
        self.ops.lock().await.clear();
    }

    /// Poll the recorded operations until `predicate` holds or the wait
    /// times out
    pub async fn wait_for(&self, predicate: impl Fn(&[TransportOp]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if predicate(&self.ops.lock().await) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn record(&self, op: TransportOp) {
        self.ops.lock().await.push(op);
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<(), TransportError> {
        self.record(TransportOp::Subscribe(request)).await;
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.record(TransportOp::Unsubscribe(filter.to_string())).await;
        Ok(())
    }

    async fn publish(&self, request: PublishRequest) -> Result<(), TransportError> {
        self.record(TransportOp::Publish(request)).await;
        Ok(())
    }

    async fn end(&self, force: bool) -> Result<(), TransportError> {
        self.record(TransportOp::End { force }).await;
        if !force {
            if let Some(delay) = self.end_delay {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    transports: Vec<Arc<MockTransport>>,
    attempts: Vec<(BrokerUrl, ConnectOptions)>,
    fail: bool,
}

/// Hands out a fresh [`MockTransport`] per connect
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    end_delay: Option<Duration>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graceful ends take `delay` before returning
    pub fn with_end_delay(mut self, delay: Duration) -> Self {
        self.end_delay = Some(delay);
        self
    }

    /// Make subsequent connects fail
    pub async fn set_failing(&self, fail: bool) {
        self.state.lock().await.fail = fail;
    }

    pub async fn connect_count(&self) -> usize {
        self.state.lock().await.attempts.len()
    }

    pub async fn last_attempt(&self) -> Option<(BrokerUrl, ConnectOptions)> {
        self.state.lock().await.attempts.last().cloned()
    }

    /// The most recently opened transport
    pub async fn latest(&self) -> Option<Arc<MockTransport>> {
        self.state.lock().await.transports.last().cloned()
    }

    pub async fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.state.lock().await.transports.clone()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(
        &self,
        url: &BrokerUrl,
        options: &ConnectOptions,
    ) -> Result<TransportHandle, TransportError> {
        let mut state = self.state.lock().await;
        state.attempts.push((url.clone(), options.clone()));
        if state.fail {
            return Err(TransportError::ConnectionFailed(
                "mock connection failure".into(),
            ));
        }
        let (tx, rx) = mpsc::channel(64);
        let transport = Arc::new(MockTransport::new(tx, self.end_delay));
        state.transports.push(Arc::clone(&transport));
        Ok((transport, rx))
    }
}

#[derive(Debug, Default)]
struct LinkApiState {
    failure: Option<ApiError>,
    passwords: Vec<String>,
    link_calls: usize,
}

/// Scriptable [`BrokerLinkApi`]
#[derive(Debug, Default)]
pub struct MockLinkApi {
    state: Mutex<LinkApiState>,
    delay: Option<Duration>,
}

impl MockLinkApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every following call with `error`
    pub async fn fail_with(&self, error: ApiError) {
        self.state.lock().await.failure = Some(error);
    }

    pub async fn succeed(&self) {
        self.state.lock().await.failure = None;
    }

    pub async fn passwords(&self) -> Vec<String> {
        self.state.lock().await.passwords.clone()
    }

    pub async fn link_calls(&self) -> usize {
        self.state.lock().await.link_calls
    }

    fn client() -> LinkResult {
        LinkResult {
            id: "client-1".to_string(),
            username: "mq:remote:team1:dev1".to_string(),
            acls: Vec::new(),
            owner: LinkOwner {
                instance_type: "device".to_string(),
                id: "dev1".to_string(),
                name: "Device 1".to_string(),
            },
        }
    }
}

#[async_trait]
impl BrokerLinkApi for MockLinkApi {
    async fn link(&self, password: &str) -> Result<LinkResult, ApiError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().await;
        state.link_calls += 1;
        state.passwords.push(password.to_string());
        match &state.failure {
            Some(error) => Err(error.clone()),
            None => Ok(Self::client()),
        }
    }

    async fn get_client(&self) -> Result<LinkResult, ApiError> {
        match &self.state.lock().await.failure {
            Some(error) => Err(error.clone()),
            None => Ok(Self::client()),
        }
    }
}
