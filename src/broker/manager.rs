//! The shared broker connection
//!
//! [`SharedBroker`] owns the single transport of the process. Consumers
//! register with it, subscribe through it and publish through it without
//! knowing whether the connection is up. The pure parts (state transitions,
//! subscription bookkeeping, publish normalization) live in sibling modules;
//! this module does the I/O.
//!
//! State is kept behind one async mutex. Every mutation completes before the
//! lock is released and no transport call is awaited while it is held.

use super::publish::{prepare_publish, PublishError, TopicAliases};
use super::server_properties::ServerProperties;
use super::state::{ConnectionState, ConnectionStatus};
use super::subscriptions::{
    BrokerCommand, SubscriptionError, SubscriptionRegistry, SubscriptionRequest,
};
use crate::config::{AppConfig, ConfigError, MessageTemplate};
use crate::link::monitor::run_link_monitor;
use crate::link::{
    ApiError, BrokerLinkApi, CredentialLinker, LinkError, LinkMonitor, LinkRetryPolicy,
    MonitoredLink, TeamBrokerApi, TeamBrokerApiConfig,
};
use crate::protocol::OutboundMessage;
use crate::transport::mqtt::RumqttcConnector;
use crate::transport::{
    BrokerTransport, BrokerUrl, ConnectOptions, ProtocolVersion, PublishRequest,
    SubscribeOptions, TransportConnector, TransportError, TransportEvent,
};
use crate::{broker_span, link_span, subscription_span};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexSet;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

/// Upper bound for the graceful DISCONNECT before the transport is forced shut
pub const GRACEFUL_END_TIMEOUT: Duration = Duration::from_millis(2000);

/// Delay between CONNACK and the birth message
pub const BIRTH_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl BrokerError {
    pub fn is_warning(&self) -> bool {
        matches!(self, BrokerError::Publish(e) if e.is_warning())
    }
}

/// Result of [`SharedBroker::connect`]
#[derive(Debug)]
pub enum ConnectOutcome {
    /// A new attempt started; resolves on its first CONNACK
    Started(oneshot::Receiver<()>),
    /// Already connected or connecting
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// Not connected; the message was discarded
    Dropped,
}

#[derive(Debug, Clone)]
struct ConnectPlan {
    url: BrokerUrl,
    options: ConnectOptions,
}

struct BrokerState {
    connection: ConnectionState,
    consumers: IndexSet<String>,
    registry: SubscriptionRegistry,
    plan: Option<ConnectPlan>,
    transport: Option<Arc<dyn BrokerTransport>>,
    /// Bumped whenever a transport is replaced or torn down; events tagged
    /// with an older value are ignored
    generation: u64,
    events: Option<JoinHandle<()>>,
    server: ServerProperties,
    aliases: TopicAliases,
    connect_waiters: Vec<oneshot::Sender<()>>,
}

impl BrokerState {
    fn connected_transport(&self) -> Option<Arc<dyn BrokerTransport>> {
        if self.connection.is_connected() {
            self.transport.clone()
        } else {
            None
        }
    }

    fn is_v5(&self) -> bool {
        self.plan
            .as_ref()
            .is_some_and(|plan| plan.options.protocol.is_v5())
    }
}

type DisconnectFuture = Shared<BoxFuture<'static, ()>>;

struct BrokerInner {
    config: AppConfig,
    connector: Arc<dyn TransportConnector>,
    linker: Arc<CredentialLinker>,
    password: String,
    state: Mutex<BrokerState>,
    status: watch::Sender<ConnectionStatus>,
    disconnecting: Mutex<Option<DisconnectFuture>>,
    monitor: OnceCell<AbortHandle>,
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get() {
            monitor.abort();
        }
        if let Some(events) = self.state.get_mut().events.take() {
            events.abort();
        }
    }
}

/// Handle to the one broker connection of this process. Cheap to clone.
#[derive(Clone)]
pub struct SharedBroker {
    inner: Arc<BrokerInner>,
}

impl SharedBroker {
    pub fn new(
        config: AppConfig,
        connector: Arc<dyn TransportConnector>,
        api: Arc<dyn BrokerLinkApi>,
        password: impl Into<String>,
    ) -> Self {
        let password = password.into();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let registry = SubscriptionRegistry::new(config.broker.auto_unsubscribe);
        Self {
            inner: Arc::new(BrokerInner {
                linker: Arc::new(CredentialLinker::new(api, password.clone())),
                config,
                connector,
                password,
                state: Mutex::new(BrokerState {
                    connection: ConnectionState::Idle,
                    consumers: IndexSet::new(),
                    registry,
                    plan: None,
                    transport: None,
                    generation: 0,
                    events: None,
                    server: ServerProperties::default(),
                    aliases: TopicAliases::default(),
                    connect_waiters: Vec::new(),
                }),
                status,
                disconnecting: Mutex::new(None),
                monitor: OnceCell::new(),
            }),
        }
    }

    /// Production wiring: HTTP link API and the rumqttc transport, secrets
    /// read from the environment
    pub fn from_config(config: AppConfig) -> Result<Self, BrokerError> {
        let token = config.get_platform_token()?;
        let password = config.get_broker_password()?;
        let api = TeamBrokerApi::new(TeamBrokerApiConfig {
            forge_url: config.platform.forge_url.clone(),
            team_id: config.platform.team_id.clone(),
            owner_key: config.identity().owner_key(),
            token,
            timeout: Duration::from_millis(config.platform.api_timeout_ms),
        })?;
        Ok(Self::new(
            config,
            Arc::new(RumqttcConnector::default()),
            Arc::new(api),
            password,
        ))
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn linker(&self) -> &CredentialLinker {
        &self.inner.linker
    }

    /// Whether connections negotiate MQTT v5
    pub fn is_v5(&self) -> bool {
        let broker = &self.inner.config.broker;
        ProtocolVersion::from_settings(broker.protocol_version, broker.compat_mode).is_v5()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub async fn can_connect(&self) -> bool {
        self.inner.state.lock().await.connection.can_connect()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.connection.is_connected()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().await.connection
    }

    pub async fn server_properties(&self) -> ServerProperties {
        self.inner.state.lock().await.server.clone()
    }

    pub async fn consumer_count(&self) -> usize {
        self.inner.state.lock().await.consumers.len()
    }

    pub async fn subscriptions_for(&self, owner: &str) -> Vec<(String, SubscribeOptions)> {
        self.inner.state.lock().await.registry.subscriptions_for(owner)
    }

    pub async fn subscription_identifier(&self, filter: &str) -> Option<u32> {
        self.inner
            .state
            .lock()
            .await
            .registry
            .subscription_identifier(filter)
    }

    fn set_connection(&self, state: &mut BrokerState, next: ConnectionState) {
        state.connection = next;
        let status = ConnectionStatus::from(next);
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn build_plan(&self) -> Result<ConnectPlan, BrokerError> {
        let broker = &self.inner.config.broker;
        let url = BrokerUrl::resolve(
            broker.url.as_deref(),
            broker.host.as_deref(),
            broker.port,
            broker.use_tls,
        )?;
        let options = ConnectOptions::build(
            &self.inner.config.identity(),
            broker,
            Some(self.inner.password.clone()),
        );
        Ok(ConnectPlan { url, options })
    }

    /// Rebuild the URL and connect options from configuration
    pub async fn initialise(&self) -> Result<(), BrokerError> {
        let plan = self.build_plan()?;
        debug!(url = %plan.url, protocol = ?plan.options.protocol, "Connect options built");
        self.inner.state.lock().await.plan = Some(plan);
        Ok(())
    }

    /// Add a consumer. The first consumer links credentials, builds the
    /// connect options and, with `auto_connect`, opens the connection.
    ///
    /// A failed link leaves the consumer registered and the connection
    /// idle; later registrations do not retry. The link monitor does.
    pub async fn register(&self, owner: &str) -> Result<(), BrokerError> {
        self.start_monitor();
        let first = {
            let mut state = self.inner.state.lock().await;
            let first = state.consumers.is_empty();
            state.consumers.insert(owner.to_string());
            debug!(owner, consumers = state.consumers.len(), "Consumer registered");
            first
        };
        if !first {
            return Ok(());
        }

        self.inner
            .linker
            .link()
            .instrument(link_span!(owner = %owner))
            .await?;
        self.initialise().await?;
        if self.inner.config.broker.auto_connect {
            self.connect().await?;
        }
        Ok(())
    }

    /// Remove a consumer and its active subscriptions. The last consumer
    /// leaving with `auto_disconnect` closes the connection.
    pub async fn deregister(&self, owner: &str, auto_disconnect: bool) {
        let (transport, commands, empty, closing) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state.consumers.shift_remove(owner);
            let commands = state.registry.remove_owner(owner);
            (
                state.connected_transport(),
                commands,
                state.consumers.is_empty(),
                state.connection == ConnectionState::Closing,
            )
        };
        debug!(owner, "Consumer deregistered");
        if let Err(e) = execute(transport, commands).await {
            warn!(owner, error = %e, "Failed to release subscriptions");
        }
        if empty && auto_disconnect && !closing {
            self.disconnect().await;
        }
    }

    pub async fn subscribe(&self, request: SubscriptionRequest) -> Result<(), BrokerError> {
        let span = subscription_span!(filter = %request.filter, owner = %request.owner);
        let (transport, commands) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let commands = state.registry.subscribe(request)?;
            (state.connected_transport(), commands)
        };
        execute(transport, commands).instrument(span).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, filter: &str, owner: &str, force: bool) {
        let (transport, commands) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let commands = state.registry.unsubscribe(filter, owner, force);
            (state.connected_transport(), commands)
        };
        if let Err(e) = execute(transport, commands).await {
            warn!(filter, owner, error = %e, "Unsubscribe failed");
        }
    }

    /// Publish through the shared connection. Dropped when not connected.
    pub async fn publish(&self, message: &OutboundMessage) -> Result<PublishOutcome, BrokerError> {
        let (transport, request) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(transport) = state.connected_transport() else {
                debug!(topic = ?message.topic, "Not connected, publish dropped");
                return Ok(PublishOutcome::Dropped);
            };
            let v5 = state.is_v5();
            let request = prepare_publish(message, v5, &state.server, &mut state.aliases)?;
            (transport, request)
        };
        debug!(topic = %request.topic, qos = request.qos, retain = request.retain, "Publishing");
        transport.publish(request).await?;
        Ok(PublishOutcome::Sent)
    }

    /// Open the connection unless one is already connected or connecting
    pub async fn connect(&self) -> Result<ConnectOutcome, BrokerError> {
        let span = broker_span!(operation = "connect");
        self.connect_inner().instrument(span).await
    }

    async fn connect_inner(&self) -> Result<ConnectOutcome, BrokerError> {
        let (plan, previous, generation, receiver) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if !state.connection.can_connect() {
                return Ok(ConnectOutcome::AlreadyActive);
            }
            let plan = match &state.plan {
                Some(plan) => plan.clone(),
                None => {
                    let plan = self.build_plan()?;
                    state.plan = Some(plan.clone());
                    plan
                }
            };

            let previous = state.transport.take();
            if let Some(events) = state.events.take() {
                events.abort();
            }
            state.generation += 1;
            state.registry.detach_all();
            state.aliases.clear();
            state.server = ServerProperties::default();
            self.set_connection(state, ConnectionState::Connecting);

            let (sender, receiver) = oneshot::channel();
            state.connect_waiters.push(sender);
            (plan, previous, state.generation, receiver)
        };

        if let Some(previous) = previous {
            if let Err(e) = previous.end(true).await {
                debug!(error = %e, "Previous transport did not end cleanly");
            }
        }

        info!(url = %plan.url, client_id = %plan.options.client_id, "Connecting to broker");
        let opened = self.inner.connector.connect(&plan.url, &plan.options).await;

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        match opened {
            Ok((transport, events)) => {
                if state.generation != generation {
                    drop(guard);
                    debug!("Connect attempt superseded, closing its transport");
                    let _ = transport.end(true).await;
                    return Ok(ConnectOutcome::Started(receiver));
                }
                state.transport = Some(transport);
                state.events = Some(tokio::spawn(pump_events(
                    Arc::downgrade(&self.inner),
                    generation,
                    events,
                )));
                Ok(ConnectOutcome::Started(receiver))
            }
            Err(e) => {
                if state.generation == generation {
                    state.connect_waiters.clear();
                    self.set_connection(state, ConnectionState::Idle);
                }
                error!(url = %plan.url, error = %e, "Failed to open broker connection");
                Err(e.into())
            }
        }
    }

    /// Close the connection, publishing the close message first when
    /// connected. Concurrent callers share one disconnect.
    pub async fn disconnect(&self) {
        let future = {
            let mut slot = self.inner.disconnecting.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let broker = self.clone();
                    let future = async move { broker.disconnect_inner().await }
                        .boxed()
                        .shared();
                    *slot = Some(future.clone());
                    future
                }
            }
        };

        future.clone().await;

        let mut slot = self.inner.disconnecting.lock().await;
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&future)) {
            *slot = None;
        }
    }

    async fn disconnect_inner(&self) {
        let (transport, close, generation) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(transport) = state.transport.clone() else {
                if state.connection.is_connecting() {
                    state.generation += 1;
                    state.connect_waiters.clear();
                    self.set_connection(state, ConnectionState::Closing);
                }
                return;
            };
            if state.connection == ConnectionState::Closing {
                return;
            }
            let close = if state.connection.is_connected() {
                self.close_request(state)
            } else {
                None
            };
            self.set_connection(state, ConnectionState::Closing);
            (transport, close, state.generation)
        };

        info!("Disconnecting from broker");
        if let Some(request) = close {
            if let Err(e) = transport.publish(request).await {
                warn!(error = %e, "Failed to publish close message");
            }
        }

        match tokio::time::timeout(GRACEFUL_END_TIMEOUT, transport.end(false)).await {
            Ok(Ok(())) => debug!("Transport ended gracefully"),
            Ok(Err(e)) => {
                warn!(error = %e, "Graceful disconnect failed, forcing");
                let _ = transport.end(true).await;
            }
            Err(_) => {
                warn!(
                    timeout_ms = GRACEFUL_END_TIMEOUT.as_millis() as u64,
                    "Graceful disconnect timed out, forcing"
                );
                let _ = transport.end(true).await;
            }
        }

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.generation != generation {
            // a new connect already replaced this transport
            return;
        }
        state.generation += 1;
        state.transport = None;
        if let Some(events) = state.events.take() {
            events.abort();
        }
        state.registry.detach_all();
        state.connect_waiters.clear();
        self.set_connection(state, ConnectionState::Closing);
        info!("Disconnected from broker");
    }

    fn close_request(&self, state: &mut BrokerState) -> Option<PublishRequest> {
        let message = self
            .inner
            .config
            .broker
            .close
            .as_ref()
            .and_then(MessageTemplate::to_outbound)?;
        let v5 = state.is_v5();
        prepare_publish(&message, v5, &state.server, &mut state.aliases)
            .map_err(|e| warn!(error = %e, "Invalid close message"))
            .ok()
    }

    /// Stop the link monitor and disconnect
    pub async fn shutdown(&self) {
        if let Some(monitor) = self.inner.monitor.get() {
            monitor.abort();
        }
        self.disconnect().await;
    }

    fn start_monitor(&self) {
        self.inner.monitor.get_or_init(|| {
            let target = MonitorTarget {
                broker: Arc::downgrade(&self.inner),
                linker: Arc::clone(&self.inner.linker),
            };
            let monitor = LinkMonitor::new(LinkRetryPolicy::from_config(&self.inner.config.link));
            tokio::spawn(run_link_monitor(target, monitor)).abort_handle()
        });
    }

    /// After the monitor relinked: connect if consumers wait on an idle
    /// connection
    async fn recover(&self) {
        let idle = {
            let state = self.inner.state.lock().await;
            !state.consumers.is_empty() && state.connection == ConnectionState::Idle
        };
        if !idle || !self.inner.config.broker.auto_connect {
            return;
        }
        info!("Link recovered, connecting");
        if let Err(e) = self.initialise().await {
            warn!(error = %e, "Failed to build connect options after relink");
            return;
        }
        if let Err(e) = self.connect().await {
            warn!(error = %e, "Connect after relink failed");
        }
    }

    fn schedule_birth(&self) {
        let Some(birth) = self
            .inner
            .config
            .broker
            .birth
            .as_ref()
            .and_then(MessageTemplate::to_outbound)
        else {
            return;
        };
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(BIRTH_DELAY).await;
            match broker.publish(&birth).await {
                Ok(outcome) => debug!(?outcome, "Birth message handled"),
                Err(e) => warn!(error = %e, "Failed to publish birth message"),
            }
        });
    }

    /// Apply one transport event. Returns false once the session is stale.
    async fn handle_event(&self, generation: u64, event: TransportEvent) -> bool {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.generation != generation {
            debug!("Ignoring event from a superseded transport");
            return false;
        }

        match event {
            TransportEvent::Connected { properties } => {
                state.server = if state.is_v5() {
                    ServerProperties::from_connack(properties.as_ref())
                } else {
                    ServerProperties::default()
                };
                state.aliases.clear();
                self.set_connection(state, ConnectionState::Connected);
                info!(
                    subscription_ids = state.server.subscription_identifiers_available(),
                    topic_alias_maximum = state.server.topic_alias_maximum(),
                    "Connected to broker"
                );

                let ids = state.server.subscription_identifiers_available();
                let commands = state.registry.replay(ids);
                for waiter in state.connect_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                let transport = state.transport.clone();
                drop(guard);

                self.schedule_birth();
                if let Err(e) = execute(transport, commands).await {
                    warn!(error = %e, "Failed to restore subscriptions");
                }
            }
            TransportEvent::Reconnecting => {
                if state.connection != ConnectionState::Closing {
                    info!("Reconnecting to broker");
                    state.registry.detach_all();
                    self.set_connection(state, ConnectionState::Connecting);
                }
            }
            TransportEvent::Disconnect {
                reason_code,
                reason_string,
            } => {
                warn!(%reason_code, reason = ?reason_string, "Broker sent disconnect");
                state.registry.detach_all();
                if state.connection != ConnectionState::Closing {
                    self.set_connection(state, ConnectionState::Idle);
                }
            }
            TransportEvent::Closed => {
                match state.connection {
                    ConnectionState::Connected => info!("Connection to broker closed"),
                    ConnectionState::Connecting => {
                        let url = state.plan.as_ref().map(|p| p.url.to_string());
                        warn!(url = ?url, "Connection to broker failed");
                    }
                    _ => {}
                }
                state.registry.detach_all();
                let next = state.connection.on_closed();
                self.set_connection(state, next);
            }
            TransportEvent::Error(message) => {
                debug!(error = %message, "Transport error");
            }
            TransportEvent::Message(packet) => {
                let callbacks = state.registry.dispatch(&packet);
                drop(guard);
                if callbacks.is_empty() {
                    debug!(topic = %packet.topic, "No subscriber for message");
                }
                for callback in callbacks {
                    callback(&packet);
                }
            }
        }
        true
    }
}

async fn execute(
    transport: Option<Arc<dyn BrokerTransport>>,
    commands: Vec<BrokerCommand>,
) -> Result<(), TransportError> {
    let Some(transport) = transport else {
        return Ok(());
    };
    for command in commands {
        match command {
            BrokerCommand::Subscribe(request) => {
                debug!(
                    filter = %request.filter,
                    qos = request.options.qos,
                    sub_id = ?request.subscription_identifier,
                    "Subscribing"
                );
                transport.subscribe(request).await?;
            }
            BrokerCommand::Unsubscribe(filter) => {
                debug!(filter = %filter, "Unsubscribing");
                if let Err(e) = transport.unsubscribe(&filter).await {
                    warn!(filter = %filter, error = %e, "Broker unsubscribe failed");
                }
            }
        }
    }
    Ok(())
}

async fn pump_events(
    broker: Weak<BrokerInner>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = broker.upgrade() else {
            break;
        };
        if !(SharedBroker { inner }).handle_event(generation, event).await {
            break;
        }
    }
    debug!(generation, "Transport event stream ended");
}

struct MonitorTarget {
    broker: Weak<BrokerInner>,
    linker: Arc<CredentialLinker>,
}

#[async_trait]
impl MonitoredLink for MonitorTarget {
    async fn has_consumers(&self) -> bool {
        match self.broker.upgrade() {
            Some(inner) => !inner.state.lock().await.consumers.is_empty(),
            None => false,
        }
    }

    fn linker(&self) -> &CredentialLinker {
        &self.linker
    }

    async fn relinked(&self) {
        if let Some(inner) = self.broker.upgrade() {
            SharedBroker { inner }.recover().await;
        }
    }
}
