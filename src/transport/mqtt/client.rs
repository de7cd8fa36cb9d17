//! Impure rumqttc binding
//!
//! Each [`RumqttcConnector::connect`] call creates one rumqttc client and
//! spawns a task that polls its event loop, translating events through
//! [`MessageHandler`] onto an mpsc channel. rumqttc reconnects on the next
//! poll after a failure, so the task only paces polls and reports the
//! lifecycle.

use super::connection::{configure_v4_options, configure_v5_options, v4_qos, v5_qos, ReconnectConfig};
use super::message_handler::MessageHandler;
use crate::transport::{
    BrokerTransport, BrokerUrl, ConnectOptions, PublishProperties, PublishRequest,
    SubscribeOptions, SubscribeRequest, TransportConnector, TransportError, TransportEvent,
    TransportHandle,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Filter, RetainForwardRule, SubscribeProperties};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Opens rumqttc-backed transports
#[derive(Debug, Clone)]
pub struct RumqttcConnector {
    channel_capacity: usize,
}

impl RumqttcConnector {
    pub fn new(channel_capacity: usize) -> Self {
        Self { channel_capacity }
    }
}

impl Default for RumqttcConnector {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl TransportConnector for RumqttcConnector {
    async fn connect(
        &self,
        url: &BrokerUrl,
        options: &ConnectOptions,
    ) -> Result<TransportHandle, TransportError> {
        let (events_tx, events_rx) = mpsc::channel(self.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconnect = ReconnectConfig::from_period(options.reconnect_period);

        info!(broker = %url, client_id = %options.client_id, "Opening MQTT connection");

        let (client, handle) = if options.protocol.is_v5() {
            let (client, event_loop) =
                rumqttc::v5::AsyncClient::new(configure_v5_options(url, options), self.channel_capacity);
            let handle = tokio::spawn(run_event_loop(event_loop, events_tx, shutdown_rx, reconnect));
            (ClientHandle::V5(client), handle)
        } else {
            let (client, event_loop) =
                rumqttc::AsyncClient::new(configure_v4_options(url, options), self.channel_capacity);
            let handle = tokio::spawn(run_event_loop(event_loop, events_tx, shutdown_rx, reconnect));
            (ClientHandle::V4(client), handle)
        };

        let transport = RumqttcTransport {
            client,
            shutdown_tx,
            abort: handle.abort_handle(),
            task: Mutex::new(Some(handle)),
        };
        Ok((Arc::new(transport), events_rx))
    }
}

enum ClientHandle {
    V5(rumqttc::v5::AsyncClient),
    V4(rumqttc::AsyncClient),
}

/// One open rumqttc connection
pub struct RumqttcTransport {
    client: ClientHandle,
    shutdown_tx: watch::Sender<bool>,
    abort: AbortHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn v5_filter(filter: &str, options: SubscribeOptions) -> Filter {
    let mut v5 = Filter::new(filter, v5_qos(options.qos));
    v5.nolocal = options.no_local.unwrap_or(false);
    v5.preserve_retain = options.retain_as_published.unwrap_or(false);
    v5.retain_forward_rule = match options.retain_handling {
        Some(1) => RetainForwardRule::OnNewSubscribe,
        Some(2) => RetainForwardRule::Never,
        _ => RetainForwardRule::OnEverySubscribe,
    };
    v5
}

fn v5_publish_properties(props: PublishProperties) -> rumqttc::v5::mqttbytes::v5::PublishProperties {
    rumqttc::v5::mqttbytes::v5::PublishProperties {
        payload_format_indicator: props.payload_format_indicator.map(u8::from),
        message_expiry_interval: props.message_expiry_interval,
        topic_alias: props.topic_alias,
        response_topic: props.response_topic,
        correlation_data: props.correlation_data,
        user_properties: props.user_properties,
        subscription_identifiers: Vec::new(),
        content_type: props.content_type,
    }
}

#[async_trait]
impl BrokerTransport for RumqttcTransport {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<(), TransportError> {
        let result = match &self.client {
            ClientHandle::V5(client) => {
                let filter = v5_filter(&request.filter, request.options);
                match request.subscription_identifier {
                    Some(id) => {
                        let properties = SubscribeProperties {
                            id: Some(id as usize),
                            user_properties: Vec::new(),
                        };
                        client
                            .subscribe_many_with_properties(vec![filter], properties)
                            .await
                    }
                    None => client.subscribe_many(vec![filter]).await,
                }
                .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))
            }
            ClientHandle::V4(client) => client
                .subscribe(request.filter.clone(), v4_qos(request.options.qos))
                .await
                .map_err(|e| TransportError::SubscriptionFailed(Box::new(e))),
        };
        debug!(target: "mqtt_transport", filter = %request.filter, "Subscribe requested");
        result
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        match &self.client {
            ClientHandle::V5(client) => client
                .unsubscribe(filter)
                .await
                .map_err(|e| TransportError::SubscriptionFailed(Box::new(e))),
            ClientHandle::V4(client) => client
                .unsubscribe(filter)
                .await
                .map_err(|e| TransportError::SubscriptionFailed(Box::new(e))),
        }
    }

    async fn publish(&self, request: PublishRequest) -> Result<(), TransportError> {
        match &self.client {
            ClientHandle::V5(client) => {
                let qos = v5_qos(request.qos);
                match request.properties {
                    Some(props) => {
                        client
                            .publish_with_properties(
                                request.topic,
                                qos,
                                request.retain,
                                request.payload,
                                v5_publish_properties(props),
                            )
                            .await
                    }
                    None => {
                        client
                            .publish(request.topic, qos, request.retain, request.payload)
                            .await
                    }
                }
                .map_err(|e| TransportError::PublishFailed(Box::new(e)))
            }
            ClientHandle::V4(client) => client
                .publish(request.topic, v4_qos(request.qos), request.retain, request.payload)
                .await
                .map_err(|e| TransportError::PublishFailed(Box::new(e))),
        }
    }

    async fn end(&self, force: bool) -> Result<(), TransportError> {
        if force {
            self.abort.abort();
            return Ok(());
        }

        let requested = match &self.client {
            ClientHandle::V5(client) => client.disconnect().await.is_ok(),
            ClientHandle::V4(client) => client.disconnect().await.is_ok(),
        };
        let _ = self.shutdown_tx.send(true);
        if !requested {
            self.abort.abort();
            return Ok(());
        }

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(()) => info!("MQTT event loop shut down gracefully"),
                Err(e) if !e.is_cancelled() => warn!("MQTT event loop ended with error: {}", e),
                Err(_) => {}
            }
        }
        Ok(())
    }
}

impl Drop for RumqttcTransport {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Poll abstraction over the v5 and v3.1.1 event loops
#[async_trait]
trait EventSource: Send + 'static {
    async fn next_event(&mut self) -> Result<Option<TransportEvent>, String>;
}

#[async_trait]
impl EventSource for rumqttc::v5::EventLoop {
    async fn next_event(&mut self) -> Result<Option<TransportEvent>, String> {
        self.poll()
            .await
            .map(|event| MessageHandler::route_v5_event(&event))
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl EventSource for rumqttc::EventLoop {
    async fn next_event(&mut self) -> Result<Option<TransportEvent>, String> {
        self.poll()
            .await
            .map(|event| MessageHandler::route_v4_event(&event))
            .map_err(|e| e.to_string())
    }
}

/// Sleep unless shutdown is requested first. Returns false on shutdown.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

async fn run_event_loop<S: EventSource>(
    mut source: S,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    reconnect: ReconnectConfig,
) {
    let mut failures = 0u32;
    let mut closing = false;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed(), if !closing => {
                // Keep polling so the queued DISCONNECT reaches the broker
                closing = changed.is_err() || *shutdown_rx.borrow();
            }
            result = source.next_event() => match result {
                Ok(Some(event)) => {
                    if matches!(event, TransportEvent::Connected { .. }) {
                        failures = 0;
                    }
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    if closing {
                        debug!(target: "mqtt_transport", "Event loop finished: {}", error);
                        break;
                    }
                    failures += 1;
                    let _ = events.send(TransportEvent::Error(error)).await;
                    if events.send(TransportEvent::Closed).await.is_err() {
                        break;
                    }
                    if reconnect.attempts_exhausted(failures) {
                        warn!("Giving up after {} failed connection attempts", failures);
                        break;
                    }
                    let delay_ms = reconnect.calculate_backoff_delay(failures);
                    if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                        break;
                    }
                    if events.send(TransportEvent::Reconnecting).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!(target: "mqtt_transport", "MQTT event loop stopped");
}
