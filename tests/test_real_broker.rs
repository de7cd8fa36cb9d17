//! End-to-end tests against a local broker
//!
//! Needs an anonymous-access broker on `localhost:1883`, e.g.
//! `docker run -p 1883:1883 eclipse-mosquitto:2 mosquitto -c /mosquitto-no-auth.conf`.
//! Run with `cargo test -- --ignored`.


use std::sync::Arc;
use std::time::Duration;
use team_mqtt::consumer::{MqttIn, MqttOut, PublisherConfig, SubscriberConfig};
use team_mqtt::testing::{wait_for_status, MockLinkApi};
use team_mqtt::transport::mqtt::RumqttcConnector;
use team_mqtt::{ConnectionStatus, DataType, OutboundMessage, SharedBroker};
use test_helpers::config_with;
use tokio::sync::mpsc;

fn real_broker(extra: &str) -> SharedBroker {
    SharedBroker::new(
        config_with(extra),
        Arc::new(RumqttcConnector::default()),
        Arc::new(MockLinkApi::new()),
        "secret",
    )
}

#[tokio::test]
#[ignore = "needs a broker on localhost:1883"]
async fn test_round_trip_through_shared_connection() {
    let broker = real_broker("");
    let (sink, mut messages) = mpsc::unbounded_channel();
    let consumer = MqttIn::new(
        SubscriberConfig::new("in-1", "team-mqtt-test/round-trip").with_datatype(DataType::Json),
        broker.clone(),
        sink,
    )
    .unwrap();
    consumer.start().await.unwrap();

    let publisher = MqttOut::new(PublisherConfig::new("out-1"), broker.clone());
    publisher.start().await.unwrap();
    assert!(wait_for_status(&broker, ConnectionStatus::Connected).await);
    // let the SUBACK land before publishing
    tokio::time::sleep(Duration::from_millis(200)).await;

    publisher
        .handle(OutboundMessage::new("team-mqtt-test/round-trip", r#"{"n":1}"#).with_qos(1))
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(5), messages.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.topic, "team-mqtt-test/round-trip");
    assert_eq!(delivery.to_json()["payload"]["n"], 1);

    publisher.close(true).await;
    consumer.close(true).await;
    assert_eq!(broker.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
#[ignore = "needs a broker on localhost:1883"]
async fn test_v311_connection() {
    let broker = real_broker("protocol_version = 4\n");
    broker.register("node-1").await.unwrap();
    assert!(wait_for_status(&broker, ConnectionStatus::Connected).await);
    assert!(!broker.is_v5());
    broker.deregister("node-1", true).await;
}
