//! Integration tests for the team broker link API
//!
//! Runs `TeamBrokerApi` and `CredentialLinker` against a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;
use team_mqtt::link::{
    ApiError, BrokerLinkApi, CredentialLinker, LinkError, TeamBrokerApi, TeamBrokerApiConfig,
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLIENT_PATH: &str = "/api/v1/teams/team1/broker/client/device:dev1";

fn api_config(base_url: &str) -> TeamBrokerApiConfig {
    TeamBrokerApiConfig {
        forge_url: base_url.to_string(),
        team_id: "team1".to_string(),
        owner_key: "device:dev1".to_string(),
        token: "test-token".to_string(),
        timeout: Duration::from_millis(500),
    }
}

fn client_body() -> serde_json::Value {
    serde_json::json!({
        "id": "client-7",
        "username": "mq:remote:team1:dev1",
        "acls": [{"action": "both", "pattern": "#"}],
        "owner": {"instanceType": "device", "id": "dev1", "name": "Sensor"}
    })
}

#[tokio::test]
async fn test_link_posts_password_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{CLIENT_PATH}/link")))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(serde_json::json!({"password": "secret"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(client_body()))
        .expect(1)
        .mount(&server)
        .await;

    let api = TeamBrokerApi::new(api_config(&server.uri())).unwrap();
    let result = api.link("secret").await.unwrap();

    assert_eq!(result.id, "client-7");
    assert_eq!(result.username, "mq:remote:team1:dev1");
    assert_eq!(result.owner.instance_type, "device");
    assert_eq!(result.acls.len(), 1);
}

#[tokio::test]
async fn test_get_client_accepts_only_ok() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CLIENT_PATH))
        .respond_with(ResponseTemplate::new(201).set_body_json(client_body()))
        .mount(&server)
        .await;

    let api = TeamBrokerApi::new(api_config(&server.uri())).unwrap();
    let error = api.get_client().await.unwrap_err();
    assert!(matches!(error, ApiError::Status { status: 201, .. }));
}

#[tokio::test]
async fn test_non_success_status_is_hard_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{CLIENT_PATH}/link")))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let api = TeamBrokerApi::new(api_config(&server.uri())).unwrap();
    let error = api.link("secret").await.unwrap_err();
    assert_eq!(
        error,
        ApiError::Status {
            status: 403,
            message: "forbidden".to_string()
        }
    );
    assert_eq!(error.name(), "HTTPError");
    assert_eq!(error.code(), "403");
}

#[tokio::test]
async fn test_malformed_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{CLIENT_PATH}/link")))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let api = TeamBrokerApi::new(api_config(&server.uri())).unwrap();
    assert!(matches!(
        api.link("secret").await,
        Err(ApiError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{CLIENT_PATH}/link")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(client_body())
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let api = TeamBrokerApi::new(api_config(&server.uri())).unwrap();
    let error = api.link("secret").await.unwrap_err();
    assert_eq!(error, ApiError::Timeout);
    assert_eq!(error.code(), "ETIMEDOUT");
}

#[tokio::test]
async fn test_linker_coalesces_concurrent_links_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{CLIENT_PATH}/link")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(client_body())
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let api = TeamBrokerApi::new(api_config(&server.uri())).unwrap();
    let linker = CredentialLinker::new(Arc::new(api), "secret");

    let (a, b) = tokio::join!(linker.link(), linker.link());
    assert_eq!(a.unwrap().id, "client-7");
    assert_eq!(b.unwrap().id, "client-7");
    assert!(linker.is_linked().await);
    assert!(!linker.link_failed().await);
}

#[tokio::test]
async fn test_linker_records_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{CLIENT_PATH}/link")))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let api = TeamBrokerApi::new(api_config(&server.uri())).unwrap();
    let linker = CredentialLinker::new(Arc::new(api), "secret");

    let LinkError::Failed { name, code, .. } = linker.link().await.unwrap_err();
    assert_eq!(name, "HTTPError");
    assert_eq!(code, "500");
    assert!(linker.link_failed().await);
    assert!(!linker.is_linked().await);
}
