// HTTP transport tests against a mock server

use callgate::{
    CallOptions, ErrorKind, MethodConfig, Orchestrator, OrchestratorConfig, RequestConfig,
    ReqwestTransport, RetryConfig, Transport,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport_for(server: &MockServer) -> ReqwestTransport {
    ReqwestTransport::new().unwrap().with_base_url(server.uri())
}

#[tokio::test]
async fn test_get_with_query_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .and(query_param("id", "42"))
        .and(header("x-api-key", "secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": 42, "name": "Ada"}))
                .insert_header("x-request-id", "abc"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport_for(&server);
    let request = RequestConfig::get("/users")
        .with_query("id", "42")
        .with_header("x-api-key", "secret");

    let response = transport.send(request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.status_text, "OK");
    assert_eq!(response.data, json!({"id": 42, "name": "Ada"}));
    assert_eq!(response.headers.get("x-request-id").map(String::as_str), Some("abc"));
    assert!(!response.raw.is_empty());
}

#[tokio::test]
async fn test_post_sends_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .and(body_json(json!({"name": "Grace"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport_for(&server);
    let request = RequestConfig::post("/users").with_body(json!({"name": "Grace"}));

    let response = transport.send(request).await.unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.data, json!({"id": 7}));
}

#[tokio::test]
async fn test_plain_text_and_empty_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/text"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/users/1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let transport = transport_for(&server);

    let text = transport.send(RequestConfig::get("/text")).await.unwrap();
    assert_eq!(text.data, json!("pong"));

    let empty = transport.send(RequestConfig::delete("/users/1")).await.unwrap();
    assert_eq!(empty.status, 204);
    assert!(empty.data.is_null());
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let transport = transport_for(&server);
    let err = transport.send(RequestConfig::get("/missing")).await.unwrap_err();

    assert_eq!(err.status, Some(404));
    assert!(!err.is_network_error);
    assert!(!err.is_timeout_error);
    assert_eq!(err.message, "404 Not Found");
}

#[tokio::test]
async fn test_request_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let transport = transport_for(&server);
    let request = RequestConfig::get("/slow").with_timeout(Duration::from_millis(50));
    let err = transport.send(request).await.unwrap_err();

    assert!(err.is_timeout_error);
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    // Reserve a port, then free it so nothing is listening
    let uri = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };

    let transport = ReqwestTransport::new().unwrap().with_base_url(uri);
    let err = transport.send(RequestConfig::get("/gone")).await.unwrap_err();

    assert!(err.is_network_error);
    assert_eq!(err.status, None);
}

#[tokio::test]
async fn test_orchestrator_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/unstable"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let transport = Arc::new(transport_for(&server));
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), transport).unwrap();
    orchestrator
        .register(
            "unstable",
            MethodConfig::new(RequestConfig::get("/unstable"))
                .with_retry(RetryConfig::fixed(2, Duration::from_millis(10))),
        )
        .unwrap();

    let err = orchestrator
        .call("unstable", json!(null), CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Http);
    assert_eq!(err.status(), Some(503));
    assert_eq!(orchestrator.metrics().transport_sends, 3);
}

#[tokio::test]
async fn test_orchestrator_params_become_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "rust"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": ["callgate"]})))
        .expect(1)
        .mount(&server)
        .await;

    let transport = Arc::new(transport_for(&server));
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), transport).unwrap();
    orchestrator
        .register(
            "search",
            MethodConfig::new(RequestConfig::get("/search"))
                .with_transform(|data, _params| Ok(data["results"].clone())),
        )
        .unwrap();

    let value = orchestrator
        .call("search", json!({"q": "rust", "page": 2}), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(value, json!(["callgate"]));
}
