//! Integration tests for the `/v1/etl` control surface
//!
//! These tests verify:
//! - Status codes and response envelopes of every route
//! - Error mapping for validation, conflicts and missing ETLs
//! - The per-node transform route

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use etl_server::{
    api::{create_router, AppState},
    config::Config,
};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

mod helpers;

use helpers::{scripted, TestCluster, TEST_CODE};

fn app(tc: &TestCluster) -> Router {
    create_router(
        AppState {
            cluster: tc.cluster.clone(),
        },
        &Config::default(),
    )
}

async fn send(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = body.map_or_else(Body::empty, |v| Body::from(v.to_string()));
    let (status, bytes) = send(app, method, uri, body).await;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn create_body(name: &str, comm: &str) -> Value {
    json!({
        "name": name,
        "communication": comm,
        "timeout": "5s",
        "code": TEST_CODE,
    })
}

#[tokio::test]
async fn test_root_and_health() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let app = app(&tc);

    let (status, body) = send_json(&app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "ETL Server");

    let (status, body) = send(&app, Method::GET, "/health", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn test_create_returns_created_with_node_statuses() {
    let tc = TestCluster::start(&["node-1", "node-2"], scripted()).await;
    let app = app(&tc);

    let (status, body) = send_json(&app, Method::PUT, "/v1/etl", Some(create_body("api-etl", "hpush"))).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert!(body["data"]["job_id"].is_string());
    assert_eq!(body["data"]["spec"]["name"], "api-etl");
    assert_eq!(body["data"]["spec"]["communication"], "hpush");
    assert_eq!(body["data"]["nodes"].as_object().unwrap().len(), 2);
}

#[tokio::test]
async fn test_create_rejects_invalid_spec() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let app = app(&tc);

    let (status, body) = send_json(&app, Method::PUT, "/v1/etl", Some(create_body("Bad_Name", "hpush"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = send_json(&app, Method::PUT, "/v1/etl", Some(create_body("api-etl", "smoke"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_create_rejects_malformed_json() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let app = app(&tc);

    let (status, body) = send(&app, Method::PUT, "/v1/etl", Body::from("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_conflicting_create_is_409() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let app = app(&tc);

    let (status, _) = send_json(&app, Method::PUT, "/v1/etl", Some(create_body("dup-etl", "hpush"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send_json(&app, Method::PUT, "/v1/etl", Some(create_body("dup-etl", "hpush"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send_json(&app, Method::PUT, "/v1/etl", Some(create_body("dup-etl", "io"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "ALREADY_EXISTS");
}

#[tokio::test]
async fn test_unknown_etl_is_404() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let app = app(&tc);

    for (method, uri) in [
        (Method::GET, "/v1/etl/missing-etl"),
        (Method::DELETE, "/v1/etl/missing-etl"),
        (Method::POST, "/v1/etl/missing-etl/stop"),
        (Method::POST, "/v1/etl/missing-etl/start"),
    ] {
        let (status, body) = send_json(&app, method.clone(), uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }
}

#[tokio::test]
async fn test_full_lifecycle_over_http() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let app = app(&tc);

    send_json(&app, Method::PUT, "/v1/etl", Some(create_body("http-etl", "ws"))).await;
    tc.settled("http-etl", "node-1").await;

    let (status, body) = send_json(&app, Method::GET, "/v1/etl/http-etl", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["nodes"]["node-1"]["stage"], "Running");

    let (status, body) = send_json(&app, Method::GET, "/v1/etl", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["count"], 1);
    assert_eq!(body["meta"]["nodes"], json!(["node-1"]));

    let (status, body) = send_json(&app, Method::DELETE, "/v1/etl/http-etl", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "LIFECYCLE_ERROR");

    let (status, body) = send_json(&app, Method::POST, "/v1/etl/http-etl/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["nodes"]["node-1"]["stage"], "Stopped");

    let (status, body) = send_json(&app, Method::DELETE, "/v1/etl/http-etl", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["deleted"], "http-etl");

    let (status, _) = send_json(&app, Method::GET, "/v1/etl/http-etl", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_transform_route() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let app = app(&tc);

    send_json(&app, Method::PUT, "/v1/etl", Some(create_body("route-etl", "hpush"))).await;
    tc.settled("route-etl", "node-1").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/etl/route-etl/transform/node-1",
        Body::from("payload"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"PAYLOAD");

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/etl/route-etl/transform/node-1",
        Body::from("fail"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["code"], "TRANSPORT_ERROR");
}

#[tokio::test]
async fn test_transform_on_stopped_etl_is_bad_gateway() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let app = app(&tc);

    send_json(&app, Method::PUT, "/v1/etl", Some(create_body("halted-etl", "io"))).await;
    send_json(&app, Method::POST, "/v1/etl/halted-etl/stop", None).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/etl/halted-etl/transform/node-1",
        Body::from("data"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["code"], "TRANSPORT_ERROR");
}

#[tokio::test]
async fn test_object_id_must_be_numeric() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let app = app(&tc);

    let (status, body) = send_json(&app, Method::GET, "/v1/etl/objects/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, _) = send_json(&app, Method::GET, "/v1/etl/objects/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
