#![cfg(feature = "http")]

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use feeder_mcp::api::{router, AppState};
use feeder_mcp::config::Config;
use feeder_mcp::Session;

fn app() -> Router {
    let state = AppState {
        session: Session::default().shared(),
    };
    router(state, &Config::default())
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn healthz_is_ok() {
    let (status, _) = send(&app(), "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn lists_tools() {
    let (status, body) = send(&app(), "GET", "/api/v1/tools", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 7);
}

#[tokio::test]
async fn load_then_solve_over_http() {
    let app = app();
    let (status, body) = send(&app, "POST", "/api/v1/tools/load_feeder", Some(json!({"feeder_id": "IEEE13"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = send(&app, "POST", "/api/v1/tools/run_power_flow", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["converged"], true);
    assert_eq!(body["metadata"]["circuit_name"], "IEEE13");

    let (_, body) = send(&app, "GET", "/api/v1/circuit", None).await;
    assert_eq!(body["circuit"], "IEEE13");
    assert_eq!(body["solved"], true);
    assert_eq!(body["busy"], false);
}

#[tokio::test]
async fn circuit_status_does_not_wait_for_a_running_tool() {
    let session = Session::default().shared();
    let app = router(
        AppState {
            session: session.clone(),
        },
        &Config::default(),
    );

    let held = session.lock();
    let (status, body) = send(&app, "GET", "/api/v1/circuit", None).await;
    drop(held);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["busy"], true);
    assert_eq!(body["circuit"], Value::Null);

    let (_, body) = send(&app, "GET", "/api/v1/circuit", None).await;
    assert_eq!(body["busy"], false);
}

#[tokio::test]
async fn tool_failure_is_an_envelope() {
    let (status, body) = send(&app(), "POST", "/api/v1/tools/check_voltages", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(body["errors"][0].as_str().unwrap().contains("No circuit loaded"));
}

#[tokio::test]
async fn unknown_tool_and_bad_json() {
    let app = app();
    let (status, body) = send(&app, "POST", "/api/v1/tools/frobnicate", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFound");

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/tools/load_feeder")
        .body(Body::from("{oops"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
