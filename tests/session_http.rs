//! Router-level tests for the session failure modes: busy rejection,
//! timeout recovery, unrecoverable timeouts, and checked commands.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use rexd::api::{router, AppState, RouterConfig};
use rexd::session::SessionRegistry;

fn test_app() -> (axum::Router, AppState) {
    let state = AppState {
        sessions: SessionRegistry::new(common::quick_tunables()),
        shutdown: CancellationToken::new(),
    };
    (router(state.clone(), RouterConfig::default()), state)
}

fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_session(app: &axum::Router, name: &str) {
    let response = app
        .clone()
        .oneshot(json_request(
            "/create_session",
            serde_json::json!({ "session": name }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn busy_session_rejects_concurrent_run() {
    let (app, _state) = test_app();
    create_session(&app, "busy").await;

    let slow_app = app.clone();
    let slow = tokio::spawn(async move {
        slow_app
            .oneshot(json_request(
                "/run_in_session",
                serde_json::json!({ "session": "busy", "command": "sleep 2" }),
            ))
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(400)).await;
    let response = app
        .clone()
        .oneshot(json_request(
            "/run_in_session",
            serde_json::json!({ "session": "busy", "command": "echo nope" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 511);
    let json = body_json(response).await;
    assert_eq!(json["error_kind"], "SESSION_BUSY");

    let response = slow.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["exit_code"], 0);
}

#[tokio::test]
async fn timeout_recovers_and_session_stays_usable() {
    let (app, _state) = test_app();
    create_session(&app, "slowpoke").await;

    let started = std::time::Instant::now();
    let response = app
        .clone()
        .oneshot(json_request(
            "/run_in_session",
            serde_json::json!({ "session": "slowpoke", "command": "sleep 5", "timeout": 0.5 }),
        ))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["exit_code"], -1);
    assert!(
        json["failure_reason"]
            .as_str()
            .unwrap()
            .contains("timed out"),
        "got: {json}"
    );

    let response = app
        .oneshot(json_request(
            "/run_in_session",
            serde_json::json!({ "session": "slowpoke", "command": "echo ok" }),
        ))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["output"], "ok");
    assert_eq!(json["exit_code"], 0);
}

#[tokio::test]
async fn unrecoverable_timeout_closes_the_session() {
    let (app, state) = test_app();
    create_session(&app, "wedged").await;

    let response = app
        .clone()
        .oneshot(json_request(
            "/run_in_session",
            serde_json::json!({
                "session": "wedged",
                "command": "trap '' INT; sleep 30",
                "timeout": 0.5
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 511);
    let json = body_json(response).await;
    assert_eq!(json["error_kind"], "COMMAND_TIMEOUT_UNRECOVERABLE");

    // The session answers like it never existed.
    let response = app
        .oneshot(json_request(
            "/run_in_session",
            serde_json::json!({ "session": "wedged", "command": "echo hi" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 511);
    let json = body_json(response).await;
    assert_eq!(json["error_kind"], "SESSION_NOT_FOUND");

    state.sessions.close_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn checked_command_failure_carries_the_output() {
    let (app, _state) = test_app();
    create_session(&app, "checked").await;

    let response = app
        .clone()
        .oneshot(json_request(
            "/run_in_session",
            serde_json::json!({
                "session": "checked",
                "command": "echo broken; exit 9",
                "check": "raise"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 511);
    let json = body_json(response).await;
    assert_eq!(json["error_kind"], "COMMAND_FAILED");
    let message = json["message"].as_str().unwrap();
    assert!(message.contains("exit code 9"), "got: {message}");
    assert!(message.contains("broken"), "got: {message}");

    // A checked failure does not poison the session.
    let response = app
        .oneshot(json_request(
            "/run_in_session",
            serde_json::json!({ "session": "checked", "command": "echo fine" }),
        ))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["output"], "fine");
}
