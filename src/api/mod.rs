//! HTTP surface of the runtime.
//!
//! One route per operation, JSON in and out, bearer-token auth on
//! everything except the liveness probe at `/`. The router never holds a
//! session lock across a request: serialization of commands is enforced
//! inside the session state machine, so slow commands in one session do not
//! block requests for another.

pub mod auth;
pub mod error;
mod handlers;

use axum::extract::{DefaultBodyLimit, FromRequest, Request};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::session::SessionRegistry;

use handlers::*;

/// Inline file content travels in request bodies, so the limit is well
/// above the default.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    /// Cancelled by `POST /close` or a signal; the supervisor drains on it.
    pub shutdown: CancellationToken,
}

/// JSON extractor that reports malformed bodies in the wire error shape.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = error::ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(error::ApiError::bad_request(rejection.body_text())),
        }
    }
}

/// Authentication configuration for the router.
pub struct RouterConfig {
    pub token: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { token: None }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let protected = Router::new()
        .route("/is_alive", get(is_alive))
        .route("/create_session", post(create_session))
        .route("/run_in_session", post(run_in_session))
        .route("/interrupt_session", post(interrupt_session))
        .route("/close_session", post(close_session))
        .route("/list_sessions", get(list_sessions))
        .route("/execute", post(execute_command))
        .route("/read_file", post(read_file))
        .route("/write_file", post(write_file))
        .route("/upload", post(upload))
        .route("/close", post(close_runtime))
        .with_state(state);

    let protected = match config.token {
        Some(token) => protected.layer(axum::middleware::from_fn(move |req, next| {
            let t = token.clone();
            async move { auth::require_auth(t, req, next).await }
        })),
        None => protected,
    };

    Router::new()
        .route("/", get(root))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorKind, ExceptionTransfer};
    use crate::session::{SessionRegistry, SessionTunables};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt; // for oneshot()

    fn test_state() -> AppState {
        AppState {
            sessions: SessionRegistry::new(SessionTunables {
                startup_timeout: Duration::from_secs(5),
                ..SessionTunables::default()
            }),
            shutdown: CancellationToken::new(),
        }
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

    #[tokio::test]
    async fn root_answers_without_auth() {
        let app = router(
            test_state(),
            RouterConfig {
                token: Some("secret".into()),
            },
        );
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["message"], "hello world");
    }

    #[tokio::test]
    async fn everything_else_requires_auth() {
        let app = router(
            test_state(),
            RouterConfig {
                token: Some("secret".into()),
            },
        );

        for uri in ["/is_alive", "/list_sessions"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "uri: {uri}");
        }

        let response = app
            .clone()
            .oneshot(json_request("/execute", serde_json::json!({"command": ["id"]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Wrong token is just as unauthorized as no token.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/is_alive")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn is_alive_with_token() {
        let app = router(
            test_state(),
            RouterConfig {
                token: Some("secret".into()),
            },
        );
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/is_alive")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["is_alive"], true);
    }

    #[tokio::test]
    async fn session_lifecycle_over_http() {
        let state = test_state();
        let app = router(state.clone(), RouterConfig::default());

        let response = app
            .clone()
            .oneshot(json_request(
                "/create_session",
                serde_json::json!({"session": "http-s"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["session_type"], "bash");

        let response = app
            .clone()
            .oneshot(json_request(
                "/run_in_session",
                serde_json::json!({"session": "http-s", "command": "export MYVAR='test'"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["output"], "");
        assert_eq!(json["exit_code"], 0);

        let response = app
            .clone()
            .oneshot(json_request(
                "/run_in_session",
                serde_json::json!({"session": "http-s", "command": "echo $MYVAR"}),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["output"], "test");
        assert_eq!(json["exit_code"], 0);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/list_sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["sessions"], serde_json::json!(["http-s"]));

        // Close twice: both succeed.
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(json_request(
                    "/close_session",
                    serde_json::json!({"session": "http-s"}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert!(state.sessions.is_empty());
    }

    #[tokio::test]
    async fn run_in_unknown_session_is_a_511_with_kind() {
        let app = router(test_state(), RouterConfig::default());
        let response = app
            .oneshot(json_request(
                "/run_in_session",
                serde_json::json!({"session": "ghost", "command": "true"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 511);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let transfer: ExceptionTransfer = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(transfer.error_kind, ErrorKind::SessionNotFound);
        assert!(transfer.message.contains("ghost"));
    }

    #[tokio::test]
    async fn duplicate_session_is_a_511_session_exists() {
        let app = router(test_state(), RouterConfig::default());
        let create = || json_request("/create_session", serde_json::json!({"session": "dup"}));

        let response = app.clone().oneshot(create()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(create()).await.unwrap();
        assert_eq!(response.status().as_u16(), 511);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "SESSION_EXISTS");
    }

    #[tokio::test]
    async fn create_session_rejects_bad_names_and_kinds() {
        let app = router(test_state(), RouterConfig::default());

        let response = app
            .clone()
            .oneshot(json_request(
                "/create_session",
                serde_json::json!({"session": ""}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request(
                "/create_session",
                serde_json::json!({"session": "s", "session_type": "zsh"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn malformed_json_is_a_400() {
        let app = router(test_state(), RouterConfig::default());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run_in_session")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn execute_endpoint_runs_one_shot_commands() {
        let app = router(test_state(), RouterConfig::default());
        let response = app
            .oneshot(json_request(
                "/execute",
                serde_json::json!({"command": ["echo", "Hello, world!"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["stdout"], "Hello, world!\n");
        assert_eq!(json["stderr"], "");
        assert_eq!(json["exit_code"], 0);
    }

    #[tokio::test]
    async fn file_endpoints_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.txt");
        let path_str = path.to_str().unwrap();
        let app = router(test_state(), RouterConfig::default());

        let response = app
            .clone()
            .oneshot(json_request(
                "/write_file",
                serde_json::json!({"path": path_str, "content": "over http"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request(
                "/read_file",
                serde_json::json!({"path": path_str}),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["content"], "over http");

        let response = app
            .oneshot(json_request(
                "/read_file",
                serde_json::json!({"path": "/no/such/file"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 511);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "FILE_NOT_FOUND");
    }

    #[tokio::test]
    async fn close_endpoint_fires_the_shutdown_token() {
        let state = test_state();
        let app = router(state.clone(), RouterConfig::default());

        assert!(!state.shutdown.is_cancelled());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/close")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.shutdown.is_cancelled());
    }
}
