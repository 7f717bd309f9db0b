//! Bearer-token authentication middleware.
//!
//! The token is fixed at process startup. Comparison is constant-time; a
//! missing or wrong token is rejected with 401 before any handler runs, so
//! unauthenticated requests never touch runtime state.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    let auth_header = req.headers().get("authorization")?;
    let auth_str = auth_header.to_str().ok()?;
    auth_str.strip_prefix("Bearer ").map(str::to_string)
}

pub async fn require_auth(
    expected_token: String,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match extract_bearer(&req) {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected_token.as_bytes())) => {
            Ok(next.run(req).await)
        }
        _ => Err(ApiError::auth_failed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn test_app(token: &str) -> Router {
        let token = token.to_string();
        Router::new()
            .route("/test", get(ok_handler))
            .layer(axum::middleware::from_fn(move |req, next| {
                let t = token.clone();
                async move { require_auth(t, req, next).await }
            }))
    }

    #[test]
    fn extract_bearer_with_header() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer my-secret-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), Some("my-secret-token".to_string()));
    }

    #[test]
    fn extract_bearer_without_header() {
        let req = Request::builder().uri("/test").body(Body::empty()).unwrap();
        assert_eq!(extract_bearer(&req), None);
    }

    #[test]
    fn extract_bearer_ignores_other_schemes() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), None);
    }

    #[tokio::test]
    async fn valid_token_passes() {
        let app = test_app("secret");
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let app = test_app("secret");
        let response = app
            .oneshot(Request::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_is_401() {
        let app = test_app("secret");
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .header("authorization", "Bearer not-the-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
