//! HTTP surface — router assembly and middleware stack.

pub mod admin;
pub mod extract;
pub mod user;

use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

/// Build the application router.
pub fn build_router(state: SharedState) -> Router {
    let request_timeout =
        Duration::from_secs(state.config.maintenance.operation_timeout_sec.max(1) + 5);

    Router::new()
        .route("/", get(user::index_page))
        .route("/admin", get(user::admin_page))
        .route("/get_captcha", get(user::get_captcha))
        .route("/deploy", post(user::deploy))
        .route("/stop", post(user::stop))
        .route("/restart", post(user::restart))
        .route("/extend", post(user::extend))
        .route("/status", get(user::status))
        .route("/health", get(user::health))
        .route("/admin/status", get(admin::admin_status))
        .route("/logs", get(admin::logs))
        .route("/metrics", get(admin::metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    request_timeout,
                ))
                // Request bodies are tiny JSON objects; 64 KiB is generous.
                .layer(DefaultBodyLimit::max(64 * 1024))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_index_page_served() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_captcha_sets_identity_cookie() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/get_captcha").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("fresh identity must set the cookie")
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("ctf_user="));
        assert!(cookie.contains("HttpOnly"));

        let body = body_json(response).await;
        assert!(body["captcha_id"].is_string());
        assert!(body["captcha_image"]
            .as_str()
            .unwrap()
            .starts_with("data:image/svg+xml;base64,"));
    }

    #[tokio::test]
    async fn test_existing_cookie_not_reissued() {
        let app = build_router(test_state());
        let uuid = uuid::Uuid::new_v4();
        let response = app
            .oneshot(
                Request::get("/get_captcha")
                    .header(header::COOKIE, format!("ctf_user={}", uuid))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_admin_status_forbidden_without_credentials() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_logs_forbidden_without_credentials() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/logs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_metrics_with_header_key() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::get("/metrics")
                    .header("x-admin-key", "test-admin-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("ctf_deployer_info"));
    }

    #[tokio::test]
    async fn test_metrics_with_query_key() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::get("/metrics?admin_key=test-admin-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_deploy_with_bad_captcha_is_400() {
        // The captcha check runs before any store access, so this exercises
        // the full handler path without a database.
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::post("/deploy")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"captcha_id":"ghost","captcha_answer":"1"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "captcha invalid");
    }
}
