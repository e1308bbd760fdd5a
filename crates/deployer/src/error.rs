//! Central error type — one enum per user-visible failure class.
//!
//! Single source of truth for converting orchestration failures into HTTP
//! responses. Internal details are logged server-side and sanitized before
//! they reach a client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

use crate::docker::DriverError;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("captcha invalid")]
    CaptchaInvalid,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("resource {resource} exhausted")]
    QuotaExceeded {
        resource: String,
        current: f64,
        limit: f64,
    },

    #[error("existing instance")]
    AlreadyOwns,

    #[error("no free port")]
    PortPoolFull,

    #[error("engine temporarily unavailable: {0}")]
    EngineTransient(String),

    #[error("engine failure: {0}")]
    EngineFatal(String),

    #[error("store temporarily unavailable: {0}")]
    StoreTransient(String),

    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    AdminForbidden,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Metric label for `ctf_errors_total{type}`.
    pub fn metric_label(&self) -> &'static str {
        match self {
            DeployError::CaptchaInvalid => "captcha_invalid",
            DeployError::RateLimited => "rate_limited",
            DeployError::QuotaExceeded { .. } => "quota_exceeded",
            DeployError::AlreadyOwns => "already_owns",
            DeployError::PortPoolFull => "port_pool_full",
            DeployError::EngineTransient(_) => "engine_transient",
            DeployError::EngineFatal(_) => "engine_fatal",
            DeployError::StoreTransient(_) => "store_transient",
            DeployError::NotFound => "not_found",
            DeployError::AdminForbidden => "admin_forbidden",
            DeployError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DeployError::CaptchaInvalid | DeployError::AlreadyOwns => StatusCode::BAD_REQUEST,
            DeployError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            DeployError::QuotaExceeded { .. }
            | DeployError::PortPoolFull
            | DeployError::EngineTransient(_)
            | DeployError::StoreTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            DeployError::NotFound => StatusCode::NOT_FOUND,
            DeployError::AdminForbidden => StatusCode::FORBIDDEN,
            DeployError::EngineFatal(_) | DeployError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message exposed to the client. Engine/store/internal details stay
    /// server-side.
    fn public_message(&self) -> String {
        match self {
            DeployError::EngineTransient(detail) | DeployError::StoreTransient(detail) => {
                tracing::warn!(detail = %detail, "Transient backend failure surfaced to client");
                "service temporarily unavailable".to_string()
            }
            DeployError::EngineFatal(detail) | DeployError::Internal(detail) => {
                tracing::error!(detail = %detail, "Internal failure surfaced to client");
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for DeployError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.public_message() }));
        (status, body).into_response()
    }
}

impl From<DriverError> for DeployError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotFound(_) => DeployError::NotFound,
            DriverError::Conflict(detail) => DeployError::EngineTransient(detail),
            DriverError::Fatal(detail) => DeployError::EngineFatal(detail),
        }
    }
}

impl From<sqlx::Error> for DeployError {
    fn from(err: sqlx::Error) -> Self {
        if crate::store::is_transient(&err) {
            DeployError::StoreTransient(err.to_string())
        } else if matches!(err, sqlx::Error::RowNotFound) {
            DeployError::NotFound
        } else {
            DeployError::Internal(format!("database error: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_surface_contract() {
        assert_eq!(DeployError::CaptchaInvalid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(DeployError::AlreadyOwns.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(DeployError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(DeployError::PortPoolFull.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(DeployError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(DeployError::AdminForbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            DeployError::EngineFatal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            DeployError::QuotaExceeded {
                resource: "cpu".into(),
                current: 90.0,
                limit: 80.0
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_quota_message_names_resource() {
        let err = DeployError::QuotaExceeded {
            resource: "memory".into(),
            current: 9.0,
            limit: 8.0,
        };
        assert_eq!(err.to_string(), "resource memory exhausted");
    }

    #[test]
    fn test_driver_error_conversion() {
        let not_found: DeployError = DriverError::NotFound("abc".into()).into();
        assert!(matches!(not_found, DeployError::NotFound));

        let conflict: DeployError = DriverError::Conflict("busy".into()).into();
        assert!(matches!(conflict, DeployError::EngineTransient(_)));

        let fatal: DeployError = DriverError::Fatal("bad image".into()).into();
        assert!(matches!(fatal, DeployError::EngineFatal(_)));
    }

    #[test]
    fn test_internal_detail_not_exposed() {
        let err = DeployError::EngineFatal("socket /var/run/docker.sock".into());
        assert!(!err.public_message().contains("docker.sock"));
    }

    #[test]
    fn test_metric_labels_are_stable() {
        assert_eq!(DeployError::RateLimited.metric_label(), "rate_limited");
        assert_eq!(DeployError::PortPoolFull.metric_label(), "port_pool_full");
    }
}
