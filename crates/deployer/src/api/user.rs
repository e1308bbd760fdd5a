//! User-facing endpoints — captcha, deploy, stop, restart, extend, status.

use axum::extract::State;
use axum::response::{Html, IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use super::extract::{SourceIp, UserIdentity};
use crate::error::DeployError;
use crate::state::SharedState;

/// Convert an orchestrator outcome into a response, recording errors and
/// attaching the identity cookie when one was just issued.
fn finish(
    state: &SharedState,
    identity: &UserIdentity,
    result: Result<serde_json::Value, DeployError>,
) -> Response {
    let mut response = match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            state.metrics.record_error(&e);
            e.into_response()
        }
    };
    identity.apply(&mut response);
    response
}

pub async fn index_page() -> Html<&'static str> {
    Html(include_str!("pages/index.html"))
}

pub async fn admin_page() -> Html<&'static str> {
    Html(include_str!("pages/admin.html"))
}

/// GET /get_captcha
pub async fn get_captcha(State(state): State<SharedState>, identity: UserIdentity) -> Response {
    let now = chrono::Utc::now().timestamp();
    let issued = state.captcha.issue(now);
    finish(
        &state,
        &identity,
        Ok(json!({
            "captcha_id": issued.id,
            "captcha_image": issued.image_data_uri,
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub captcha_id: String,
    #[serde(default)]
    pub captcha_answer: String,
}

/// POST /deploy
pub async fn deploy(
    State(state): State<SharedState>,
    identity: UserIdentity,
    SourceIp(ip): SourceIp,
    Json(body): Json<DeployRequest>,
) -> Response {
    let result = state
        .orchestrator
        .deploy(&identity.uuid, &ip, &body.captcha_id, &body.captcha_answer)
        .await
        .map(|instance| {
            json!({
                "message": "challenge deployed",
                "port": instance.port,
                "expiration_time": instance.expiration_time,
            })
        });
    finish(&state, &identity, result)
}

/// POST /stop
pub async fn stop(State(state): State<SharedState>, identity: UserIdentity) -> Response {
    let result = state
        .orchestrator
        .stop(&identity.uuid)
        .await
        .map(|()| json!({ "message": "challenge stopped" }));
    finish(&state, &identity, result)
}

/// POST /restart
pub async fn restart(State(state): State<SharedState>, identity: UserIdentity) -> Response {
    let result = state
        .orchestrator
        .restart(&identity.uuid)
        .await
        .map(|instance| {
            json!({
                "message": "challenge restarted",
                "port": instance.port,
                "expiration_time": instance.expiration_time,
            })
        });
    finish(&state, &identity, result)
}

/// POST /extend
pub async fn extend(State(state): State<SharedState>, identity: UserIdentity) -> Response {
    let result = state
        .orchestrator
        .extend(&identity.uuid)
        .await
        .map(|new_expiration| json!({ "new_expiration_time": new_expiration }));
    finish(&state, &identity, result)
}

/// GET /status — public; includes the caller's own instance when present.
pub async fn status(State(state): State<SharedState>, identity: UserIdentity) -> Response {
    let now = chrono::Utc::now().timestamp();
    let owned = match state.orchestrator.get_owned(&identity.uuid).await {
        Ok(owned) => owned,
        Err(e) => return finish(&state, &identity, Err(e)),
    };

    let instance = match owned {
        Some(row) => {
            let engine_state = match state.docker.container_state(&row.id).await {
                Ok(engine_state) => engine_state,
                Err(e) if e.is_not_found() => "missing".to_string(),
                Err(e) => {
                    tracing::warn!(container_id = %row.id, error = %e, "Engine state probe failed");
                    "unknown".to_string()
                }
            };
            Some(json!({
                "port": row.port,
                "start_time": row.start_time,
                "expiration_time": row.expiration_time,
                "time_left": row.time_left(now),
                "state": engine_state,
            }))
        }
        None => None,
    };

    finish(
        &state,
        &identity,
        Ok(json!({
            "status": "ok",
            "challenge": state.config.challenge_name,
            "instance": instance,
        })),
    )
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}
