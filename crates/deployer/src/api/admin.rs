//! Admin endpoints — status dashboard, container logs, metrics exposition.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use super::extract::AdminGate;
use crate::error::DeployError;
use crate::state::SharedState;

/// GET /admin/status
pub async fn admin_status(State(state): State<SharedState>, _gate: AdminGate) -> Response {
    match build_admin_status(&state).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            state.metrics.record_error(&e);
            e.into_response()
        }
    }
}

async fn build_admin_status(state: &SharedState) -> Result<serde_json::Value, DeployError> {
    let now = chrono::Utc::now().timestamp();

    let active = state.store.count_running().await?;
    let total_created = state.store.count_total().await?;
    let port_counts = state.ports.counts().await?;
    let pool_size = state.config.ports.pool_size() as i64;
    let port_usage_percent = if pool_size > 0 {
        (port_counts.allocated as f64 / pool_size as f64) * 100.0
    } else {
        0.0
    };

    let pool = state.store.pool_status();
    let snapshot = state.resources.snapshot();

    let containers: Vec<serde_json::Value> = state
        .store
        .list_containers()
        .await?
        .into_iter()
        .map(|row| {
            json!({
                "id": row.id.chars().take(12).collect::<String>(),
                "full_id": row.id,
                "port": row.port,
                "start_time": row.start_time,
                "expiration_time": row.expiration_time,
                "time_left": row.time_left(now),
                "running": row.is_running(),
                "status": row.status,
                "user_uuid": row.user_uuid,
                "ip_address": row.ip_address,
            })
        })
        .collect();

    state.metrics.active_containers.set(active);

    Ok(json!({
        "status": "ok",
        "challenge": state.config.challenge_name,
        "metrics": {
            "active_containers": active,
            "total_containers_created": total_created,
            "available_ports": port_counts.free,
            "port_usage_percent": port_usage_percent,
        },
        "database": {
            "host": state.config.store.host,
            "name": state.config.store.name,
            "connection_pool": {
                "status": "connected",
                "free_connections": pool.idle,
                "max_connections": pool.max,
            },
        },
        "resources": {
            "containers": {
                "current": snapshot.containers.current,
                "limit": snapshot.containers.limit,
                "percent": snapshot.containers.percent(),
            },
            "cpu": {
                "current": snapshot.cpu.current,
                "limit": snapshot.cpu.limit,
                "percent": snapshot.cpu.percent(),
            },
            "memory": {
                "current": snapshot.memory.current,
                "limit": snapshot.memory.limit,
                "percent": snapshot.memory.percent(),
            },
            "last_updated": snapshot.last_updated,
        },
        "rate_limiting": {
            "max_containers_per_hour": state.limiter.limit(),
            "window_seconds": state.limiter.window_sec(),
        },
        "containers": containers,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub container_id: Option<String>,
    pub tail: Option<u32>,
    pub since: Option<i64>,
    pub format: Option<String>,
}

/// GET /logs
pub async fn logs(
    State(state): State<SharedState>,
    _gate: AdminGate,
    Query(query): Query<LogsQuery>,
) -> Response {
    if !state.config.admin.enable_logs_endpoint {
        return StatusCode::NOT_FOUND.into_response();
    }

    let tail = query.tail.unwrap_or(100);
    let as_json = query.format.as_deref() == Some("json");

    let result = match &query.container_id {
        Some(container_id) => {
            match state.docker.tail_logs(container_id, tail, query.since).await {
                Ok(lines) => Ok(vec![(container_id.clone(), lines)]),
                Err(e) => Err(DeployError::from(e)),
            }
        }
        None => collect_deployment_logs(&state, tail, query.since).await,
    };

    match result {
        Ok(sections) => render_logs(sections, as_json),
        Err(e) => {
            state.metrics.record_error(&e);
            e.into_response()
        }
    }
}

async fn collect_deployment_logs(
    state: &SharedState,
    tail: u32,
    since: Option<i64>,
) -> Result<Vec<(String, Vec<String>)>, DeployError> {
    let snapshots = state
        .docker
        .list_deployment_containers(&state.config.compose_project)
        .await?;

    let mut sections = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        match state.docker.tail_logs(&snapshot.id, tail, since).await {
            Ok(lines) => sections.push((snapshot.name, lines)),
            Err(e) if e.is_not_found() => continue, // raced with removal
            Err(e) => {
                tracing::warn!(
                    container_id = %snapshot.id,
                    error = %e,
                    "Skipping unreadable container logs"
                );
            }
        }
    }
    Ok(sections)
}

fn render_logs(sections: Vec<(String, Vec<String>)>, as_json: bool) -> Response {
    if as_json {
        if sections.len() == 1 {
            let (_, lines) = sections.into_iter().next().unwrap_or_default();
            return Json(json!({ "logs": lines })).into_response();
        }
        let by_container: serde_json::Map<String, serde_json::Value> = sections
            .into_iter()
            .map(|(name, lines)| (name, json!(lines)))
            .collect();
        return Json(json!({ "logs": by_container })).into_response();
    }

    let mut text = String::new();
    let multi = sections.len() > 1;
    for (name, lines) in sections {
        if multi {
            text.push_str(&format!("==== {} ====\n", name));
        }
        for line in lines {
            text.push_str(&line);
            text.push('\n');
        }
    }
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response()
}

/// GET /metrics
pub async fn metrics(State(state): State<SharedState>, _gate: AdminGate) -> Response {
    if !state.config.admin.enable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }
    // Refresh gauges sampled on demand rather than by the monitor loop.
    state.store.pool_status();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.gather(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_logs_single_container_json() {
        let response = render_logs(
            vec![("web".to_string(), vec!["a".to_string(), "b".to_string()])],
            true,
        );
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_render_logs_text_multi_has_section_headers() {
        let sections = vec![
            ("api".to_string(), vec!["one".to_string()]),
            ("db".to_string(), vec!["two".to_string()]),
        ];
        let response = render_logs(sections, false);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_render_logs_text_single_has_no_header() {
        let response = render_logs(vec![("api".to_string(), vec!["x".to_string()])], false);
        assert_eq!(response.status(), StatusCode::OK);
    }
}
