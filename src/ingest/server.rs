//! Ingest HTTP Surface
//!
//! Loopback-bound axum server: POST /events accepts a single JSON event or
//! an NDJSON batch, GET /health is a liveness probe, GET /status reports
//! queue depth and component heartbeats. Mutating calls require the bearer
//! token. The server never blocks on pipeline progress; queue appends fall
//! back to the overflow sidecar internally.

use super::importance::ImportanceScorer;
use crate::config::DataPaths;
use crate::events::{next_event_id, now_ns, Event, QueueEntry};
use crate::heartbeat::{component_status, ComponentStatus};
use crate::pipeline::PipelineStats;
use crate::queue::EventQueue;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<EventQueue>,
    pub paths: DataPaths,
    pub token: String,
    pub depth_gauge: Arc<AtomicU64>,
    pub hard_pressure: u64,
    /// Bounds in-flight ingest work
    pub workers: Arc<tokio::sync::Semaphore>,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/events", post(post_events))
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ComponentReport {
    status: ComponentStatus,
}

#[derive(Serialize)]
struct StatusReport {
    queue_depth: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_cycle_age_s: Option<i64>,
    components: std::collections::BTreeMap<&'static str, ComponentReport>,
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    let stats = PipelineStats::load(&state.paths.pipeline_stats()).unwrap_or_default();
    let mut components = std::collections::BTreeMap::new();
    for worker in ["kaitd", "bridge", "advisory"] {
        components.insert(
            worker,
            ComponentReport {
                status: component_status(&state.paths, worker),
            },
        );
    }
    Json(StatusReport {
        queue_depth: state.queue.depth(),
        last_cycle_age_s: stats.last_cycle_age_s(),
        components,
    })
}

#[derive(Serialize)]
struct AcceptedReport {
    accepted: usize,
}

#[derive(Serialize)]
struct ErrorReport {
    error: String,
}

async fn post_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !authorized(&headers, &state.token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorReport {
                error: "missing or invalid bearer token".to_string(),
            }),
        )
            .into_response();
    }

    let Ok(_permit) = state.workers.acquire().await else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorReport {
                error: "shutting down".to_string(),
            }),
        )
            .into_response();
    };

    let depth = state.depth_gauge.load(Ordering::Relaxed);
    if depth > state.hard_pressure {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", "5")],
            Json(ErrorReport {
                error: "queue under pressure".to_string(),
            }),
        )
            .into_response();
    }

    let events = match parse_events(&body) {
        Ok(events) => events,
        Err(detail) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorReport { error: detail }),
            )
                .into_response();
        }
    };

    let queue = state.queue.clone();
    let gauge = state.depth_gauge.clone();
    let count = events.len();
    let appended = tokio::task::spawn_blocking(move || {
        for event in &events {
            queue.append(&QueueEntry::new(event.clone()))?;
            gauge.fetch_add(1, Ordering::Relaxed);
        }
        crate::errors::Result::Ok(())
    })
    .await;

    match appended {
        Ok(Ok(())) => {
            (StatusCode::ACCEPTED, Json(AcceptedReport { accepted: count })).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("Queue append failed past overflow: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorReport {
                    error: "queue unavailable".to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Ingest worker panicked: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorReport {
                    error: "internal error".to_string(),
                }),
            )
                .into_response()
        }
    }
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    match value.strip_prefix("Bearer ") {
        Some(presented) => presented == token,
        None => false,
    }
}

/// Parse a single JSON event or an NDJSON batch, normalizing missing
/// metadata and assigning importance.
fn parse_events(body: &str) -> std::result::Result<Vec<Event>, String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err("empty body".to_string());
    }

    // A single event may span lines when pretty-printed; try the whole body
    // first, then fall back to NDJSON.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Ok(vec![normalize(value)?]);
        }
        return Err("event must be a JSON object".to_string());
    }

    let mut events = Vec::new();
    for (n, line) in trimmed.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| format!("line {}: invalid JSON: {}", n + 1, e))?;
        events.push(normalize(value).map_err(|e| format!("line {}: {}", n + 1, e))?);
    }
    if events.is_empty() {
        return Err("no events in body".to_string());
    }
    Ok(events)
}

fn normalize(mut value: Value) -> std::result::Result<Event, String> {
    let object = value
        .as_object_mut()
        .ok_or_else(|| "event must be a JSON object".to_string())?;
    if !object.contains_key("event_id") {
        object.insert("event_id".to_string(), Value::String(next_event_id()));
    }
    if !object.contains_key("ts_ns") {
        object.insert("ts_ns".to_string(), Value::from(now_ns()));
    }
    if !object.contains_key("source") {
        object.insert("source".to_string(), Value::String("observe".to_string()));
    }
    let mut event: Event =
        serde_json::from_value(value).map_err(|e| format!("invalid event: {}", e))?;
    event.importance = ImportanceScorer::score(&event);
    Ok(event)
}
