use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use relay_core::now_millis;
use relay_correlator::{NotificationKind, ResponseKind};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::app::AppState;

const MAX_POLL: Duration = Duration::from_secs(60);

type HandlerResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

fn store_failed(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    warn!("response store write failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "failed to store response" })),
    )
}

/// POST /responses/{task_id}: an agent reports the terminal result of a task.
///
/// The body is stored verbatim for both the blocking waiter and the async
/// delivery path, replacing any pending timeout answer.
pub async fn task_result_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    state
        .responses
        .save_task_result(&task_id, &body, now_millis())
        .map_err(store_failed)?;
    info!(%task_id, bytes = body.len(), "task result received");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "accepted": true })),
    ))
}

/// POST /progress/{correlation_id}: one incremental update.
pub async fn progress_handler(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    let uuid = uuid::Uuid::new_v4().to_string();
    state
        .responses
        .save_response(
            ResponseKind::Progress,
            &uuid,
            &correlation_id,
            &body,
            now_millis(),
        )
        .map_err(store_failed)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "uuid": uuid, "correlation_id": correlation_id })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    #[serde(default = "default_poll_ms")]
    pub timeout_ms: u64,
}

fn default_poll_ms() -> u64 {
    25_000
}

/// GET /progress/{correlation_id}: long-poll for the next delivered
/// notification. `event` is null when nothing arrived in time.
pub async fn progress_poll_handler(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Json<Value> {
    let timeout = Duration::from_millis(query.timeout_ms).min(MAX_POLL);
    let event = state
        .hub
        .next_event(&correlation_id, timeout)
        .await
        .map(|n| {
            let kind = match n.kind {
                NotificationKind::Done => "done",
                NotificationKind::Progress => "progress",
            };
            let data = serde_json::from_slice::<Value>(&n.data)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&n.data).into_owned()));
            json!({ "kind": kind, "data": data })
        });
    Json(json!({
        "correlation_id": correlation_id,
        "event": event,
    }))
}
