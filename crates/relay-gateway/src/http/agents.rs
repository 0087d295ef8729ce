use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

const MAX_TAKE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct TakeQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// GET /agents/{group}/tasks: hand queued tasks to an agent of `group`.
///
/// Each task is returned exactly once; the agent reports back through
/// `/responses/{task_id}`.
pub async fn take_tasks_handler(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Query(query): Query<TakeQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let limit = query.limit.clamp(1, MAX_TAKE);
    let tasks = state.outbox.take_queued(&group, limit).map_err(|e| {
        warn!(%group, "take_queued failed: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to read task queue" })),
        )
    })?;
    Ok(Json(json!({ "group": group, "tasks": tasks })))
}
