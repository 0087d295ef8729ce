use axum::{extract::State, Json};
use relay_correlator::ResponseKind;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness check with correlation backlog.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let backlog = |kind| state.responses.count(kind).unwrap_or(0);
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "iterators": state.iterators,
        "sync_waiters": state.waiter.waiting(),
        "subscriptions": state.hub.subscriptions(),
        "claimed_entities": state.claimed_entities.load(Ordering::Relaxed),
        "pending": {
            "sync": backlog(ResponseKind::Sync),
            "async": backlog(ResponseKind::Async),
            "progress": backlog(ResponseKind::Progress),
        },
    }))
}
