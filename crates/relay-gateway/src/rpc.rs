use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, Json};
use relay_core::error::code;
use relay_core::RelayError;
use relay_correlator::{CorrelatorError, Notification, TaskResponse};
use relay_dispatch::DispatchError;
use relay_protocol::messages::{
    AbortRequest, AbortResponse, ExecuteRequest, ExecuteResponse, SetupRequest, SetupResponse,
    TaskStatusRequest, WaitRequest, WaitResponse,
};
use relay_protocol::{methods, InboundFrame, ReqFrame, ResFrame};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::app::AppState;

/// Upper bound on a single `task.wait`; longer waits are clamped.
const MAX_WAIT: Duration = Duration::from_secs(300);

/// POST /rpc: one request frame in, one response frame out.
pub async fn rpc_handler(
    State(state): State<Arc<AppState>>,
    Json(frame): Json<InboundFrame>,
) -> Json<ResFrame> {
    let Some(req) = frame.as_req() else {
        return Json(ResFrame::err(
            "",
            code::INVALID_ARGUMENT,
            "expected a req frame",
        ));
    };
    Json(route(&req, &state).await)
}

/// Route an RPC method call to its handler.
pub async fn route(req: &ReqFrame, app: &AppState) -> ResFrame {
    debug!(method = %req.method, id = %req.id, "rpc");
    match req.method.as_str() {
        methods::PING => ResFrame::ok(&req.id, serde_json::json!({ "pong": true })),
        methods::TASK_INIT => handle_init(req, app).await,
        methods::TASK_EXECUTE => handle_execute(req, app).await,
        methods::TASK_STATUS => handle_status(req, app),
        methods::TASK_WAIT => handle_wait(req, app).await,
        methods::TASK_AWAIT => handle_await(req, app).await,
        methods::TASK_ABORT => handle_abort(req, app),
        other => {
            let e = RelayError::MethodNotFound {
                method: other.to_string(),
            };
            ResFrame::err(&req.id, e.code(), &e.to_string())
        }
    }
}

fn params<T: DeserializeOwned>(req: &ReqFrame) -> Result<T, ResFrame> {
    req.parse_params()
        .map_err(|e| ResFrame::err(&req.id, e.code(), &e.to_string()))
}

fn dispatch_err(req: &ReqFrame, e: DispatchError) -> ResFrame {
    if e.code() == code::INTERNAL {
        warn!(method = %req.method, "dispatch failed: {e}");
    }
    ResFrame::err(&req.id, e.code(), &e.to_string())
}

async fn handle_init(req: &ReqFrame, app: &AppState) -> ResFrame {
    let request: SetupRequest = match params(req) {
        Ok(r) => r,
        Err(res) => return res,
    };
    match app.dispatcher.init_task(request.config).await {
        Ok(outcome) => ResFrame::ok(
            &req.id,
            SetupResponse {
                task_id: outcome.task_id.to_string(),
                infra_id: outcome.infra_id.to_string(),
                step_task_ids: outcome
                    .step_task_ids
                    .into_iter()
                    .map(|(step, id)| (step, id.to_string()))
                    .collect(),
            },
        ),
        Err(e) => dispatch_err(req, e),
    }
}

async fn handle_execute(req: &ReqFrame, app: &AppState) -> ResFrame {
    let request: ExecuteRequest = match params(req) {
        Ok(r) => r,
        Err(res) => return res,
    };
    match app.dispatcher.execute_task(Some(request)).await {
        Ok(task_id) => ResFrame::ok(
            &req.id,
            ExecuteResponse {
                task_id: task_id.to_string(),
            },
        ),
        Err(e) => dispatch_err(req, e),
    }
}

fn handle_status(req: &ReqFrame, app: &AppState) -> ResFrame {
    let request: TaskStatusRequest = match params(req) {
        Ok(r) => r,
        Err(res) => return res,
    };
    match app.dispatcher.get_task_status(&request.task_id) {
        Ok(()) => ResFrame::ok(&req.id, Value::Null),
        Err(e) => dispatch_err(req, e),
    }
}

fn wait_params(req: &ReqFrame) -> Result<(WaitRequest, Duration), ResFrame> {
    let request: WaitRequest = params(req)?;
    if request.task_id.trim().is_empty() {
        return Err(ResFrame::err(
            &req.id,
            code::INVALID_ARGUMENT,
            "task_id is required",
        ));
    }
    let timeout = Duration::from_millis(request.timeout_ms).min(MAX_WAIT);
    Ok((request, timeout))
}

fn wait_response(req: &ReqFrame, response: TaskResponse) -> ResFrame {
    let body = response.json().unwrap_or_else(|_| {
        Value::String(String::from_utf8_lossy(&response.data).into_owned())
    });
    ResFrame::ok(
        &req.id,
        WaitResponse {
            expired: response.is_expired(),
            task_id: response.task_id,
            response: body,
        },
    )
}

fn from_notification(n: Notification) -> TaskResponse {
    TaskResponse {
        task_id: n.correlation_id,
        data: n.data,
    }
}

/// `task.wait`: block on the sync table. A result the async path already
/// delivered is picked up from the hub instead.
async fn handle_wait(req: &ReqFrame, app: &AppState) -> ResFrame {
    let (request, timeout) = match wait_params(req) {
        Ok(r) => r,
        Err(res) => return res,
    };

    match app.waiter.wait_for_task(&request.task_id, timeout).await {
        Ok(response) => wait_response(req, response),
        Err(e @ CorrelatorError::TaskNotCompleted { .. }) => {
            match app.hub.take_completed(&request.task_id) {
                Some(n) => wait_response(req, from_notification(n)),
                None => ResFrame::err(&req.id, e.code(), &e.to_string()),
            }
        }
        Err(e) => ResFrame::err(&req.id, e.code(), &e.to_string()),
    }
}

/// `task.await`: wait for the async delivery of a task result.
async fn handle_await(req: &ReqFrame, app: &AppState) -> ResFrame {
    let (request, timeout) = match wait_params(req) {
        Ok(r) => r,
        Err(res) => return res,
    };

    match app.hub.wait_done(&request.task_id, timeout).await {
        Some(n) => wait_response(req, from_notification(n)),
        None => {
            let e = CorrelatorError::TaskNotCompleted {
                task_id: request.task_id,
            };
            ResFrame::err(&req.id, e.code(), &e.to_string())
        }
    }
}

fn handle_abort(req: &ReqFrame, app: &AppState) -> ResFrame {
    let request: AbortRequest = match params(req) {
        Ok(r) => r,
        Err(res) => return res,
    };
    match app
        .dispatcher
        .abort_task(&request.task_id, request.reason.as_deref())
    {
        Ok(()) => ResFrame::ok(
            &req.id,
            AbortResponse {
                task_id: request.task_id,
                aborted: true,
            },
        ),
        Err(e) => dispatch_err(req, e),
    }
}
