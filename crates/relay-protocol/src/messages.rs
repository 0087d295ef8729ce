//! Request and response bodies carried in `params` / `payload` of RPC frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One declared step of a setup; each gets its own generated task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Everything needed to provision one execution environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Kind of runner that must host the infra (becomes a capability).
    pub runner_type: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    /// Extra agent tags the routing layer must match.
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub account_id: String,
    /// Remote execution timeout; the dispatcher default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Opaque runner-specific body forwarded to the agent.
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupRequest {
    #[serde(default)]
    pub config: Option<SetupConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupResponse {
    pub task_id: String,
    pub infra_id: String,
    /// Step id → generated task id.
    pub step_task_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Infra id returned by `task.init`; the step runs on the same agent.
    #[serde(default)]
    pub infra_ref_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusRequest {
    pub task_id: String,
}

/// Block until the task's terminal response arrives or `timeout_ms` elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitRequest {
    pub task_id: String,
    #[serde(default = "default_wait_ms")]
    pub timeout_ms: u64,
}

fn default_wait_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitResponse {
    pub task_id: String,
    /// `true` when the answer is the synthetic timeout/abort failure.
    pub expired: bool,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    pub task_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortResponse {
    pub task_id: String,
    pub aborted: bool,
}
