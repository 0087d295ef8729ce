use std::collections::BTreeMap;
use std::fmt;

use relay_core::{InfraId, TaskId};
use serde::{Deserialize, Serialize};

/// One requirement the routing layer must satisfy when picking an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Capability {
    /// The agent must host this runner type.
    RunnerType(String),
    /// The agent must carry this tag.
    Selector(String),
    /// The agent must be the one that owns this infra.
    InfraAffinity(String),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::RunnerType(r) => write!(f, "runner:{r}"),
            Capability::Selector(s) => write!(f, "selector:{s}"),
            Capability::InfraAffinity(i) => write!(f, "infra:{i}"),
        }
    }
}

/// Render a capability list for logs and error messages.
pub fn describe(capabilities: &[Capability]) -> String {
    capabilities
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Setup,
    Execute,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Setup => "setup",
            TaskType::Execute => "execute",
        }
    }
}

/// Unit of work handed to the routing layer. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub capabilities: Vec<Capability>,
    pub infra_id: Option<InfraId>,
    pub timeout_ms: u64,
    /// Correlation id the agent reports its result under.
    pub wait_id: String,
    pub account_id: String,
    pub created_at: i64,
}

/// Result of a successful `init_task`.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupOutcome {
    pub task_id: TaskId,
    pub infra_id: InfraId,
    /// Step id → freshly generated task id.
    pub step_task_ids: BTreeMap<String, TaskId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_wire_shape() {
        let json = serde_json::to_value(Capability::Selector("gpu".into())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "selector", "value": "gpu"}));
    }

    #[test]
    fn describe_joins_capabilities() {
        let caps = [
            Capability::RunnerType("k8s".into()),
            Capability::Selector("gpu".into()),
        ];
        assert_eq!(describe(&caps), "runner:k8s, selector:gpu");
    }
}
