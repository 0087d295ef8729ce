use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one dispatched task. Always freshly generated, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of an execution environment created by a setup task.
///
/// UUIDv7 so infra ids sort by creation time in logs; reused by every step
/// of the same execution to pin them to one environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfraId(pub String);

impl InfraId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InfraId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InfraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InfraId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How a claim rewrites an entity's iteration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Single timestamp, moved to `base + target_interval` on every claim.
    #[default]
    Regular,
    /// Queue of explicit ticks; a claim pops the earliest.
    Irregular,
    /// Queue of explicit ticks; a claim drops every tick up to the throttle threshold.
    IrregularSkipMissed,
}

impl SchedulingPolicy {
    /// Regular fields hold one integer; the irregular variants hold a JSON queue.
    pub fn is_queue(&self) -> bool {
        !matches!(self, SchedulingPolicy::Regular)
    }
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulingPolicy::Regular => "regular",
            SchedulingPolicy::Irregular => "irregular",
            SchedulingPolicy::IrregularSkipMissed => "irregular_skip_missed",
        };
        write!(f, "{s}")
    }
}

/// Loop style of an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Drain every ready entity, then sleep until the next wake-up.
    #[default]
    Pump,
    /// One claim-handle cycle per timer tick.
    Loop,
}

/// Current wall-clock time as epoch milliseconds, the unit of every stored timestamp.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn policy_serializes_snake_case() {
        let json = serde_json::to_string(&SchedulingPolicy::IrregularSkipMissed).unwrap();
        assert_eq!(json, r#""irregular_skip_missed""#);
        assert!(SchedulingPolicy::Irregular.is_queue());
        assert!(!SchedulingPolicy::Regular.is_queue());
    }
}
