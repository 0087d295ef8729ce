use std::fmt;

use serde::{Deserialize, Serialize};

/// Which of the three response tables a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// Read by a blocked `wait_for_task` caller.
    Sync,
    /// Claimed by the async poller and handed to the notify engine.
    Async,
    /// Incremental updates keyed by a caller-chosen correlation id.
    Progress,
}

impl ResponseKind {
    pub fn table(self) -> &'static str {
        match self {
            ResponseKind::Sync => "sync_task_responses",
            ResponseKind::Async => "async_task_responses",
            ResponseKind::Progress => "task_progress_responses",
        }
    }

    /// The other table holding a copy of the same terminal task result.
    pub fn counterpart(self) -> Option<ResponseKind> {
        match self {
            ResponseKind::Sync => Some(ResponseKind::Async),
            ResponseKind::Async => Some(ResponseKind::Sync),
            ResponseKind::Progress => None,
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseKind::Sync => "sync",
            ResponseKind::Async => "async",
            ResponseKind::Progress => "progress",
        };
        write!(f, "{s}")
    }
}

/// One row of a response table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub uuid: String,
    pub correlation_id: String,
    pub response_data: Vec<u8>,
    /// Earliest delivery time; doubles as the poller's claim lock.
    pub process_after: i64,
    /// Records past this instant are purged undelivered.
    pub valid_until: i64,
    pub created_at: i64,
}

impl ResponseRecord {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            correlation_id: row.get(1)?,
            response_data: row.get(2)?,
            process_after: row.get(3)?,
            valid_until: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

/// Synthetic failure written ahead of time so every task ends with some answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotifyResponse {
    pub error_message: String,
    #[serde(default)]
    pub expired: bool,
}

impl ErrorNotifyResponse {
    pub fn expired(task_id: &str) -> Self {
        Self {
            error_message: format!("Task {task_id} did not report a result before its deadline"),
            expired: true,
        }
    }

    pub fn aborted(task_id: &str, reason: Option<&str>) -> Self {
        let error_message = match reason {
            Some(r) => format!("Task {task_id} was aborted: {r}"),
            None => format!("Task {task_id} was aborted"),
        };
        Self {
            error_message,
            expired: false,
        }
    }
}

/// Terminal answer handed to a synchronous waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResponse {
    pub task_id: String,
    pub data: Vec<u8>,
}

impl TaskResponse {
    /// Parse the payload as JSON. Agents are free to send any bytes.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.data)
    }

    /// `true` when this is the synthetic timeout answer, not a real result.
    pub fn is_expired(&self) -> bool {
        serde_json::from_slice::<ErrorNotifyResponse>(&self.data)
            .map(|e| e.expired)
            .unwrap_or(false)
    }
}

impl From<ResponseRecord> for TaskResponse {
    fn from(record: ResponseRecord) -> Self {
        Self {
            task_id: record.uuid,
            data: record.response_data,
        }
    }
}
