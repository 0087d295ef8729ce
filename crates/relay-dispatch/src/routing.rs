use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use relay_core::config::AgentGroupConfig;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::db::init_db;
use crate::error::{DispatchError, Result};
use crate::types::{describe, Capability, TaskRecord};

/// Capability registry plus transport: decides which agents may run a task
/// and delivers it to them.
#[async_trait]
pub trait TaskRouter: Send + Sync {
    /// Hand `task` to an eligible agent. No eligible agent is
    /// [`DispatchError::NoEligibleAgent`].
    async fn send(&self, task: &TaskRecord) -> Result<()>;
}

/// Static list of agent groups and the tags they advertise.
#[derive(Debug, Clone, Default)]
pub struct AgentDirectory {
    groups: Vec<AgentGroupConfig>,
}

impl AgentDirectory {
    pub fn new(groups: Vec<AgentGroupConfig>) -> Self {
        Self { groups }
    }

    /// First group (in configured order) satisfying every capability.
    ///
    /// `infra_owner` is the group that ran the setup of the infra named by an
    /// `InfraAffinity` capability, if any.
    pub fn eligible(
        &self,
        capabilities: &[Capability],
        infra_owner: Option<&str>,
    ) -> Option<&AgentGroupConfig> {
        self.groups.iter().find(|group| {
            capabilities.iter().all(|cap| match cap {
                Capability::RunnerType(tag) | Capability::Selector(tag) => {
                    group.tags.iter().any(|t| t == tag)
                }
                Capability::InfraAffinity(_) => infra_owner == Some(group.id.as_str()),
            })
        })
    }
}

/// A queued task as an agent sees it when picking up work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundTask {
    pub task_id: String,
    pub task_type: String,
    pub infra_id: Option<String>,
    pub payload: serde_json::Value,
    pub wait_id: String,
    pub timeout_ms: i64,
}

/// [`TaskRouter`] that matches capabilities against an [`AgentDirectory`]
/// and persists the task to `outbound_tasks` for the chosen group.
pub struct OutboxRouter {
    db: Mutex<Connection>,
    directory: AgentDirectory,
}

impl OutboxRouter {
    pub fn new(conn: Connection, directory: AgentDirectory) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            directory,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Agent group that ran the setup of `infra_id`.
    pub fn infra_owner(&self, infra_id: &str) -> Result<Option<String>> {
        let owner = self
            .conn()
            .query_row(
                "SELECT agent_group FROM outbound_tasks
                 WHERE infra_id = ?1 AND task_type = 'setup'
                 ORDER BY created_at, rowid LIMIT 1",
                [infra_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    /// Hand up to `limit` queued tasks to an agent of `group`, marking them dispatched.
    #[instrument(skip(self))]
    pub fn take_queued(&self, group: &str, limit: usize) -> Result<Vec<OutboundTask>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "UPDATE outbound_tasks SET status = 'dispatched'
             WHERE task_id IN (
                 SELECT task_id FROM outbound_tasks
                 WHERE agent_group = ?1 AND status = 'queued'
                 ORDER BY created_at, rowid LIMIT ?2
             )
             RETURNING task_id, task_type, infra_id, payload, wait_id, timeout_ms",
        )?;
        let rows = stmt.query_map(rusqlite::params![group, limit as i64], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)?,
            ))
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            let (task_id, task_type, infra_id, payload, wait_id, timeout_ms) = row?;
            tasks.push(OutboundTask {
                task_id,
                task_type,
                infra_id,
                payload: serde_json::from_str(&payload)?,
                wait_id,
                timeout_ms,
            });
        }
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "tasks handed to agent");
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskRouter for OutboxRouter {
    async fn send(&self, task: &TaskRecord) -> Result<()> {
        let affinity = task.capabilities.iter().find_map(|c| match c {
            Capability::InfraAffinity(infra) => Some(infra.as_str()),
            _ => None,
        });
        let owner = match affinity {
            Some(infra) => self.infra_owner(infra)?,
            None => None,
        };
        let group = self
            .directory
            .eligible(&task.capabilities, owner.as_deref())
            .ok_or_else(|| DispatchError::NoEligibleAgent {
                capabilities: describe(&task.capabilities),
            })?;

        self.conn().execute(
            "INSERT INTO outbound_tasks
             (task_id, task_type, agent_group, infra_id, capabilities, payload,
              wait_id, account_id, timeout_ms, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'queued', ?10)",
            rusqlite::params![
                task.id.as_str(),
                task.task_type.as_str(),
                group.id,
                task.infra_id.as_ref().map(|i| i.as_str()),
                serde_json::to_string(&task.capabilities)?,
                serde_json::to_string(&task.payload)?,
                task.wait_id,
                task.account_id,
                i64::try_from(task.timeout_ms).unwrap_or(i64::MAX),
                task.created_at,
            ],
        )?;
        info!(
            task_id = %task.id,
            task_type = task.task_type.as_str(),
            agent_group = %group.id,
            "task queued"
        );
        Ok(())
    }
}
