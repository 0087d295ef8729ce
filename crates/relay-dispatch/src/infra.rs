use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use relay_core::now_millis;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::db::init_db;
use crate::error::Result;

/// Execution-infrastructure registry: which step task ids belong to an infra.
pub trait InfraRegistry: Send + Sync {
    fn register(&self, infra_id: &str, step_task_ids: &BTreeMap<String, String>) -> Result<()>;
    fn lookup(&self, infra_id: &str) -> Result<Option<BTreeMap<String, String>>>;
    fn remove(&self, infra_id: &str) -> Result<bool>;
}

/// [`InfraRegistry`] backed by the `infra_mappings` table.
pub struct SqliteInfraRegistry {
    db: Mutex<Connection>,
}

impl SqliteInfraRegistry {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InfraRegistry for SqliteInfraRegistry {
    fn register(&self, infra_id: &str, step_task_ids: &BTreeMap<String, String>) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO infra_mappings (infra_id, step_task_ids, created_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![infra_id, serde_json::to_string(step_task_ids)?, now_millis()],
        )?;
        debug!(%infra_id, steps = step_task_ids.len(), "infra mapping registered");
        Ok(())
    }

    fn lookup(&self, infra_id: &str) -> Result<Option<BTreeMap<String, String>>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT step_task_ids FROM infra_mappings WHERE infra_id = ?1",
                [infra_id],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, infra_id: &str) -> Result<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM infra_mappings WHERE infra_id = ?1", [infra_id])?;
        Ok(n == 1)
    }
}
