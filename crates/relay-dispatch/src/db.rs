use rusqlite::Connection;

use crate::error::Result;

/// Initialise the dispatch schema in `conn`.
///
/// `outbound_tasks` is the queue agents pick work from; `infra_mappings`
/// remembers which step task ids belong to each created infra.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbound_tasks (
            task_id       TEXT    NOT NULL PRIMARY KEY,
            task_type     TEXT    NOT NULL,   -- 'setup' | 'execute'
            agent_group   TEXT    NOT NULL,
            infra_id      TEXT,
            capabilities  TEXT    NOT NULL,   -- JSON array
            payload       TEXT    NOT NULL,   -- opaque JSON body
            wait_id       TEXT    NOT NULL,
            account_id    TEXT    NOT NULL,
            timeout_ms    INTEGER NOT NULL,
            status        TEXT    NOT NULL DEFAULT 'queued',
            created_at    INTEGER NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_outbound_group_status
            ON outbound_tasks (agent_group, status, created_at);
        CREATE INDEX IF NOT EXISTS idx_outbound_infra
            ON outbound_tasks (infra_id);

        CREATE TABLE IF NOT EXISTS infra_mappings (
            infra_id       TEXT    NOT NULL PRIMARY KEY,
            step_task_ids  TEXT    NOT NULL,  -- JSON object step id -> task id
            created_at     INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
