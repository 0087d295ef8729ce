use rusqlite::Connection;

use crate::error::Result;

/// Initialise the three response tables in `conn`.
///
/// All three share one shape. `process_after` is both the earliest delivery
/// time and the claim lock of the async/progress pollers, so it is indexed.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_task_responses (
            uuid            TEXT    NOT NULL PRIMARY KEY,
            correlation_id  TEXT    NOT NULL,
            response_data   BLOB    NOT NULL,
            process_after   INTEGER NOT NULL,   -- epoch ms
            valid_until     INTEGER NOT NULL,   -- epoch ms, hard expiry
            created_at      INTEGER NOT NULL
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_sync_responses_process_after
            ON sync_task_responses (process_after);

        CREATE TABLE IF NOT EXISTS async_task_responses (
            uuid            TEXT    NOT NULL PRIMARY KEY,
            correlation_id  TEXT    NOT NULL,
            response_data   BLOB    NOT NULL,
            process_after   INTEGER NOT NULL,
            valid_until     INTEGER NOT NULL,
            created_at      INTEGER NOT NULL
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_async_responses_process_after
            ON async_task_responses (process_after);

        CREATE TABLE IF NOT EXISTS task_progress_responses (
            uuid            TEXT    NOT NULL PRIMARY KEY,
            correlation_id  TEXT    NOT NULL,
            response_data   BLOB    NOT NULL,
            process_after   INTEGER NOT NULL,
            valid_until     INTEGER NOT NULL,
            created_at      INTEGER NOT NULL
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_progress_responses_process_after
            ON task_progress_responses (process_after);
        ",
    )?;
    Ok(())
}
