use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::db::init_db;
use crate::error::Result;
use crate::types::{ErrorNotifyResponse, ResponseKind, ResponseRecord};

const COLUMNS: &str = "uuid, correlation_id, response_data, process_after, valid_until, created_at";
/// Ids per `IN (...)` list.
const ID_CHUNK: usize = 500;

/// Durable mailbox for task responses, shared by every process of the fleet.
///
/// Records are written by the agent intake, read by the pollers and deleted
/// right after delivery. Every mutation is a single statement or one short
/// transaction, so two processes polling the same table never deliver one
/// record twice within a lock window. A terminal result lives in both the
/// sync and async tables; delivering either copy removes the other.
pub struct ResponseStore {
    db: Mutex<Connection>,
    ttl: Duration,
}

impl ResponseStore {
    /// Wrap `conn`, creating the response tables if needed.
    pub fn new(conn: Connection, ttl: Duration) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            ttl,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or overwrite a record by uuid. Last write wins.
    pub fn put(&self, kind: ResponseKind, record: &ResponseRecord) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                kind.table()
            ),
            rusqlite::params![
                record.uuid,
                record.correlation_id,
                record.response_data,
                record.process_after,
                record.valid_until,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    /// Store a result that is deliverable right away and expires after the TTL.
    pub fn save_response(
        &self,
        kind: ResponseKind,
        uuid: &str,
        correlation_id: &str,
        data: &[u8],
        now: i64,
    ) -> Result<()> {
        self.put(
            kind,
            &ResponseRecord {
                uuid: uuid.to_string(),
                correlation_id: correlation_id.to_string(),
                response_data: data.to_vec(),
                process_after: now,
                valid_until: now.saturating_add(millis(self.ttl)),
                created_at: now,
            },
        )
    }

    /// Write a task's terminal result into both the sync and async tables.
    ///
    /// Overwrites any pending timeout backstop for the same task.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub fn save_task_result(&self, task_id: &str, data: &[u8], now: i64) -> Result<()> {
        self.save_response(ResponseKind::Sync, task_id, task_id, data, now)?;
        self.save_response(ResponseKind::Async, task_id, task_id, data, now)?;
        debug!("task result stored");
        Ok(())
    }

    /// Pre-insert the synthetic "expired" answer for `task_id`, due at `expiry`.
    ///
    /// Written into both the sync and async tables so whichever side the
    /// caller waits on eventually sees a terminal record. A real result
    /// written later replaces it; one written earlier is replaced by it, and
    /// either is a valid terminal answer.
    #[instrument(skip(self))]
    pub fn setup_timeout_for_task(&self, task_id: &str, expiry: i64, now: i64) -> Result<()> {
        let data = serde_json::to_vec(&ErrorNotifyResponse::expired(task_id))?;
        for kind in [ResponseKind::Sync, ResponseKind::Async] {
            self.put(
                kind,
                &ResponseRecord {
                    uuid: task_id.to_string(),
                    correlation_id: task_id.to_string(),
                    response_data: data.clone(),
                    process_after: expiry,
                    valid_until: expiry.saturating_add(millis(self.ttl)),
                    created_at: now,
                },
            )?;
        }
        debug!("timeout backstop installed");
        Ok(())
    }

    /// Replace any pending answer for `task_id` with an immediate "aborted" failure.
    pub fn abort_task(&self, task_id: &str, reason: Option<&str>, now: i64) -> Result<()> {
        let data = serde_json::to_vec(&ErrorNotifyResponse::aborted(task_id, reason))?;
        self.save_task_result(task_id, &data, now)?;
        info!(%task_id, "task aborted");
        Ok(())
    }

    /// Read and delete a due record, dropping the other copy of the same
    /// task result with it.
    pub fn take_ready(&self, kind: ResponseKind, uuid: &str, now: i64) -> Result<Option<ResponseRecord>> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let record = tx
            .query_row(
                &format!(
                    "DELETE FROM {} WHERE uuid = ?1 AND process_after <= ?2 RETURNING {COLUMNS}",
                    kind.table()
                ),
                rusqlite::params![uuid, now],
                ResponseRecord::from_row,
            )
            .optional()?;
        if let (Some(_), Some(other)) = (&record, kind.counterpart()) {
            tx.execute(
                &format!("DELETE FROM {} WHERE uuid = ?1", other.table()),
                [uuid],
            )?;
        }
        tx.commit()?;
        Ok(record)
    }

    /// Non-destructive read, for inspection and tests.
    pub fn get(&self, kind: ResponseKind, uuid: &str) -> Result<Option<ResponseRecord>> {
        let record = self
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM {} WHERE uuid = ?1", kind.table()),
                [uuid],
                ResponseRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Subset of `uuids` whose record exists and is deliverable at `now`.
    pub fn ready_ids(&self, kind: ResponseKind, uuids: &[String], now: i64) -> Result<Vec<String>> {
        let db = self.conn();
        let mut ready = Vec::new();
        for chunk in uuids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let mut stmt = db.prepare(&format!(
                "SELECT uuid FROM {} WHERE process_after <= ? AND uuid IN ({placeholders})",
                kind.table()
            ))?;
            let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(chunk.len() + 1);
            params.push(now.into());
            params.extend(chunk.iter().map(|id| id.clone().into()));
            let rows = stmt.query_map(params_from_iter(params), |r| r.get::<_, String>(0))?;
            for id in rows {
                ready.push(id?);
            }
        }
        Ok(ready)
    }

    /// Claim the earliest deliverable record by pushing its `process_after`
    /// to `lock_until`. Another poller cannot see it again before then, and a
    /// crashed claimer's record becomes claimable once the lock passes.
    pub fn claim_next(&self, kind: ResponseKind, now: i64, lock_until: i64) -> Result<Option<ResponseRecord>> {
        let table = kind.table();
        let record = self
            .conn()
            .query_row(
                &format!(
                    "UPDATE {table} SET process_after = ?2 WHERE uuid = (
                         SELECT uuid FROM {table}
                         WHERE process_after <= ?1 AND valid_until > ?1
                         ORDER BY process_after ASC LIMIT 1
                     ) AND process_after <= ?1
                     RETURNING {COLUMNS}"
                ),
                rusqlite::params![now, lock_until],
                ResponseRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Delete delivered records, plus the other copy of each task result.
    /// Returns how many rows of `kind` went away.
    pub fn delete_many(&self, kind: ResponseKind, uuids: &[String]) -> Result<usize> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let mut deleted = 0;
        for chunk in uuids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            deleted += tx.execute(
                &format!("DELETE FROM {} WHERE uuid IN ({placeholders})", kind.table()),
                params_from_iter(chunk.iter()),
            )?;
            if let Some(other) = kind.counterpart() {
                tx.execute(
                    &format!("DELETE FROM {} WHERE uuid IN ({placeholders})", other.table()),
                    params_from_iter(chunk.iter()),
                )?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Drop every pending answer for `task_id` from the sync and async tables.
    pub fn remove_task(&self, task_id: &str) -> Result<usize> {
        let db = self.conn();
        let mut removed = 0;
        for kind in [ResponseKind::Sync, ResponseKind::Async] {
            removed += db.execute(
                &format!("DELETE FROM {} WHERE uuid = ?1", kind.table()),
                [task_id],
            )?;
        }
        Ok(removed)
    }

    /// Drop records whose `valid_until` has passed.
    pub fn purge_expired(&self, kind: ResponseKind, now: i64) -> Result<usize> {
        let n = self.conn().execute(
            &format!("DELETE FROM {} WHERE valid_until <= ?1", kind.table()),
            [now],
        )?;
        if n > 0 {
            info!(%kind, purged = n, "expired responses purged");
        }
        Ok(n)
    }

    pub fn count(&self, kind: ResponseKind) -> Result<usize> {
        let n: i64 = self
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", kind.table()), [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

pub(crate) fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
