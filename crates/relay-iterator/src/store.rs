use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use relay_core::SchedulingPolicy;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use tracing::{debug, info, instrument, warn};

use crate::db::quote_ident;
use crate::error::{IteratorError, Result};
use crate::policy::{first_due, millis, reschedule, spread_offset};
use crate::types::{
    BulkWriteResult, ClaimResult, Entity, EntityId, IterationTarget, IterationValue,
    RecoveryReport,
};

/// Lost compare-and-set races after which contention is logged.
const CONTENDED_ATTEMPTS: usize = 8;
/// Ids per `IN (...)` list; stays well under SQLite's bound-parameter limit.
const BULK_CHUNK: usize = 500;

/// Atomic claim/reschedule primitive over rows of a shared SQLite file.
///
/// Every process of the fleet opens its own store on the same database. A
/// claim reads the earliest-due row and rewrites its iteration field with a
/// compare-and-set `UPDATE ... WHERE id = ? AND field IS ?old`; whoever
/// commits first owns that pre-claim value, everyone else re-reads. No lock
/// table, no multi-row transaction.
pub struct WorkClaimStore {
    db: Mutex<Connection>,
}

/// A due row read by the claim query, before the compare-and-set.
struct Candidate {
    entity: Entity,
    raw: SqlValue,
    previous: IterationValue,
}

impl WorkClaimStore {
    /// Wrap an already-open connection (WAL + busy timeout set by the caller).
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the earliest-due entity of `target` and advance its iteration field.
    ///
    /// Returns `Ok(None)` when nothing is due. The returned snapshot is the
    /// row as it was before the claim; the store already holds the new value.
    #[instrument(skip(self, target), fields(entity_type = %target.entity_type, field = %target.field_name))]
    pub fn obtain_next_instance(
        &self,
        base: i64,
        throttle_threshold: i64,
        target: &IterationTarget,
        policy: SchedulingPolicy,
        target_interval: Duration,
    ) -> Result<Option<ClaimResult>> {
        let db = self.conn();
        let select_sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY {} ASC LIMIT 1",
            quote_ident(&target.entity_type),
            due_condition(target, policy),
            due_expr(&target.field_name, policy),
        );
        let update_sql = format!(
            "UPDATE {t} SET {f} = ?1 WHERE {id} = ?2 AND {f} IS ?3",
            t = quote_ident(&target.entity_type),
            f = quote_ident(&target.field_name),
            id = quote_ident(&target.id_column),
        );

        // Re-read until a claim wins or nothing is due: every lost race means
        // another claimer advanced that row, so the loop always makes progress.
        let mut attempt = 0;
        loop {
            let Some(candidate) = fetch_candidate(&db, &select_sql, target, policy, base)? else {
                return Ok(None);
            };
            let next = reschedule(
                policy,
                &candidate.previous,
                base,
                throttle_threshold,
                target_interval,
            );
            let changed = db.execute(
                &update_sql,
                rusqlite::params![next.to_sql(), candidate.entity.id, candidate.raw],
            )?;
            if changed == 1 {
                debug!(id = %candidate.entity.id, attempt, "entity claimed");
                return Ok(Some(ClaimResult {
                    entity: candidate.entity,
                    previous: candidate.previous,
                }));
            }
            debug!(id = %candidate.entity.id, attempt, "lost claim race, re-reading");
            attempt += 1;
            if attempt == CONTENDED_ATTEMPTS {
                warn!(attempts = attempt, "claim still contended, continuing");
            }
        }
    }

    /// Read-only peek at the entity the next claim would take. Not for the hot path.
    pub fn find_instance(
        &self,
        base: i64,
        target: &IterationTarget,
        policy: SchedulingPolicy,
    ) -> Result<Option<Entity>> {
        let db = self.conn();
        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY {} ASC LIMIT 1",
            quote_ident(&target.entity_type),
            due_condition(target, policy),
            due_expr(&target.field_name, policy),
        );
        Ok(fetch_candidate(&db, &sql, target, policy, base)?.map(|c| c.entity))
    }

    /// Number of entities currently due (backlog monitoring).
    pub fn count_due(
        &self,
        base: i64,
        target: &IterationTarget,
        policy: SchedulingPolicy,
    ) -> Result<usize> {
        let db = self.conn();
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote_ident(&target.entity_type),
            due_condition(target, policy),
        );
        let n: i64 = db.query_row(&sql, params_from_iter(bind_params(target, base)), |r| {
            r.get(0)
        })?;
        Ok(n as usize)
    }

    /// Apply the `Regular` reschedule (`base + target_interval`) to many
    /// already-claimed ids in one write transaction.
    ///
    /// Ids are partitioned by representation (integer / text) and written in
    /// unordered chunks. Writing the same ids with the same `base` twice
    /// leaves the same value; the second call reports `modified == 0`.
    #[instrument(skip(self, target, ids), fields(entity_type = %target.entity_type, ids = ids.len()))]
    pub fn bulk_write_documents_matching_ids(
        &self,
        target: &IterationTarget,
        ids: &[EntityId],
        base: i64,
        target_interval: Duration,
    ) -> Result<BulkWriteResult> {
        let mut seen = HashSet::new();
        let (ints, texts): (Vec<&EntityId>, Vec<&EntityId>) = ids
            .iter()
            .filter(|id| seen.insert(*id))
            .partition(|id| matches!(id, EntityId::Int(_)));

        if ints.is_empty() && texts.is_empty() {
            return Ok(BulkWriteResult {
                acknowledged: true,
                ..Default::default()
            });
        }

        let next = SqlValue::Integer(base + millis(target_interval));
        let table = quote_ident(&target.entity_type);
        let field = quote_ident(&target.field_name);
        let id_col = quote_ident(&target.id_column);

        let mut db = self.conn();
        let tx = db.transaction()?;
        let mut result = BulkWriteResult::default();

        for group in [ints, texts] {
            for chunk in group.chunks(BULK_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(",");
                let id_params: Vec<&dyn ToSql> = chunk.iter().map(|id| *id as &dyn ToSql).collect();

                let matched: i64 = tx.query_row(
                    &format!("SELECT COUNT(*) FROM {table} WHERE {id_col} IN ({placeholders})"),
                    id_params.as_slice(),
                    |r| r.get(0),
                )?;

                let mut params: Vec<&dyn ToSql> = vec![&next as &dyn ToSql, &next as &dyn ToSql];
                params.extend(id_params.iter().copied());
                let modified = tx.execute(
                    &format!(
                        "UPDATE {table} SET {field} = ? WHERE {field} IS NOT ? AND {id_col} IN ({placeholders})"
                    ),
                    params.as_slice(),
                )?;

                result.matched += matched as usize;
                result.modified += modified;
            }
        }

        tx.commit()?;
        result.acknowledged = true;
        debug!(matched = result.matched, modified = result.modified, "bulk reschedule applied");
        Ok(result)
    }

    /// Clear malformed iteration fields left behind while the iterator was stopped.
    ///
    /// Regular fields holding anything but an integer, and queue fields that
    /// are not a non-empty JSON array of integers, are reset to NULL so the next claim
    /// picks them up. With `redistribute`, NULL fields then get a first due
    /// time spread over `[base, base + interval)` by id hash.
    #[instrument(skip(self, target), fields(entity_type = %target.entity_type, field = %target.field_name))]
    pub fn recover_after_pause(
        &self,
        target: &IterationTarget,
        policy: SchedulingPolicy,
        base: i64,
        redistribute: Option<Duration>,
    ) -> Result<RecoveryReport> {
        let db = self.conn();
        let table = quote_ident(&target.entity_type);
        let field = quote_ident(&target.field_name);
        let id_col = quote_ident(&target.id_column);

        let malformed = if policy.is_queue() {
            format!(
                "{field} IS NOT NULL AND (CASE WHEN json_valid({field}) \
                 THEN json_type({field}) = 'array' AND json_array_length({field}) > 0 \
                 AND NOT EXISTS (SELECT 1 FROM json_each({field}) AS j WHERE j.type != 'integer') \
                 ELSE 0 END) = 0"
            )
        } else {
            format!("{field} IS NOT NULL AND typeof({field}) != 'integer'")
        };
        let filter_params = target
            .filter
            .as_ref()
            .map(|f| f.params.clone())
            .unwrap_or_default();

        let cleared = db.execute(
            &format!(
                "UPDATE {table} SET {field} = NULL WHERE {}",
                with_filter(target, &malformed)
            ),
            params_from_iter(filter_params.iter()),
        )?;

        let mut report = RecoveryReport {
            cleared,
            redistributed: 0,
        };

        if let Some(interval) = redistribute {
            let ids: Vec<EntityId> = {
                let mut stmt = db.prepare(&format!(
                    "SELECT {id_col} FROM {table} WHERE {}",
                    with_filter(target, &format!("{field} IS NULL"))
                ))?;
                let mut rows = stmt.query(params_from_iter(filter_params.iter()))?;
                let mut ids = Vec::new();
                while let Some(row) = rows.next()? {
                    ids.push(EntityId::from_sql(&target.id_column, row.get_ref(0)?)?);
                }
                ids
            };

            let update_sql =
                format!("UPDATE {table} SET {field} = ?1 WHERE {id_col} = ?2 AND {field} IS NULL");
            for id in ids {
                let at = base + spread_offset(&id.to_string(), interval);
                report.redistributed +=
                    db.execute(&update_sql, rusqlite::params![first_due(policy, at).to_sql(), id])?;
            }
        }

        if report.cleared > 0 || report.redistributed > 0 {
            info!(
                cleared = report.cleared,
                redistributed = report.redistributed,
                "iteration fields recovered"
            );
        }
        Ok(report)
    }

    /// Replace the explicit tick queue of one entity (sorted, deduplicated).
    ///
    /// Returns `false` when no row has that id.
    pub fn schedule_ticks(&self, target: &IterationTarget, id: &EntityId, ticks: &[i64]) -> Result<bool> {
        let mut ticks = ticks.to_vec();
        ticks.sort_unstable();
        ticks.dedup();
        let db = self.conn();
        let changed = db.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                quote_ident(&target.entity_type),
                quote_ident(&target.field_name),
                quote_ident(&target.id_column),
            ),
            rusqlite::params![IterationValue::Queue(ticks).to_sql(), id],
        )?;
        Ok(changed == 1)
    }
}

/// SQL expression giving the instant a row becomes due, or NULL.
///
/// `CASE` guards keep malformed values out of `json_each`, which would
/// otherwise abort the whole query. Queues are due at their smallest tick,
/// whatever order they were written in.
fn due_expr(field: &str, policy: SchedulingPolicy) -> String {
    let f = quote_ident(field);
    if policy.is_queue() {
        format!(
            "(CASE WHEN json_valid({f}) THEN (CASE WHEN json_type({f}) = 'array' \
             THEN (SELECT MIN(j.value) FROM json_each({f}) AS j) END) END)"
        )
    } else {
        format!("(CASE WHEN typeof({f}) = 'integer' THEN {f} END)")
    }
}

/// `filter AND (field IS NULL OR due < ?base)`.
fn due_condition(target: &IterationTarget, policy: SchedulingPolicy) -> String {
    let cond = format!(
        "({} IS NULL OR {} < ?)",
        quote_ident(&target.field_name),
        due_expr(&target.field_name, policy)
    );
    with_filter(target, &cond)
}

fn with_filter(target: &IterationTarget, cond: &str) -> String {
    match &target.filter {
        Some(filter) => format!("({}) AND {cond}", filter.clause),
        None => cond.to_string(),
    }
}

/// Filter params first, then `base` for the trailing `?` of [`due_condition`].
fn bind_params(target: &IterationTarget, base: i64) -> Vec<SqlValue> {
    let mut params = target
        .filter
        .as_ref()
        .map(|f| f.params.clone())
        .unwrap_or_default();
    params.push(SqlValue::Integer(base));
    params
}

fn fetch_candidate(
    conn: &Connection,
    sql: &str,
    target: &IterationTarget,
    policy: SchedulingPolicy,
    base: i64,
) -> Result<Option<Candidate>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(bind_params(target, base)))?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let mut fields = serde_json::Map::with_capacity(names.len());
    let mut id = None;
    let mut raw = SqlValue::Null;
    for (i, name) in names.iter().enumerate() {
        let value = row.get_ref(i)?;
        if *name == target.id_column {
            id = Some(EntityId::from_sql(name, value)?);
        }
        if *name == target.field_name {
            raw = SqlValue::from(value);
        }
        fields.insert(name.clone(), json_of(value));
    }

    let id = id.ok_or_else(|| IteratorError::InvalidId {
        column: target.id_column.clone(),
        reason: "column not present".to_string(),
    })?;
    let previous = IterationValue::from_sql(policy, &raw);

    Ok(Some(Candidate {
        entity: Entity {
            entity_type: target.entity_type.clone(),
            id,
            fields,
        },
        raw,
        previous,
    }))
}

fn json_of(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => i.into(),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::Array(b.iter().map(|x| (*x).into()).collect()),
    }
}
