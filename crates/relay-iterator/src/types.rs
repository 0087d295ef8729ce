use std::fmt;
use std::time::Duration;

use relay_core::SchedulingPolicy;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::db::validate_identifier;
use crate::error::{IteratorError, Result};

/// Primary key of an iterable row, in either identifier representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Text(String),
}

impl EntityId {
    pub(crate) fn from_sql(column: &str, value: ValueRef<'_>) -> Result<Self> {
        match value {
            ValueRef::Integer(i) => Ok(EntityId::Int(i)),
            ValueRef::Text(t) => Ok(EntityId::Text(String::from_utf8_lossy(t).into_owned())),
            other => Err(IteratorError::InvalidId {
                column: column.to_string(),
                reason: format!("{:?}", other.data_type()),
            }),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(i) => write!(f, "{i}"),
            EntityId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for EntityId {
    fn from(i: i64) -> Self {
        EntityId::Int(i)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId::Text(s.to_string())
    }
}

impl rusqlite::ToSql for EntityId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            EntityId::Int(i) => Ok(ToSqlOutput::from(*i)),
            EntityId::Text(s) => Ok(ToSqlOutput::from(s.as_str())),
        }
    }
}

/// Decoded content of an iteration field (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum IterationValue {
    /// NULL: never scheduled, or cleared by recovery.
    Absent,
    /// A `Regular` field.
    At(i64),
    /// An `Irregular*` field, sorted ascending.
    Queue(Vec<i64>),
}

impl IterationValue {
    /// Decode the stored column for `policy`. Malformed content decodes as `Absent`.
    pub fn from_sql(policy: SchedulingPolicy, value: &SqlValue) -> Self {
        match (policy.is_queue(), value) {
            (false, SqlValue::Integer(t)) => IterationValue::At(*t),
            (true, SqlValue::Text(json)) => match serde_json::from_str::<Vec<i64>>(json) {
                Ok(mut ticks) => {
                    ticks.sort_unstable();
                    IterationValue::Queue(ticks)
                }
                Err(_) => IterationValue::Absent,
            },
            _ => IterationValue::Absent,
        }
    }

    /// Encode for storage. Queues are written as JSON arrays.
    pub fn to_sql(&self) -> SqlValue {
        match self {
            IterationValue::Absent => SqlValue::Null,
            IterationValue::At(t) => SqlValue::Integer(*t),
            IterationValue::Queue(ticks) => {
                SqlValue::Text(serde_json::to_string(ticks).unwrap_or_else(|_| "[]".to_string()))
            }
        }
    }

    /// The instant this value made the entity due, if any.
    pub fn due_at(&self) -> Option<i64> {
        match self {
            IterationValue::Absent => None,
            IterationValue::At(t) => Some(*t),
            IterationValue::Queue(ticks) => ticks.first().copied(),
        }
    }
}

/// A claimed row, exposed to handlers as a JSON object keyed by column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub id: EntityId,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.fields.get(column)
    }

    /// Deserialize the row into a business type.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.fields.clone()))
    }
}

/// Outcome of a successful claim.
///
/// `entity` and `previous` describe the row as it was at the claim moment;
/// the store already holds the rescheduled value.
#[derive(Debug, Clone)]
pub struct ClaimResult {
    pub entity: Entity,
    pub previous: IterationValue,
}

/// Counts reported by a bulk reschedule so callers can detect partial application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BulkWriteResult {
    pub acknowledged: bool,
    /// Rows whose id was in the request.
    pub matched: usize,
    /// Rows whose field actually changed.
    pub modified: usize,
}

/// Rows touched by `recover_after_pause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RecoveryReport {
    /// Malformed fields reset to NULL.
    pub cleared: usize,
    /// NULL fields given a spread-out first due time.
    pub redistributed: usize,
}

/// SQL predicate narrowing which rows an iterator may claim.
///
/// The clause is composed into the claim query with positional `?`
/// placeholders bound from `params`, so eligibility is decided by the same
/// statement that claims.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub clause: String,
    pub params: Vec<SqlValue>,
}

impl EntityFilter {
    pub fn new(clause: impl Into<String>) -> Self {
        Self {
            clause: clause.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// Where an iterator's entities live.
#[derive(Debug, Clone)]
pub struct IterationTarget {
    pub entity_type: String,
    pub field_name: String,
    pub id_column: String,
    pub filter: Option<EntityFilter>,
}

impl IterationTarget {
    /// Validates every name that will be spliced into SQL.
    pub fn new(
        entity_type: impl Into<String>,
        field_name: impl Into<String>,
        id_column: impl Into<String>,
    ) -> Result<Self> {
        let target = Self {
            entity_type: entity_type.into(),
            field_name: field_name.into(),
            id_column: id_column.into(),
            filter: None,
        };
        validate_identifier(&target.entity_type)?;
        validate_identifier(&target.field_name)?;
        validate_identifier(&target.id_column)?;
        Ok(target)
    }

    pub fn with_filter(mut self, filter: EntityFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Complete configuration of one recurring iterator job.
#[derive(Debug, Clone)]
pub struct IteratorSpec {
    pub name: String,
    pub target: IterationTarget,
    pub policy: SchedulingPolicy,
    pub mode: relay_core::ProcessMode,
    pub target_interval: Duration,
    /// Claims later than this behind their due time are logged as delayed.
    pub acceptable_delay: Duration,
    /// Skip-missed claims drop every tick up to `now + throttle_interval`.
    pub throttle_interval: Duration,
    /// Wake-up cadence of the pump / timer.
    pub pump_interval: Duration,
    /// Maximum simultaneous handler invocations.
    pub concurrency: usize,
    pub redistribute: bool,
}

impl IteratorSpec {
    pub fn new(name: impl Into<String>, target: IterationTarget, policy: SchedulingPolicy) -> Self {
        Self {
            name: name.into(),
            target,
            policy,
            mode: relay_core::ProcessMode::Pump,
            target_interval: Duration::from_secs(60),
            acceptable_delay: Duration::from_secs(60),
            throttle_interval: Duration::ZERO,
            pump_interval: Duration::from_secs(5),
            concurrency: 1,
            redistribute: false,
        }
    }

    /// Build from a `[[iterators]]` config entry.
    pub fn from_config(cfg: &relay_core::config::IteratorConfig) -> Result<Self> {
        let mut target = IterationTarget::new(&cfg.entity_type, &cfg.field_name, &cfg.id_column)?;
        if let Some(clause) = &cfg.filter {
            target = target.with_filter(EntityFilter::new(clause.clone()));
        }
        let spec = Self {
            name: cfg.name.clone(),
            target,
            policy: cfg.policy,
            mode: cfg.mode,
            target_interval: Duration::from_secs(cfg.target_interval_secs),
            acceptable_delay: Duration::from_secs(cfg.acceptable_delay_secs),
            throttle_interval: Duration::from_secs(cfg.throttle_interval_secs),
            pump_interval: Duration::from_secs(cfg.pump_interval_secs),
            concurrency: cfg.concurrency,
            redistribute: cfg.redistribute,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(IteratorError::InvalidConfig(format!(
                "{}: concurrency must be at least 1",
                self.name
            )));
        }
        if self.pump_interval.is_zero() {
            return Err(IteratorError::InvalidConfig(format!(
                "{}: pump interval must be positive",
                self.name
            )));
        }
        if self.policy == SchedulingPolicy::Regular && self.target_interval.is_zero() {
            return Err(IteratorError::InvalidConfig(format!(
                "{}: regular iterators need a target interval",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_decodes_sorted() {
        let v = IterationValue::from_sql(
            SchedulingPolicy::Irregular,
            &SqlValue::Text("[30,10,20]".into()),
        );
        assert_eq!(v, IterationValue::Queue(vec![10, 20, 30]));
        assert_eq!(v.due_at(), Some(10));
    }

    #[test]
    fn malformed_fields_decode_as_absent() {
        let regular = IterationValue::from_sql(SchedulingPolicy::Regular, &SqlValue::Text("x".into()));
        assert_eq!(regular, IterationValue::Absent);
        let queue = IterationValue::from_sql(SchedulingPolicy::Irregular, &SqlValue::Text("{".into()));
        assert_eq!(queue, IterationValue::Absent);
    }

    #[test]
    fn entity_decodes_into_business_type() {
        #[derive(Deserialize)]
        struct Activity {
            id: i64,
            status: String,
        }
        let mut fields = serde_json::Map::new();
        fields.insert("id".into(), 7.into());
        fields.insert("status".into(), "running".into());
        let entity = Entity {
            entity_type: "activities".into(),
            id: EntityId::Int(7),
            fields,
        };
        let a: Activity = entity.decode().unwrap();
        assert_eq!(a.id, 7);
        assert_eq!(a.status, "running");
    }

    #[test]
    fn target_rejects_bad_names() {
        assert!(IterationTarget::new("jobs", "next run", "id").is_err());
        assert!(IterationTarget::new("jobs", "next_run", "id").is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let target = IterationTarget::new("jobs", "next_run", "id").unwrap();
        let mut spec = IteratorSpec::new("jobs", target, SchedulingPolicy::Regular);
        spec.concurrency = 0;
        assert!(spec.validate().is_err());
    }
}
