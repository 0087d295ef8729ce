use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::{ProcessMode, SchedulingPolicy};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000; // cross-process writer contention
pub const DEFAULT_SYNC_POLL_MS: u64 = 100;
pub const DEFAULT_ASYNC_POLL_MS: u64 = 1_000;
pub const DEFAULT_PROGRESS_POLL_MS: u64 = 1_000;
pub const DEFAULT_MAX_PROCESSING_MS: u64 = 60_000; // claim lock lifetime
pub const DEFAULT_CLAIM_BATCH: usize = 500;
pub const DEFAULT_DELETE_BATCH: usize = 100;
pub const DEFAULT_RESPONSE_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 10 * 60 * 1_000;
pub const DEFAULT_TIMEOUT_GRACE_MS: u64 = 30_000;

/// Top-level config (relay.toml + RELAY_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Iterators declared by configuration; business code may register more.
    #[serde(default)]
    pub iterators: Vec<IteratorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a writer waits on another process's lock before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Poll cadences and batching for the three response correlators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    #[serde(default = "default_sync_poll_ms")]
    pub sync_poll_interval_ms: u64,
    #[serde(default = "default_async_poll_ms")]
    pub async_poll_interval_ms: u64,
    #[serde(default = "default_progress_poll_ms")]
    pub progress_poll_interval_ms: u64,
    /// A claimed response not deleted within this window is reclaimable.
    #[serde(default = "default_max_processing_ms")]
    pub max_processing_duration_ms: u64,
    /// Upper bound on records claimed by one async/progress pass.
    #[serde(default = "default_claim_batch")]
    pub claim_batch_size: usize,
    /// Delivered ids are deleted once this many have accumulated.
    #[serde(default = "default_delete_batch")]
    pub delete_batch_size: usize,
    /// Hard expiry for undelivered responses.
    #[serde(default = "default_response_ttl_secs")]
    pub response_ttl_secs: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            sync_poll_interval_ms: DEFAULT_SYNC_POLL_MS,
            async_poll_interval_ms: DEFAULT_ASYNC_POLL_MS,
            progress_poll_interval_ms: DEFAULT_PROGRESS_POLL_MS,
            max_processing_duration_ms: DEFAULT_MAX_PROCESSING_MS,
            claim_batch_size: DEFAULT_CLAIM_BATCH,
            delete_batch_size: DEFAULT_DELETE_BATCH,
            response_ttl_secs: DEFAULT_RESPONSE_TTL_SECS,
        }
    }
}

impl CorrelatorConfig {
    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    pub fn async_poll_interval(&self) -> Duration {
        Duration::from_millis(self.async_poll_interval_ms)
    }

    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.progress_poll_interval_ms)
    }

    pub fn max_processing_duration(&self) -> Duration {
        Duration::from_millis(self.max_processing_duration_ms)
    }

    pub fn response_ttl(&self) -> Duration {
        Duration::from_secs(self.response_ttl_secs)
    }
}

/// Task dispatch settings and the agent groups the outbox router may target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_task_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Added to a task's execution timeout before the backstop fires.
    #[serde(default = "default_timeout_grace_ms")]
    pub timeout_grace_ms: u64,
    /// File holding the auxiliary token attached to setup tasks.
    pub token_path: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentGroupConfig>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            timeout_grace_ms: DEFAULT_TIMEOUT_GRACE_MS,
            token_path: None,
            agents: Vec::new(),
        }
    }
}

/// A group of remote agents sharing the same tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentGroupConfig {
    pub id: String,
    /// Runner types and selector tags this group satisfies.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One iterator declared in `[[iterators]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IteratorConfig {
    pub name: String,
    /// Table holding the entities.
    pub entity_type: String,
    /// Iteration column.
    pub field_name: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    pub target_interval_secs: u64,
    #[serde(default)]
    pub acceptable_delay_secs: u64,
    #[serde(default)]
    pub throttle_interval_secs: u64,
    #[serde(default)]
    pub policy: SchedulingPolicy,
    #[serde(default)]
    pub mode: ProcessMode,
    #[serde(default = "default_pump_interval_secs")]
    pub pump_interval_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub redistribute: bool,
    /// SQL predicate narrowing eligible rows, e.g. `status IN ('created','running')`.
    pub filter: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_sync_poll_ms() -> u64 {
    DEFAULT_SYNC_POLL_MS
}
fn default_async_poll_ms() -> u64 {
    DEFAULT_ASYNC_POLL_MS
}
fn default_progress_poll_ms() -> u64 {
    DEFAULT_PROGRESS_POLL_MS
}
fn default_max_processing_ms() -> u64 {
    DEFAULT_MAX_PROCESSING_MS
}
fn default_claim_batch() -> usize {
    DEFAULT_CLAIM_BATCH
}
fn default_delete_batch() -> usize {
    DEFAULT_DELETE_BATCH
}
fn default_response_ttl_secs() -> u64 {
    DEFAULT_RESPONSE_TTL_SECS
}
fn default_task_timeout_ms() -> u64 {
    DEFAULT_TASK_TIMEOUT_MS
}
fn default_timeout_grace_ms() -> u64 {
    DEFAULT_TIMEOUT_GRACE_MS
}
fn default_id_column() -> String {
    "id".to_string()
}
fn default_pump_interval_secs() -> u64 {
    5
}
fn default_concurrency() -> usize {
    1
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relay/relay.db", home)
}

impl RelayConfig {
    /// Load config from a TOML file with RELAY_* env var overrides.
    ///
    /// Nested keys use a double underscore so field names may keep their own
    /// underscores: `RELAY_CORRELATOR__DELETE_BATCH_SIZE=50`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading config");

        let config: RelayConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RELAY_").split("__"))
            .extract()
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relay/relay.toml", home)
}
