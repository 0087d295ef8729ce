use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use relay_core::config::RelayConfig;
use relay_correlator::{NotifyHub, ResponseStore, SyncCorrelator, WaitNotifyEngine};
use relay_dispatch::{
    AgentDirectory, FileTokenSource, OutboxRouter, SqliteInfraRegistry, StaticTokenSource,
    TaskDispatcher, TokenSource,
};
use relay_iterator::Entity;
use rusqlite::Connection;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: RelayConfig,
    pub dispatcher: TaskDispatcher,
    /// Blocking waits behind `task.wait`.
    pub waiter: Arc<SyncCorrelator>,
    pub responses: Arc<ResponseStore>,
    /// In-process receiver of async results and progress updates.
    pub hub: Arc<NotifyHub>,
    /// Queue agents pull their tasks from.
    pub outbox: Arc<OutboxRouter>,
    pub iterators: Vec<String>,
    /// Entities handed out by the iterators since start.
    pub claimed_entities: AtomicU64,
    pub started_at: Instant,
}

impl AppState {
    /// Build every store-backed subsystem on the database at
    /// `config.database.path`. Each subsystem gets its own connection.
    pub fn open(config: RelayConfig, iterators: Vec<String>) -> anyhow::Result<Self> {
        let db_path = config.database.path.as_str();
        let busy_ms = config.database.busy_timeout_ms;

        let responses = Arc::new(ResponseStore::new(
            open_db(db_path, busy_ms)?,
            config.correlator.response_ttl(),
        )?);
        let waiter = Arc::new(SyncCorrelator::new(
            Arc::clone(&responses),
            config.correlator.sync_poll_interval(),
        ));
        let outbox = Arc::new(OutboxRouter::new(
            open_db(db_path, busy_ms)?,
            AgentDirectory::new(config.dispatch.agents.clone()),
        )?);
        let infra = Arc::new(SqliteInfraRegistry::new(open_db(db_path, busy_ms)?)?);
        let tokens: Arc<dyn TokenSource> = match &config.dispatch.token_path {
            Some(path) => Arc::new(FileTokenSource::new(path)),
            None => Arc::new(StaticTokenSource(None)),
        };
        let dispatcher = TaskDispatcher::new(outbox.clone(), infra, tokens, &config.dispatch)
            .with_backstop(Arc::clone(&responses));

        Ok(Self {
            config,
            dispatcher,
            waiter,
            responses,
            hub: Arc::new(NotifyHub::new()),
            outbox,
            iterators,
            claimed_entities: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }
}

/// Publish every claimed entity on the hub under its entity type, where
/// `GET /progress/{entity_type}` pollers pick it up.
pub fn spawn_entity_delivery(state: Arc<AppState>, mut claimed: mpsc::Receiver<Entity>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entity) = claimed.recv().await {
            state.claimed_entities.fetch_add(1, Ordering::Relaxed);
            let data = match serde_json::to_vec(&entity) {
                Ok(data) => data,
                Err(e) => {
                    warn!(entity_type = %entity.entity_type, "delivery: bad entity: {e}");
                    continue;
                }
            };
            if let Err(e) = state.hub.progress_on(&entity.entity_type, &data) {
                warn!(entity_type = %entity.entity_type, "delivery failed: {e}");
            }
        }
    })
}

/// Open a connection in WAL mode with the configured writer wait.
pub fn open_db(path: &str, busy_timeout_ms: u64) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL; PRAGMA busy_timeout={busy_timeout_ms};"
    ))?;
    Ok(conn)
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/rpc", post(crate::rpc::rpc_handler))
        .route(
            "/responses/{task_id}",
            post(crate::http::responses::task_result_handler),
        )
        .route(
            "/progress/{correlation_id}",
            post(crate::http::responses::progress_handler)
                .get(crate::http::responses::progress_poll_handler),
        )
        .route(
            "/agents/{group}/tasks",
            get(crate::http::agents::take_tasks_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
