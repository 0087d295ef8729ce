use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use relay_core::config::DispatchConfig;
use relay_core::{now_millis, InfraId, TaskId};
use relay_correlator::ResponseStore;
use relay_protocol::messages::{ExecuteRequest, SetupConfig};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::{DispatchError, Result};
use crate::infra::InfraRegistry;
use crate::routing::TaskRouter;
use crate::token::TokenSource;
use crate::types::{Capability, SetupOutcome, TaskRecord, TaskType};

/// Builds task records and hands them to the routing layer.
///
/// Never chooses an agent itself: it only attaches capability requirements.
/// Task ids are fresh per call; the infra id created by a setup is reused by
/// every execute that targets it.
pub struct TaskDispatcher {
    router: Arc<dyn TaskRouter>,
    infra: Arc<dyn InfraRegistry>,
    tokens: Arc<dyn TokenSource>,
    backstop: Option<Arc<ResponseStore>>,
    default_timeout: Duration,
    grace: Duration,
}

impl TaskDispatcher {
    pub fn new(
        router: Arc<dyn TaskRouter>,
        infra: Arc<dyn InfraRegistry>,
        tokens: Arc<dyn TokenSource>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            router,
            infra,
            tokens,
            backstop: None,
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            grace: Duration::from_millis(config.timeout_grace_ms),
        }
    }

    /// Install a timeout answer for every sent task in `store`.
    pub fn with_backstop(mut self, store: Arc<ResponseStore>) -> Self {
        self.backstop = Some(store);
        self
    }

    /// Provision an execution environment.
    ///
    /// Generates the infra id and one task id per declared step, records the
    /// mapping, and sends a `Setup` task requiring the runner type plus any
    /// explicit selectors.
    #[instrument(skip(self, config))]
    pub async fn init_task(&self, config: Option<SetupConfig>) -> Result<SetupOutcome> {
        let config =
            config.ok_or_else(|| DispatchError::InvalidArgument("setup config is required".into()))?;
        if config.runner_type.trim().is_empty() {
            return Err(DispatchError::InvalidArgument("runner_type is required".into()));
        }

        let mut seen = HashSet::new();
        for step in &config.steps {
            if step.id.trim().is_empty() {
                return Err(DispatchError::InvalidArgument("step id must not be empty".into()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(DispatchError::InvalidArgument(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }

        let task_id = TaskId::new();
        let infra_id = InfraId::new();
        let step_task_ids: BTreeMap<String, TaskId> = config
            .steps
            .iter()
            .map(|s| (s.id.clone(), TaskId::new()))
            .collect();
        let mapping: BTreeMap<String, String> = step_task_ids
            .iter()
            .map(|(step, id)| (step.clone(), id.to_string()))
            .collect();
        self.infra.register(infra_id.as_str(), &mapping)?;

        let token = self.tokens.fetch().await.map_err(DispatchError::Token);
        let token = match token {
            Ok(token) => token,
            Err(e) => {
                self.forget_infra(&infra_id);
                return Err(e);
            }
        };

        let mut capabilities = vec![Capability::RunnerType(config.runner_type.clone())];
        capabilities.extend(config.selectors.iter().cloned().map(Capability::Selector));

        let timeout_ms = config.timeout_ms.unwrap_or(self.default_timeout.as_millis() as u64);
        let record = TaskRecord {
            id: task_id.clone(),
            task_type: TaskType::Setup,
            payload: json!({
                "infra_id": infra_id.as_str(),
                "runner_type": config.runner_type,
                "step_task_ids": mapping,
                "token": token,
                "config": config.payload,
            }),
            capabilities,
            infra_id: Some(infra_id.clone()),
            timeout_ms,
            wait_id: task_id.to_string(),
            account_id: config.account_id.clone(),
            created_at: now_millis(),
        };

        if let Err(e) = self.send(&record).await {
            self.forget_infra(&infra_id);
            return Err(e);
        }
        info!(%task_id, %infra_id, steps = step_task_ids.len(), "setup task sent");

        Ok(SetupOutcome {
            task_id,
            infra_id,
            step_task_ids,
        })
    }

    /// Run one step on the environment created by an earlier setup.
    #[instrument(skip(self, request))]
    pub async fn execute_task(&self, request: Option<ExecuteRequest>) -> Result<TaskId> {
        let request = request
            .ok_or_else(|| DispatchError::InvalidArgument("execute request is required".into()))?;
        let infra_ref = request
            .infra_ref_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DispatchError::InvalidArgument("infra_ref_id is required".into()))?;

        let steps = self
            .infra
            .lookup(infra_ref)?
            .ok_or_else(|| DispatchError::UnknownInfra {
                infra_id: infra_ref.to_string(),
            })?;
        if let Some(step) = &request.step_id {
            if !steps.contains_key(step) {
                warn!(infra_id = %infra_ref, %step, "step not declared by setup");
            }
        }

        let task_id = TaskId::new();
        let mut capabilities = vec![Capability::InfraAffinity(infra_ref.to_string())];
        capabilities.extend(request.selectors.iter().cloned().map(Capability::Selector));

        let record = TaskRecord {
            id: task_id.clone(),
            task_type: TaskType::Execute,
            payload: json!({
                "infra_id": infra_ref,
                "step_id": request.step_id,
                "config": request.payload,
            }),
            capabilities,
            infra_id: Some(InfraId(infra_ref.to_string())),
            timeout_ms: request
                .timeout_ms
                .unwrap_or(self.default_timeout.as_millis() as u64),
            wait_id: task_id.to_string(),
            account_id: request.account_id.clone(),
            created_at: now_millis(),
        };
        self.send(&record).await?;
        info!(%task_id, infra_id = %infra_ref, "execute task sent");
        Ok(task_id)
    }

    /// Complete `task_id` with an "aborted" failure so its waiter returns.
    ///
    /// The remote agent is not contacted; a late real result overwrites the
    /// abort answer if nobody consumed it yet.
    pub fn abort_task(&self, task_id: &str, reason: Option<&str>) -> Result<()> {
        if task_id.trim().is_empty() {
            return Err(DispatchError::InvalidArgument("task_id is required".into()));
        }
        let store = self
            .backstop
            .as_ref()
            .ok_or(DispatchError::Unimplemented("abort without a response store"))?;
        store.abort_task(task_id, reason, now_millis())?;
        Ok(())
    }

    /// Task status lookup is not offered; callers wait on the result instead.
    pub fn get_task_status(&self, _task_id: &str) -> Result<()> {
        Err(DispatchError::Unimplemented("task status"))
    }

    /// Install the timeout answer, then hand the record to the router.
    ///
    /// The answer goes in first so a result the agent reports while the send
    /// is still in flight replaces it instead of being overwritten.
    async fn send(&self, record: &TaskRecord) -> Result<()> {
        if let Some(store) = &self.backstop {
            let now = now_millis();
            let timeout = i64::try_from(record.timeout_ms).unwrap_or(i64::MAX);
            let grace = i64::try_from(self.grace.as_millis()).unwrap_or(i64::MAX);
            let expiry = now.saturating_add(timeout).saturating_add(grace);
            store.setup_timeout_for_task(record.id.as_str(), expiry, now)?;
        }

        if let Err(e) = self.router.send(record).await {
            if let Some(store) = &self.backstop {
                if let Err(cleanup) = store.remove_task(record.id.as_str()) {
                    warn!(task_id = %record.id, "failed to drop timeout answer: {cleanup}");
                }
            }
            return Err(match e {
                e @ (DispatchError::NoEligibleAgent { .. }
                | DispatchError::UnknownInfra { .. }
                | DispatchError::InvalidArgument(_)) => e,
                other => DispatchError::Internal(other.to_string()),
            });
        }
        Ok(())
    }

    fn forget_infra(&self, infra_id: &InfraId) {
        if let Err(e) = self.infra.remove(infra_id.as_str()) {
            warn!(%infra_id, "failed to drop infra mapping: {e}");
        }
    }
}
