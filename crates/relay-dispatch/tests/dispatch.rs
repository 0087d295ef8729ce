use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::config::{AgentGroupConfig, DispatchConfig};
use relay_correlator::{ResponseKind, ResponseStore};
use relay_dispatch::{
    AgentDirectory, Capability, DispatchError, FileTokenSource, OutboxRouter, SqliteInfraRegistry,
    StaticTokenSource, TaskDispatcher, TaskRecord, TaskRouter, TaskType,
};
use relay_protocol::messages::{ExecuteRequest, SetupConfig, StepConfig};
use rusqlite::Connection;

fn open(path: &Path) -> Connection {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        .unwrap();
    conn
}

fn setup_config(steps: &[&str]) -> SetupConfig {
    SetupConfig {
        runner_type: "k8s".into(),
        steps: steps
            .iter()
            .map(|id| StepConfig {
                id: id.to_string(),
                name: None,
            })
            .collect(),
        selectors: vec![],
        account_id: "acct-1".into(),
        timeout_ms: Some(1_000),
        payload: serde_json::json!({"image": "builder:1"}),
    }
}

/// Router that records every task and accepts or refuses all of them.
#[derive(Default)]
struct CapturingRouter {
    sent: Mutex<Vec<TaskRecord>>,
    refuse: bool,
}

#[async_trait]
impl TaskRouter for CapturingRouter {
    async fn send(&self, task: &TaskRecord) -> relay_dispatch::Result<()> {
        if self.refuse {
            return Err(DispatchError::NoEligibleAgent {
                capabilities: "any".into(),
            });
        }
        self.sent.lock().unwrap().push(task.clone());
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    dispatcher: TaskDispatcher,
    router: Arc<CapturingRouter>,
    responses: Arc<ResponseStore>,
}

fn harness(refuse: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let router = Arc::new(CapturingRouter {
        refuse,
        ..Default::default()
    });
    let infra = Arc::new(SqliteInfraRegistry::new(open(&path)).unwrap());
    let responses = Arc::new(ResponseStore::new(open(&path), Duration::from_secs(3_600)).unwrap());
    let dispatcher = TaskDispatcher::new(
        router.clone(),
        infra,
        Arc::new(StaticTokenSource(Some("tok".into()))),
        &DispatchConfig::default(),
    )
    .with_backstop(Arc::clone(&responses));
    Harness {
        _dir: dir,
        dispatcher,
        router,
        responses,
    }
}

#[tokio::test]
async fn init_task_generates_ids_and_sends_setup() {
    let h = harness(false);
    let mut config = setup_config(&["build", "test"]);
    config.selectors = vec!["gpu".into()];

    let outcome = h.dispatcher.init_task(Some(config)).await.unwrap();
    assert_eq!(outcome.step_task_ids.len(), 2);
    assert_ne!(outcome.step_task_ids["build"], outcome.step_task_ids["test"]);

    let sent = h.router.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let task = &sent[0];
    assert_eq!(task.task_type, TaskType::Setup);
    assert_eq!(task.id, outcome.task_id);
    assert_eq!(
        task.capabilities,
        vec![
            Capability::RunnerType("k8s".into()),
            Capability::Selector("gpu".into())
        ]
    );
    assert_eq!(task.payload["token"], "tok");
    assert_eq!(task.payload["infra_id"], outcome.infra_id.as_str());

    // backstop installed for the setup task
    let backstop = h
        .responses
        .get(ResponseKind::Sync, outcome.task_id.as_str())
        .unwrap()
        .unwrap();
    assert!(backstop.process_after > task.created_at);
}

#[tokio::test]
async fn init_task_without_config_is_invalid() {
    let h = harness(false);
    let err = h.dispatcher.init_task(None).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");

    let err = h
        .dispatcher
        .init_task(Some(setup_config(&["a", "a"])))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");
    assert!(h.router.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn no_eligible_agent_is_failed_precondition() {
    let h = harness(true);
    let err = h
        .dispatcher
        .init_task(Some(setup_config(&[])))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FAILED_PRECONDITION");
    assert_eq!(h.responses.count(ResponseKind::Sync).unwrap(), 0);
    assert_eq!(h.responses.count(ResponseKind::Async).unwrap(), 0);
}

/// Router whose agent reports the result before `send` returns.
struct InstantAgent {
    responses: Arc<ResponseStore>,
}

#[async_trait]
impl TaskRouter for InstantAgent {
    async fn send(&self, task: &TaskRecord) -> relay_dispatch::Result<()> {
        self.responses
            .save_task_result(task.id.as_str(), b"REAL", relay_core::now_millis())
            .map_err(|e| DispatchError::Internal(e.to_string()))
    }
}

#[tokio::test]
async fn result_reported_during_send_survives_the_timeout_answer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let responses = Arc::new(ResponseStore::new(open(&path), Duration::from_secs(3_600)).unwrap());
    let dispatcher = TaskDispatcher::new(
        Arc::new(InstantAgent {
            responses: Arc::clone(&responses),
        }),
        Arc::new(SqliteInfraRegistry::new(open(&path)).unwrap()),
        Arc::new(StaticTokenSource(None)),
        &DispatchConfig::default(),
    )
    .with_backstop(Arc::clone(&responses));

    let outcome = dispatcher
        .init_task(Some(setup_config(&["build"])))
        .await
        .unwrap();
    let record = responses
        .take_ready(ResponseKind::Sync, outcome.task_id.as_str(), relay_core::now_millis())
        .unwrap()
        .unwrap();
    assert_eq!(record.response_data, b"REAL");
}

#[tokio::test]
async fn unbounded_timeout_saturates_instead_of_wrapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let directory = AgentDirectory::new(vec![AgentGroupConfig {
        id: "west".into(),
        tags: vec!["k8s".into()],
    }]);
    let router = Arc::new(OutboxRouter::new(open(&path), directory).unwrap());
    let responses = Arc::new(ResponseStore::new(open(&path), Duration::from_secs(3_600)).unwrap());
    let dispatcher = TaskDispatcher::new(
        router.clone(),
        Arc::new(SqliteInfraRegistry::new(open(&path)).unwrap()),
        Arc::new(StaticTokenSource(None)),
        &DispatchConfig::default(),
    )
    .with_backstop(Arc::clone(&responses));

    let mut config = setup_config(&["build"]);
    config.timeout_ms = Some(u64::MAX);
    let outcome = dispatcher.init_task(Some(config)).await.unwrap();

    let queued = router.take_queued("west", 10).unwrap();
    assert_eq!(queued[0].timeout_ms, i64::MAX);
    let backstop = responses
        .get(ResponseKind::Sync, outcome.task_id.as_str())
        .unwrap()
        .unwrap();
    assert_eq!(backstop.process_after, i64::MAX);
    assert!(responses
        .take_ready(ResponseKind::Sync, outcome.task_id.as_str(), relay_core::now_millis())
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unreadable_token_is_internal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let dispatcher = TaskDispatcher::new(
        Arc::new(CapturingRouter::default()),
        Arc::new(SqliteInfraRegistry::new(open(&path)).unwrap()),
        Arc::new(FileTokenSource::new(dir.path().join("missing-token"))),
        &DispatchConfig::default(),
    );
    let err = dispatcher
        .init_task(Some(setup_config(&["s"])))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Token(_)));
    assert_eq!(err.code(), "INTERNAL");
}

#[tokio::test]
async fn execute_reuses_infra_and_gets_fresh_task_ids() {
    let h = harness(false);
    let setup = h
        .dispatcher
        .init_task(Some(setup_config(&["build"])))
        .await
        .unwrap();

    let request = || ExecuteRequest {
        infra_ref_id: Some(setup.infra_id.to_string()),
        step_id: Some("build".into()),
        ..Default::default()
    };
    let first = h.dispatcher.execute_task(Some(request())).await.unwrap();
    let second = h.dispatcher.execute_task(Some(request())).await.unwrap();
    assert_ne!(first, second);

    let sent = h.router.sent.lock().unwrap();
    let exec = &sent[1];
    assert_eq!(exec.task_type, TaskType::Execute);
    assert_eq!(
        exec.capabilities,
        vec![Capability::InfraAffinity(setup.infra_id.to_string())]
    );
    assert_eq!(exec.infra_id.as_ref(), Some(&setup.infra_id));
}

#[tokio::test]
async fn execute_requires_known_infra() {
    let h = harness(false);
    let err = h
        .dispatcher
        .execute_task(Some(ExecuteRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");

    let err = h
        .dispatcher
        .execute_task(Some(ExecuteRequest {
            infra_ref_id: Some("never-created".into()),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FAILED_PRECONDITION");
}

#[tokio::test]
async fn status_is_unimplemented_and_abort_completes_the_task() {
    let h = harness(false);
    assert_eq!(
        h.dispatcher.get_task_status("t").unwrap_err().code(),
        "UNIMPLEMENTED"
    );

    h.dispatcher.abort_task("t-9", Some("cancelled")).unwrap();
    let record = h
        .responses
        .take_ready(ResponseKind::Sync, "t-9", relay_core::now_millis())
        .unwrap()
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&record.response_data).unwrap();
    assert!(body["error_message"].as_str().unwrap().contains("cancelled"));
}

#[tokio::test]
async fn outbox_router_pins_execute_to_setup_group() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let directory = AgentDirectory::new(vec![
        AgentGroupConfig {
            id: "east".into(),
            tags: vec!["vm".into()],
        },
        AgentGroupConfig {
            id: "west".into(),
            tags: vec!["k8s".into()],
        },
    ]);
    let router = Arc::new(OutboxRouter::new(open(&path), directory).unwrap());
    let dispatcher = TaskDispatcher::new(
        router.clone(),
        Arc::new(SqliteInfraRegistry::new(open(&path)).unwrap()),
        Arc::new(StaticTokenSource(None)),
        &DispatchConfig::default(),
    );

    let setup = dispatcher
        .init_task(Some(setup_config(&["build"])))
        .await
        .unwrap();
    let exec = dispatcher
        .execute_task(Some(ExecuteRequest {
            infra_ref_id: Some(setup.infra_id.to_string()),
            ..Default::default()
        }))
        .await
        .unwrap();

    assert!(router.take_queued("east", 10).unwrap().is_empty());
    let queued = router.take_queued("west", 10).unwrap();
    let mut ids: Vec<_> = queued.iter().map(|t| t.task_id.as_str()).collect();
    ids.sort_unstable();
    let mut expected = vec![setup.task_id.as_str(), exec.as_str()];
    expected.sort_unstable();
    assert_eq!(ids, expected);
    assert!(router.take_queued("west", 10).unwrap().is_empty());

    let mut vm_only = setup_config(&[]);
    vm_only.runner_type = "docker".into();
    let err = dispatcher.init_task(Some(vm_only)).await.unwrap_err();
    assert_eq!(err.code(), "FAILED_PRECONDITION");
}
