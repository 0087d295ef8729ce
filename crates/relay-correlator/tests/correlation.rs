use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relay_core::config::CorrelatorConfig;
use relay_core::now_millis;
use relay_correlator::{
    AsyncCorrelator, CorrelatorError, DrainSettings, NotifyHub, ProgressCorrelator, ResponseKind,
    ResponseStore, SyncCorrelator, WaitNotifyEngine,
};
use rusqlite::Connection;

fn open(path: &Path) -> Connection {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        .unwrap();
    conn
}

fn store(path: &Path) -> Arc<ResponseStore> {
    Arc::new(ResponseStore::new(open(path), Duration::from_secs(3_600)).unwrap())
}

fn settings(claim: usize, delete: usize) -> DrainSettings {
    let config = CorrelatorConfig {
        claim_batch_size: claim,
        delete_batch_size: delete,
        max_processing_duration_ms: 1_000,
        ..Default::default()
    };
    DrainSettings::new(&config, Duration::from_millis(10))
}

/// Records every delivery; fails for ids in `failing`.
#[derive(Default)]
struct Recorder {
    done: Mutex<Vec<(String, Vec<u8>)>>,
    progress: Mutex<Vec<(String, Vec<u8>)>>,
    failing: Mutex<HashSet<String>>,
}

impl WaitNotifyEngine for Recorder {
    fn done_with(&self, correlation_id: &str, data: &[u8]) -> relay_correlator::Result<()> {
        if self.failing.lock().unwrap().contains(correlation_id) {
            return Err(CorrelatorError::Delivery {
                correlation_id: correlation_id.to_string(),
                reason: "listener gone".into(),
            });
        }
        self.done
            .lock()
            .unwrap()
            .push((correlation_id.to_string(), data.to_vec()));
        Ok(())
    }

    fn progress_on(&self, correlation_id: &str, data: &[u8]) -> relay_correlator::Result<()> {
        self.progress
            .lock()
            .unwrap()
            .push((correlation_id.to_string(), data.to_vec()));
        Ok(())
    }
}

#[tokio::test]
async fn sync_wait_returns_backstop_instead_of_timing_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    let sync = Arc::new(SyncCorrelator::new(Arc::clone(&store), Duration::from_millis(10)));
    let (tx, rx) = tokio::sync::watch::channel(false);
    let poller = tokio::spawn(Arc::clone(&sync).run(rx));

    let now = now_millis();
    store.setup_timeout_for_task("X", now + 100, now).unwrap();

    let started = Instant::now();
    let response = sync.wait_for_task("X", Duration::from_secs(5)).await.unwrap();
    assert!(response.is_expired());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(sync.waiting(), 0);
    assert!(store.get(ResponseKind::Sync, "X").unwrap().is_none());

    tx.send(true).unwrap();
    poller.await.unwrap();
}

#[tokio::test]
async fn sync_wait_sees_real_result_written_by_another_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r.db");
    let waiter_store = store(&path);
    let agent_store = store(&path);
    let sync = Arc::new(SyncCorrelator::new(waiter_store, Duration::from_millis(10)));
    let (_tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(Arc::clone(&sync).run(rx));

    let now = now_millis();
    agent_store
        .setup_timeout_for_task("T", now + 60_000, now)
        .unwrap();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent_store
            .save_task_result("T", br#"{"status":"SUCCESS"}"#, now_millis())
            .unwrap();
    });

    let response = sync.wait_for_task("T", Duration::from_secs(5)).await.unwrap();
    assert!(!response.is_expired());
    assert_eq!(response.json().unwrap()["status"], "SUCCESS");
    writer.await.unwrap();
}

#[tokio::test]
async fn sync_wait_without_any_record_is_not_completed() {
    let dir = tempfile::tempdir().unwrap();
    let sync = SyncCorrelator::new(store(&dir.path().join("r.db")), Duration::from_millis(10));

    let err = sync
        .wait_for_task("ghost", Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, CorrelatorError::TaskNotCompleted { .. }));
    assert_eq!(err.code(), "DEADLINE_EXCEEDED");
    assert_eq!(sync.waiting(), 0);
}

#[test]
fn async_pass_below_delete_threshold_flushes_at_end() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    let recorder = Arc::new(Recorder::default());
    let correlator = AsyncCorrelator::new(Arc::clone(&store), recorder.clone(), settings(500, 10));

    for id in ["a", "b"] {
        store.save_task_result(id, id.as_bytes(), 0).unwrap();
    }
    let report = correlator.process_once(1).unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.deleted, 2);
    assert_eq!(store.count(ResponseKind::Async).unwrap(), 0);
    assert_eq!(store.count(ResponseKind::Sync).unwrap(), 0);
}

#[test]
fn async_delivery_drops_the_sync_copy_of_each_result() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    let recorder = Arc::new(Recorder::default());
    let correlator = AsyncCorrelator::new(Arc::clone(&store), recorder.clone(), settings(500, 2));

    for i in 0..3 {
        store
            .save_task_result(&format!("t{i}"), b"done", 0)
            .unwrap();
    }
    let report = correlator.process_once(1).unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(store.count(ResponseKind::Async).unwrap(), 0);
    assert_eq!(store.count(ResponseKind::Sync).unwrap(), 0);
}

#[tokio::test]
async fn sync_delivery_drops_the_async_copy() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    let sync = SyncCorrelator::new(Arc::clone(&store), Duration::from_millis(10));

    store.save_task_result("t1", b"done", now_millis()).unwrap();
    let response = sync.wait_for_task("t1", Duration::from_secs(1)).await.unwrap();
    assert_eq!(response.data, b"done");
    assert_eq!(store.count(ResponseKind::Async).unwrap(), 0);
}

#[test]
fn async_pass_above_delete_threshold_deletes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    let recorder = Arc::new(Recorder::default());
    let correlator = AsyncCorrelator::new(Arc::clone(&store), recorder.clone(), settings(500, 3));

    for i in 0..7 {
        store
            .save_response(ResponseKind::Async, &format!("t{i}"), &format!("t{i}"), b"ok", 0)
            .unwrap();
    }
    let report = correlator.process_once(1).unwrap();
    assert_eq!(report.delivered, 7);
    assert_eq!(report.deleted, 7);
    assert_eq!(recorder.done.lock().unwrap().len(), 7);
    assert_eq!(store.count(ResponseKind::Async).unwrap(), 0);
}

#[test]
fn claim_batch_size_caps_one_pass() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    let recorder = Arc::new(Recorder::default());
    let correlator = AsyncCorrelator::new(Arc::clone(&store), recorder, settings(4, 2));

    for i in 0..7 {
        store
            .save_response(ResponseKind::Async, &format!("t{i}"), "c", b"ok", 0)
            .unwrap();
    }
    assert_eq!(correlator.process_once(1).unwrap().claimed, 4);
    assert_eq!(correlator.process_once(2).unwrap().claimed, 3);
    assert_eq!(correlator.process_once(3).unwrap().claimed, 0);
}

#[test]
fn crashed_claim_is_reclaimed_after_lock_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r.db");
    let store = store(&path);
    store.save_task_result("t1", b"result", 0).unwrap();

    // another process claims and dies before delivering
    let crashed = self::store(&path);
    assert!(crashed
        .claim_next(ResponseKind::Async, 10, 10 + 1_000)
        .unwrap()
        .is_some());
    drop(crashed);

    let recorder = Arc::new(Recorder::default());
    let correlator = AsyncCorrelator::new(Arc::clone(&store), recorder.clone(), settings(500, 100));
    assert_eq!(correlator.process_once(500).unwrap().claimed, 0);
    let report = correlator.process_once(1_010).unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(recorder.done.lock().unwrap()[0].1, b"result");
}

#[test]
fn failed_delivery_is_retried_on_a_later_pass() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    let recorder = Arc::new(Recorder::default());
    recorder.failing.lock().unwrap().insert("bad".into());
    let correlator = AsyncCorrelator::new(Arc::clone(&store), recorder.clone(), settings(500, 100));

    store.save_task_result("bad", b"x", 0).unwrap();
    store.save_task_result("good", b"y", 0).unwrap();
    let first = correlator.process_once(1).unwrap();
    assert_eq!((first.delivered, first.failed), (1, 1));
    assert_eq!(store.count(ResponseKind::Async).unwrap(), 1);

    recorder.failing.lock().unwrap().clear();
    assert_eq!(correlator.process_once(2).unwrap().claimed, 0);
    assert_eq!(correlator.process_once(1_001).unwrap().delivered, 1);
    assert_eq!(store.count(ResponseKind::Async).unwrap(), 0);
}

#[test]
fn backstop_is_not_delivered_before_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    let recorder = Arc::new(Recorder::default());
    let correlator = AsyncCorrelator::new(Arc::clone(&store), recorder.clone(), settings(500, 100));

    store.setup_timeout_for_task("t", 1_000, 0).unwrap();
    assert_eq!(correlator.process_once(999).unwrap().claimed, 0);
    assert_eq!(correlator.process_once(1_000).unwrap().delivered, 1);
    let (id, data) = recorder.done.lock().unwrap()[0].clone();
    assert_eq!(id, "t");
    let body: serde_json::Value = serde_json::from_slice(&data).unwrap();
    assert_eq!(body["expired"], true);
}

#[test]
fn progress_updates_are_delivered_under_correlation_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    let recorder = Arc::new(Recorder::default());
    let correlator =
        ProgressCorrelator::new(Arc::clone(&store), recorder.clone(), settings(500, 100));

    store
        .save_response(ResponseKind::Progress, "p1", "exec-9", b"10%", 0)
        .unwrap();
    store
        .save_response(ResponseKind::Progress, "p2", "exec-9", b"20%", 1)
        .unwrap();
    assert_eq!(correlator.process_once(5).unwrap().delivered, 2);

    let progress = recorder.progress.lock().unwrap();
    assert_eq!(progress[0], ("exec-9".to_string(), b"10%".to_vec()));
    assert_eq!(progress[1], ("exec-9".to_string(), b"20%".to_vec()));
    assert!(recorder.done.lock().unwrap().is_empty());
}

#[test]
fn expired_records_are_purged_undelivered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r.db");
    let store = Arc::new(ResponseStore::new(open(&path), Duration::from_secs(1)).unwrap());
    let recorder = Arc::new(Recorder::default());
    let correlator = AsyncCorrelator::new(Arc::clone(&store), recorder.clone(), settings(500, 100));

    store.save_task_result("old", b"x", 0).unwrap();
    let report = correlator.process_once(5_000).unwrap();
    assert_eq!(report.purged, 1);
    assert_eq!(report.delivered, 0);
    assert!(recorder.done.lock().unwrap().is_empty());
}

#[tokio::test]
async fn notify_hub_receives_async_results() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    let hub = Arc::new(NotifyHub::new());
    let correlator = AsyncCorrelator::new(Arc::clone(&store), hub.clone(), settings(500, 100));

    store.save_task_result("t1", b"payload", 0).unwrap();
    correlator.process_once(1).unwrap();
    let n = hub.wait_done("t1", Duration::from_millis(50)).await.unwrap();
    assert_eq!(n.data, b"payload");
}

#[test]
fn abort_replaces_pending_backstop() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir.path().join("r.db"));
    store.setup_timeout_for_task("t", 60_000, 0).unwrap();
    store.abort_task("t", Some("user request"), 10).unwrap();

    let record = store.take_ready(ResponseKind::Sync, "t", 10).unwrap().unwrap();
    let body: serde_json::Value = serde_json::from_slice(&record.response_data).unwrap();
    assert_eq!(body["expired"], false);
    assert!(body["error_message"].as_str().unwrap().contains("user request"));
}
