use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use relay_core::now_millis;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, instrument};

use crate::error::{CorrelatorError, Result};
use crate::store::{millis, ResponseStore};
use crate::types::{ResponseKind, TaskResponse};

/// In-process record of one blocked caller.
struct Registration {
    notify: Notify,
    deadline: i64,
}

/// Removes the registration on every exit path of `wait_for_task`.
struct WaitGuard<'a> {
    waits: &'a DashMap<String, Arc<Registration>>,
    task_id: &'a str,
    registration: &'a Arc<Registration>,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.waits
            .remove_if(self.task_id, |_, r| Arc::ptr_eq(r, self.registration));
    }
}

/// Blocks callers until their task's record shows up in `sync_task_responses`.
///
/// Registrations live in memory only; a process restart forgets them and
/// the records they were waiting for expire through `valid_until`.
pub struct SyncCorrelator {
    store: Arc<ResponseStore>,
    waits: DashMap<String, Arc<Registration>>,
    poll_interval: Duration,
}

impl SyncCorrelator {
    pub fn new(store: Arc<ResponseStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            waits: DashMap::new(),
            poll_interval,
        }
    }

    /// Wait up to `timeout` for the terminal record of `task_id`, then
    /// read-and-delete it.
    ///
    /// A synthetic expired answer counts as a result; check
    /// [`TaskResponse::is_expired`]. No deliverable record yields
    /// [`CorrelatorError::TaskNotCompleted`].
    #[instrument(skip(self))]
    pub async fn wait_for_task(&self, task_id: &str, timeout: Duration) -> Result<TaskResponse> {
        let registration = Arc::new(Registration {
            notify: Notify::new(),
            deadline: now_millis() + millis(timeout),
        });
        self.waits
            .insert(task_id.to_string(), Arc::clone(&registration));
        let _guard = WaitGuard {
            waits: &self.waits,
            task_id,
            registration: &registration,
        };

        let ready = self
            .store
            .ready_ids(ResponseKind::Sync, &[task_id.to_string()], now_millis())?;
        if ready.is_empty()
            && tokio::time::timeout(timeout, registration.notify.notified())
                .await
                .is_err()
        {
            debug!("wait timed out, checking once more");
        }

        match self
            .store
            .take_ready(ResponseKind::Sync, task_id, now_millis())?
        {
            Some(record) => Ok(TaskResponse::from(record)),
            None => Err(CorrelatorError::TaskNotCompleted {
                task_id: task_id.to_string(),
            }),
        }
    }

    /// Number of callers currently blocked.
    pub fn waiting(&self) -> usize {
        self.waits.len()
    }

    /// One poll: wake every registered caller whose record is deliverable.
    /// Also drops expired sync records.
    pub fn poll_once(&self, now: i64) -> Result<usize> {
        self.store.purge_expired(ResponseKind::Sync, now)?;
        let ids: Vec<String> = self
            .waits
            .iter()
            .filter(|entry| entry.value().deadline >= now)
            .map(|entry| entry.key().clone())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let ready = self.store.ready_ids(ResponseKind::Sync, &ids, now)?;
        for id in &ready {
            if let Some(registration) = self.waits.get(id) {
                registration.notify.notify_one();
            }
        }
        if !ready.is_empty() {
            debug!(woken = ready.len(), "sync waiters woken");
        }
        Ok(ready.len())
    }

    /// Poll loop; exits when `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.poll_interval.as_millis() as u64, "sync correlator started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once(now_millis()) {
                        error!("sync poll error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("sync correlator shutting down");
                        break;
                    }
                }
            }
        }
    }
}
