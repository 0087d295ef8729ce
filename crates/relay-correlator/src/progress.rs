use std::sync::Arc;

use tokio::sync::watch;

use crate::drain::{drain_pass, run_loop, DrainReport, DrainSettings};
use crate::error::Result;
use crate::notify::WaitNotifyEngine;
use crate::store::ResponseStore;
use crate::types::ResponseKind;

/// Streams incremental updates from `task_progress_responses`.
///
/// Same claim mechanics as [`crate::AsyncCorrelator`]; records are keyed by
/// their own uuid and delivered under the caller-chosen correlation id.
pub struct ProgressCorrelator {
    store: Arc<ResponseStore>,
    notifier: Arc<dyn WaitNotifyEngine>,
    settings: DrainSettings,
}

impl ProgressCorrelator {
    pub fn new(
        store: Arc<ResponseStore>,
        notifier: Arc<dyn WaitNotifyEngine>,
        settings: DrainSettings,
    ) -> Self {
        Self {
            store,
            notifier,
            settings,
        }
    }

    pub fn process_once(&self, now: i64) -> Result<DrainReport> {
        drain_pass(&self.store, ResponseKind::Progress, &self.settings, now, |record| {
            self.notifier
                .progress_on(&record.correlation_id, &record.response_data)
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.settings.poll_interval;
        run_loop(ResponseKind::Progress, interval, shutdown, |now| {
            self.process_once(now)
        })
        .await;
    }
}
