use std::sync::Arc;

use tokio::sync::watch;

use crate::drain::{drain_pass, run_loop, DrainReport, DrainSettings};
use crate::error::Result;
use crate::notify::WaitNotifyEngine;
use crate::store::ResponseStore;
use crate::types::ResponseKind;

/// Hands terminal results from `async_task_responses` to the notify engine.
pub struct AsyncCorrelator {
    store: Arc<ResponseStore>,
    notifier: Arc<dyn WaitNotifyEngine>,
    settings: DrainSettings,
}

impl AsyncCorrelator {
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

    /// One claim-deliver-delete pass at `now`.
    pub fn process_once(&self, now: i64) -> Result<DrainReport> {
        drain_pass(&self.store, ResponseKind::Async, &self.settings, now, |record| {
            self.notifier
                .done_with(&record.correlation_id, &record.response_data)
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.settings.poll_interval;
        run_loop(ResponseKind::Async, interval, shutdown, |now| {
            self.process_once(now)
        })
        .await;
    }
}
