use std::time::Duration;

use relay_core::config::CorrelatorConfig;
use relay_core::now_millis;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::store::{millis, ResponseStore};
use crate::types::{ResponseKind, ResponseRecord};

/// Batch limits of one claim-deliver-delete pass.
#[derive(Debug, Clone, Copy)]
pub struct DrainSettings {
    pub poll_interval: Duration,
    /// Lock window a claim holds before the record is claimable again.
    pub max_processing: Duration,
    pub claim_batch_size: usize,
    pub delete_batch_size: usize,
}

impl DrainSettings {
    pub fn new(config: &CorrelatorConfig, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            max_processing: config.max_processing_duration(),
            claim_batch_size: config.claim_batch_size.max(1),
            delete_batch_size: config.delete_batch_size.max(1),
        }
    }
}

/// Counters of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub purged: usize,
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
    pub deleted: usize,
}

/// Claim up to `claim_batch_size` records of `kind`, hand each to `deliver`,
/// and delete the delivered ones in batches of `delete_batch_size`.
///
/// A failed delivery is logged and left in place; its lock runs out after
/// `max_processing` and a later pass claims it again.
pub(crate) fn drain_pass<F>(
    store: &ResponseStore,
    kind: ResponseKind,
    settings: &DrainSettings,
    now: i64,
    mut deliver: F,
) -> Result<DrainReport>
where
    F: FnMut(&ResponseRecord) -> Result<()>,
{
    let mut report = DrainReport {
        purged: store.purge_expired(kind, now)?,
        ..Default::default()
    };
    let lock_until = now + millis(settings.max_processing);
    let mut delivered: Vec<String> = Vec::with_capacity(settings.delete_batch_size);

    while report.claimed < settings.claim_batch_size {
        let Some(record) = store.claim_next(kind, now, lock_until)? else {
            break;
        };
        report.claimed += 1;
        match deliver(&record) {
            Ok(()) => {
                report.delivered += 1;
                delivered.push(record.uuid);
                if delivered.len() >= settings.delete_batch_size {
                    report.deleted += store.delete_many(kind, &delivered)?;
                    delivered.clear();
                }
            }
            Err(e) => {
                report.failed += 1;
                warn!(%kind, uuid = %record.uuid, "delivery failed, left for reclaim: {e}");
            }
        }
    }
    if !delivered.is_empty() {
        report.deleted += store.delete_many(kind, &delivered)?;
    }

    if report.claimed > 0 {
        debug!(
            %kind,
            claimed = report.claimed,
            delivered = report.delivered,
            failed = report.failed,
            deleted = report.deleted,
            "drain pass complete"
        );
    }
    Ok(report)
}

/// Drive `pass` every `interval` until `shutdown` broadcasts `true`.
pub(crate) async fn run_loop<P>(
    kind: ResponseKind,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    pass: P,
) where
    P: Fn(i64) -> Result<DrainReport>,
{
    info!(%kind, interval_ms = interval.as_millis() as u64, "response poller started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = pass(now_millis()) {
                    error!(%kind, "response poll error: {e}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(%kind, "response poller shutting down");
                    break;
                }
            }
        }
    }
}

