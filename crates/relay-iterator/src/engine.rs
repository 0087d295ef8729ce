use std::sync::Arc;

use relay_core::{now_millis, ProcessMode};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::handler::Handler;
use crate::policy::millis;
use crate::store::WorkClaimStore;
use crate::types::{ClaimResult, IteratorSpec, RecoveryReport};

/// One recurring discovery job: claims due entities and feeds them to a handler.
///
/// A counting semaphore caps simultaneous handler invocations, so a slow
/// handler cannot monopolise the runtime. The claim commits before the
/// handler runs; a failing handler is logged and the entity simply comes
/// due again on its next scheduled tick.
pub struct PersistenceIterator {
    spec: IteratorSpec,
    store: Arc<WorkClaimStore>,
    handler: Arc<dyn Handler>,
    semaphore: Arc<Semaphore>,
}

impl std::fmt::Debug for PersistenceIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceIterator").field("spec", &self.spec).finish_non_exhaustive()
    }
}

impl PersistenceIterator {
    pub fn new(spec: IteratorSpec, store: Arc<WorkClaimStore>, handler: Arc<dyn Handler>) -> Self {
        let semaphore = Arc::new(Semaphore::new(spec.concurrency));
        Self {
            spec,
            store,
            handler,
            semaphore,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &IteratorSpec {
        &self.spec
    }

    /// Clear malformed iteration fields before normal operation starts.
    pub fn recover_after_pause(&self) -> Result<RecoveryReport> {
        let redistribute = self.spec.redistribute.then_some(self.spec.target_interval);
        self.store.recover_after_pause(
            &self.spec.target,
            self.spec.policy,
            now_millis(),
            redistribute,
        )
    }

    /// Pump pass: claim and dispatch every currently-due entity.
    ///
    /// Waits for a free permit before each claim so no entity is claimed
    /// without capacity to run it. Returns the number of entities claimed.
    pub async fn process_once(&self) -> Result<usize> {
        let mut claimed = 0;
        loop {
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                break;
            };
            match self.claim()? {
                Some(claim) => {
                    claimed += 1;
                    self.dispatch(claim, permit);
                }
                None => break,
            }
        }
        if claimed > 0 {
            debug!(iterator = %self.spec.name, claimed, "pump pass complete");
        }
        Ok(claimed)
    }

    /// Fixed-rate pass: at most one claim, skipped when every permit is busy.
    pub async fn tick_once(&self) -> Result<bool> {
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            debug!(iterator = %self.spec.name, "all handler slots busy, skipping tick");
            return Ok(false);
        };
        match self.claim()? {
            Some(claim) => {
                self.dispatch(claim, permit);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resolve once every in-flight handler has finished.
    pub async fn wait_idle(&self) {
        let permits = self.spec.concurrency as u32;
        if let Ok(all) = self.semaphore.acquire_many(permits).await {
            drop(all);
        }
    }

    /// Main loop: recovery pass, then one pump/tick per interval until `shutdown`
    /// broadcasts `true`. Errors are logged and the next tick tries again.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(iterator = %self.spec.name, mode = ?self.spec.mode, policy = %self.spec.policy, "iterator started");
        if let Err(e) = self.recover_after_pause() {
            error!(iterator = %self.spec.name, "recover after pause failed: {e}");
        }

        let mut interval = tokio::time::interval(self.spec.pump_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let outcome = match self.spec.mode {
                        ProcessMode::Pump => self.process_once().await.map(|_| ()),
                        ProcessMode::Loop => self.tick_once().await.map(|_| ()),
                    };
                    if let Err(e) = outcome {
                        error!(iterator = %self.spec.name, "iteration error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(iterator = %self.spec.name, "iterator shutting down");
                        break;
                    }
                }
            }
        }
        self.wait_idle().await;
    }

    fn claim(&self) -> Result<Option<ClaimResult>> {
        let base = now_millis();
        let throttle = base + millis(self.spec.throttle_interval);
        let claim = self.store.obtain_next_instance(
            base,
            throttle,
            &self.spec.target,
            self.spec.policy,
            self.spec.target_interval,
        )?;

        if let Some(due) = claim.as_ref().and_then(|c| c.previous.due_at()) {
            let late_by = base - due;
            if late_by > millis(self.spec.acceptable_delay) {
                warn!(iterator = %self.spec.name, late_by_ms = late_by, "iteration delayed beyond acceptable delay");
            }
        }
        Ok(claim)
    }

    /// Run the handler on its own task; the permit is released when it ends.
    fn dispatch(&self, claim: ClaimResult, permit: OwnedSemaphorePermit) {
        let handler = Arc::clone(&self.handler);
        let name = self.spec.name.clone();
        let entity_id = claim.entity.id.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = tokio::spawn(async move { handler.handle(claim.entity).await }).await;
            match outcome {
                Ok(Ok(())) => debug!(iterator = %name, %entity_id, "handler completed"),
                Ok(Err(e)) => error!(iterator = %name, %entity_id, "handler failed: {e:#}"),
                Err(e) => error!(iterator = %name, %entity_id, "handler panicked: {e}"),
            }
        });
    }
}
