use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::Entity;

/// Business callback invoked once per successful claim.
///
/// Delivery is at-least-once: a crash between claim and completion, or a
/// recovery pass after a pause, can hand the same entity over again.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, entity: Entity) -> anyhow::Result<()>;
}

/// Forwards claimed entities to a delivery task.
///
/// Uses `try_send` so a slow consumer never stalls the claim loop; a full
/// channel drops the entity with a warning (it is already rescheduled).
pub struct ChannelHandler {
    tx: mpsc::Sender<Entity>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::Sender<Entity>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Handler for ChannelHandler {
    async fn handle(&self, entity: Entity) -> anyhow::Result<()> {
        let id = entity.id.clone();
        if self.tx.try_send(entity).is_err() {
            warn!(entity_id = %id, "delivery channel full or closed, entity dropped");
        }
        Ok(())
    }
}

/// Runs an ordered list of stages for every claimed entity.
///
/// Replaces runtime-built parent chains (hourly feeding daily, and so on)
/// with an explicit list. Stops at the first failing stage.
pub struct StagePipeline {
    stages: Vec<(String, Arc<dyn Handler>)>,
}

impl StagePipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn stage(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.stages.push((name.into(), handler));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StagePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for StagePipeline {
    async fn handle(&self, entity: Entity) -> anyhow::Result<()> {
        for (name, stage) in &self.stages {
            stage
                .handle(entity.clone())
                .await
                .map_err(|e| e.context(format!("stage {name} failed")))?;
        }
        Ok(())
    }
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Entity) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, entity: Entity) -> anyhow::Result<()> {
        (self.f)(entity).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Entity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityId;
    use std::sync::Mutex;

    fn entity(id: i64) -> Entity {
        Entity {
            entity_type: "billing".into(),
            id: EntityId::Int(id),
            fields: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn pipeline_runs_stages_in_order_and_stops_on_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = |tag: &'static str, fail: bool| {
            let log = Arc::clone(&log);
            handler_fn(move |_e| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(tag);
                    if fail {
                        anyhow::bail!("{tag} broke");
                    }
                    Ok(())
                }
            })
        };

        let pipeline = StagePipeline::new()
            .stage("hourly", recorder("hourly", false))
            .stage("daily", recorder("daily", true))
            .stage("monthly", recorder("monthly", false));

        let err = pipeline.handle(entity(1)).await.unwrap_err();
        assert!(err.to_string().contains("daily"));
        assert_eq!(*log.lock().unwrap(), vec!["hourly", "daily"]);
    }

    #[tokio::test]
    async fn channel_handler_never_blocks_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let handler = ChannelHandler::new(tx);
        handler.handle(entity(1)).await.unwrap();
        handler.handle(entity(2)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, EntityId::Int(1));
        assert!(rx.try_recv().is_err());
    }
}
