//! Deletion workflow and the deploy/undeploy task actors.

use async_trait::async_trait;
use quiver_core::error::{QuiverError, Result};
use quiver_core::types::{
    AggregationType, CollectionNamespace, DeletionPayload, DeploymentPayload, EmbeddingModelInfo,
    HnswParams, MetricType, Task,
};
use quiver_tasks::{Actor, ActorContext};
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::WorkerContext;

/// Queue actor handling DELETE tasks.
pub struct DeletionActor {
    ctx: Arc<WorkerContext>,
}

impl DeletionActor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Actor for DeletionActor {
    fn queue(&self) -> &'static str {
        "deletion_queue"
    }

    async fn handle(&self, task: &Task, actx: &ActorContext) -> Result<()> {
        let payload: DeletionPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| QuiverError::validation(format!("invalid deletion payload: {e}")))?;
        if payload.object_ids.is_empty() {
            return Ok(());
        }

        let namespace = if payload.categories {
            CollectionNamespace::Categories
        } else {
            CollectionNamespace::Primary
        };
        let collection = self
            .ctx
            .resolve_regular(payload.embedding_model_id.as_deref(), namespace)?;

        info!(task_id = %task.task_id, collection_id = %collection.collection_id,
            ids = payload.object_ids.len(), "Starting deletion");

        let batch_size = self.ctx.config.upsertion.batch_size.max(1);
        let mut deleted_total = 0usize;
        let mut batches_failed = 0usize;
        let mut batches = 0usize;

        for batch in payload.object_ids.chunks(batch_size) {
            actx.checkpoint()?;
            batches += 1;
            match self.ctx.vectors.delete(&collection, batch).await {
                Ok(deleted) => {
                    deleted_total += deleted.len();
                    let missing: Vec<String> = batch
                        .iter()
                        .filter(|id| !deleted.contains(id))
                        .cloned()
                        .collect();
                    if !missing.is_empty() {
                        self.ctx
                            .tasks
                            .append_failed_ids(&task.task_id, &missing)
                            .await?;
                    }
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    debug!(task_id = %task.task_id, error = %e, "Deletion batch failed");
                    batches_failed += 1;
                    self.ctx
                        .tasks
                        .append_failed_ids(&task.task_id, batch)
                        .await?;
                }
            }
        }

        if batches_failed == batches && deleted_total == 0 {
            return Err(QuiverError::internal("every deletion batch failed"));
        }
        Ok(())
    }
}

/// Resolve the model a deployment task refers to; a collection is not
/// required yet, a plugin name in the payload is enough.
fn deployment_model(
    ctx: &WorkerContext,
    payload: &DeploymentPayload,
) -> Result<EmbeddingModelInfo> {
    if let Some(info) = ctx.cache.get(&payload.embedding_model_id) {
        return Ok(info.model);
    }
    Ok(EmbeddingModelInfo {
        embedding_model_id: payload.embedding_model_id.clone(),
        plugin_name: payload
            .plugin_name
            .clone()
            .ok_or_else(|| QuiverError::not_found("collection", &payload.embedding_model_id))?,
        dimensions: 1,
        metric_type: MetricType::Cosine,
        aggregation_type: AggregationType::Avg,
        hnsw: HnswParams::default(),
    })
}

/// Queue actor handling DEPLOY tasks.
pub struct DeployActor {
    ctx: Arc<WorkerContext>,
}

impl DeployActor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Actor for DeployActor {
    fn queue(&self) -> &'static str {
        "deployment_queue"
    }

    async fn handle(&self, task: &Task, _actx: &ActorContext) -> Result<()> {
        let payload: DeploymentPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| QuiverError::validation(format!("invalid deployment payload: {e}")))?;

        let model = deployment_model(&self.ctx, &payload)?;
        let plugin = self.ctx.plugins.get(&model.plugin_name)?;
        let ids = plugin.inference_model_ids(&model);

        self.ctx
            .deployer
            .deploy(
                &model.embedding_model_id,
                &model.plugin_name,
                &ids,
                payload.artifact_url.as_deref(),
            )
            .await
    }
}

/// Queue actor handling UNDEPLOY tasks.
pub struct UndeployActor {
    ctx: Arc<WorkerContext>,
}

impl UndeployActor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Actor for UndeployActor {
    fn queue(&self) -> &'static str {
        "undeployment_queue"
    }

    async fn handle(&self, task: &Task, _actx: &ActorContext) -> Result<()> {
        let payload: DeploymentPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| QuiverError::validation(format!("invalid deployment payload: {e}")))?;
        self.ctx.deployer.undeploy(&payload.embedding_model_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::config::QuiverConfig;
    use quiver_core::types::{Object, ObjectPart, TaskKind};
    use tokio_util::sync::CancellationToken;

    fn model(id: &str) -> EmbeddingModelInfo {
        EmbeddingModelInfo {
            embedding_model_id: id.to_owned(),
            plugin_name: "static_text".to_owned(),
            dimensions: 3,
            metric_type: MetricType::Cosine,
            aggregation_type: AggregationType::Avg,
            hnsw: HnswParams::default(),
        }
    }

    fn object(id: &str) -> Object {
        Object::new(
            id,
            vec![ObjectPart {
                part_id: format!("{id}_0"),
                vector: vec![1.0, 0.0, 0.0],
                is_average: false,
            }],
        )
    }

    #[tokio::test]
    async fn deletion_tracks_missing_ids() {
        let ctx = WorkerContext::in_memory(QuiverConfig::default(), 3)
            .await
            .unwrap();
        ctx.lifecycle.create_pair(&model("m1")).await.unwrap();
        ctx.lifecycle.promote_to_blue("m1").await.unwrap();

        let collection = ctx
            .cache
            .get_blue(quiver_core::types::CollectionKind::Regular)
            .unwrap();
        ctx.vectors
            .insert(&collection, &[object("o1"), object("o2")])
            .await
            .unwrap();

        let payload = DeletionPayload {
            embedding_model_id: None,
            object_ids: vec!["o1".into(), "ghost".into()],
            categories: false,
        };
        let task = ctx
            .tasks
            .create(Task::new(
                TaskKind::Delete,
                serde_json::to_value(payload).unwrap(),
                None,
            ))
            .await
            .unwrap();

        let actor = DeletionActor::new(Arc::clone(&ctx));
        let actx = ActorContext {
            cancellation: CancellationToken::new(),
            attempt: 1,
        };
        actor.handle(&task, &actx).await.unwrap();

        let stored = ctx.tasks.get(&task.task_id).await.unwrap();
        assert_eq!(stored.failed_item_ids, vec!["ghost"]);
        assert_eq!(
            ctx.vectors
                .find_by_ids(&collection, &["o1".into(), "o2".into()])
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn deploy_and_undeploy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = QuiverConfig::default();
        config.model_repo.root = dir.path().to_path_buf();
        config.inference.deploy_timeout_secs = 2;
        config.inference.ready_poll_interval_secs = 1;
        let ctx = WorkerContext::in_memory(config, 3).await.unwrap();
        ctx.lifecycle.create_pair(&model("m1")).await.unwrap();

        let payload = DeploymentPayload {
            embedding_model_id: "m1".into(),
            artifact_url: None,
            plugin_name: None,
        };
        let deploy_task = ctx
            .tasks
            .create(Task::new(
                TaskKind::Deploy,
                serde_json::to_value(&payload).unwrap(),
                None,
            ))
            .await
            .unwrap();

        let actx = ActorContext {
            cancellation: CancellationToken::new(),
            attempt: 1,
        };
        DeployActor::new(Arc::clone(&ctx))
            .handle(&deploy_task, &actx)
            .await
            .unwrap();
        assert!(dir.path().join("m1").join("manifest.json").exists());

        let undeploy_task = ctx
            .tasks
            .create(Task::new(
                TaskKind::Undeploy,
                serde_json::to_value(&payload).unwrap(),
                None,
            ))
            .await
            .unwrap();
        UndeployActor::new(Arc::clone(&ctx))
            .handle(&undeploy_task, &actx)
            .await
            .unwrap();
        assert!(!dir.path().join("m1").exists());
    }
}
