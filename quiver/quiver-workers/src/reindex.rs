//! Reindex workflow.
//!
//! Streams the source regular collection in stable batches, spawning one
//! child upsertion task per batch against the destination model. Child
//! failures accumulate on the parent instead of failing it, so callers can
//! retry selectively. On success the destination pair is promoted to blue and
//! the source model is torn down.

use async_trait::async_trait;
use quiver_core::error::{QuiverError, Result};
use quiver_core::types::{
    CollectionInfo, CollectionKind, DeploymentPayload, EmbeddingModelInfo, ReindexPayload, Task,
    TaskKind, TaskStatus, UpsertItem, UpsertionPayload,
};
use quiver_tasks::{Actor, ActorContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::context::WorkerContext;

/// Queue actor handling REINDEX tasks.
pub struct ReindexActor {
    ctx: Arc<WorkerContext>,
}

impl ReindexActor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Whether another reindex touching the same models is running.
    async fn conflicting_reindex(&self, task_id: &str, payload: &ReindexPayload) -> Result<bool> {
        let processing = self
            .ctx
            .tasks
            .list(TaskKind::Reindex, Some(TaskStatus::Processing), 0, 100)
            .await?;

        for other in processing {
            if other.task_id == task_id {
                continue;
            }
            let Ok(other_payload) = serde_json::from_value::<ReindexPayload>(other.payload.clone())
            else {
                continue;
            };
            let models = [
                other_payload.source.embedding_model_id,
                other_payload.dest.embedding_model_id,
            ];
            if models.contains(&payload.source.embedding_model_id)
                || models.contains(&payload.dest.embedding_model_id)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn wait_for_conflict_slot(
        &self,
        task_id: &str,
        payload: &ReindexPayload,
        actx: &ActorContext,
    ) -> Result<()> {
        let deadline = Duration::from_secs(self.ctx.config.reindex.conflict_wait_timeout_secs);
        let poll = Duration::from_secs(self.ctx.config.reindex.conflict_poll_secs.max(1));

        let wait = async {
            while self.conflicting_reindex(task_id, payload).await? {
                actx.checkpoint()?;
                tokio::time::sleep(poll).await;
            }
            Ok(())
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| QuiverError::timeout("waiting for conflicting reindex"))?
    }

    /// Destination model: the existing destination collection's model, or the
    /// source architecture under the destination id.
    fn dest_model(&self, source: &CollectionInfo, dest_id: &str) -> EmbeddingModelInfo {
        match self.ctx.cache.get(dest_id) {
            Some(info) => info.model,
            None => EmbeddingModelInfo {
                embedding_model_id: dest_id.to_owned(),
                ..source.model.clone()
            },
        }
    }

    async fn ensure_deployed(&self, model: &EmbeddingModelInfo) -> Result<()> {
        let plugin = self.ctx.plugins.get(&model.plugin_name)?;
        let ids = plugin.inference_model_ids(model);
        if self.ctx.deployer.is_ready(&model.plugin_name, &ids).await? {
            return Ok(());
        }
        info!(embedding_model_id = %model.embedding_model_id, "Destination model not ready, deploying");
        self.ctx
            .deployer
            .deploy(&model.embedding_model_id, &model.plugin_name, &ids, None)
            .await
    }

    /// Spawn one child upsertion task for a batch of source objects.
    async fn spawn_child(
        &self,
        parent_id: &str,
        dest_id: &str,
        items: Vec<UpsertItem>,
    ) -> Result<String> {
        let payload = UpsertionPayload {
            embedding_model_id: Some(dest_id.to_owned()),
            items,
            categories: false,
        };
        let child = Task::new(TaskKind::Upsert, serde_json::to_value(&payload)?, None)
            .with_model(dest_id)
            .with_parent(parent_id);
        let child = self.ctx.tasks.create(child).await?;
        self.ctx.tasks.link_child(parent_id, &child.task_id).await?;
        self.ctx.dispatcher.send_task(&child).await?;
        Ok(child.task_id)
    }

    async fn await_children(
        &self,
        children: &[String],
        actx: &ActorContext,
    ) -> Result<Vec<Task>> {
        let poll = Duration::from_secs(self.ctx.config.reindex.children_poll_secs.max(1));
        loop {
            actx.checkpoint()?;
            let mut settled = Vec::with_capacity(children.len());
            let mut all_terminal = true;
            for child_id in children {
                let child = self.ctx.tasks.get(child_id).await?;
                if !child.status.is_terminal() {
                    all_terminal = false;
                    break;
                }
                settled.push(child);
            }
            if all_terminal {
                return Ok(settled);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Tear down the source model after a successful blue switch.
    async fn retire_source(&self, source_id: &str) -> Result<()> {
        let undeploy = Task::new(
            TaskKind::Undeploy,
            serde_json::to_value(DeploymentPayload {
                embedding_model_id: source_id.to_owned(),
                artifact_url: None,
                plugin_name: None,
            })?,
            None,
        )
        .with_model(source_id);
        let undeploy = self.ctx.tasks.create(undeploy).await?;
        if let Err(e) = self.ctx.dispatcher.ensure_sent(&undeploy).await {
            warn!(source_id, error = %e, "Undeploy task could not be sent");
        }

        self.ctx.lifecycle.delete_pair(source_id).await
    }
}

#[async_trait]
impl Actor for ReindexActor {
    fn queue(&self) -> &'static str {
        "reindex_queue"
    }

    async fn handle(&self, task: &Task, actx: &ActorContext) -> Result<()> {
        let payload: ReindexPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| QuiverError::validation(format!("invalid reindex payload: {e}")))?;
        let source_id = payload.source.embedding_model_id.clone();
        let dest_id = payload.dest.embedding_model_id.clone();
        if source_id == dest_id {
            return Err(QuiverError::validation(
                "reindex source and destination must differ",
            ));
        }

        if self.conflicting_reindex(&task.task_id, &payload).await? {
            if !payload.wait_on_conflict {
                return Err(QuiverError::conflict(format!(
                    "another reindex of {source_id} or {dest_id} is running"
                )));
            }
            self.wait_for_conflict_slot(&task.task_id, &payload, actx)
                .await?;
        }

        let source = self
            .ctx
            .cache
            .get_with_kind(&source_id, CollectionKind::Regular)
            .ok_or_else(|| QuiverError::not_found("collection", &source_id))?;
        let dest_model = self.dest_model(&source, &dest_id);

        self.ensure_deployed(&dest_model).await?;
        self.ctx.lifecycle.create_pair(&dest_model).await?;
        self.ctx.lifecycle.create_index(&dest_id).await?;
        self.ctx.lifecycle.apply_optimizations(&dest_id).await?;

        info!(task_id = %task.task_id, source = %source_id, dest = %dest_id,
            "Enumerating source collection");

        let batch_size = self.ctx.config.reindex.batch_size.max(1);
        let mut children = Vec::new();
        let mut after: Option<String> = None;
        loop {
            actx.checkpoint()?;
            let ids = self
                .ctx
                .vectors
                .list_object_ids(&source, after.as_deref(), batch_size)
                .await?;
            if ids.is_empty() {
                break;
            }
            after = ids.last().cloned();

            let objects = self.ctx.vectors.find_by_ids(&source, &ids).await?;
            let items: Vec<UpsertItem> = objects
                .into_iter()
                .map(|object| UpsertItem {
                    object_id: object.object_id,
                    payload: Some(object.payload),
                    item_info: None,
                })
                .collect();
            children.push(self.spawn_child(&task.task_id, &dest_id, items).await?);
        }

        let settled = self.await_children(&children, actx).await?;
        let mut any_fully_failed = false;
        for child in &settled {
            if !child.failed_items.is_empty() {
                self.ctx
                    .tasks
                    .append_failures(&task.task_id, &child.failed_items)
                    .await?;
            }
            if child.status == TaskStatus::Error {
                any_fully_failed = true;
            }
        }

        info!(task_id = %task.task_id, children = children.len(),
            any_fully_failed, "Reindex children settled");

        if payload.deploy_as_blue && !any_fully_failed {
            self.ctx.lifecycle.promote_to_blue(&dest_id).await?;
            self.retire_source(&source_id).await?;
        }
        Ok(())
    }
}
