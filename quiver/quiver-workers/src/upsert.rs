//! Upsertion workflow.
//!
//! Items flow through a staged pipeline: the embed stage builds inference
//! inputs and obtains vectors, the write stage assembles objects and upserts
//! them in bounded batches. A bounded channel between the stages provides
//! back-pressure; one cancellation token broadcast stops both.

use async_trait::async_trait;
use quiver_core::error::{QuiverError, Result};
use quiver_core::plugin::ModelPlugin;
use quiver_core::traits::InferenceClient;
use quiver_core::types::{
    CollectionInfo, CollectionNamespace, FailedItem, Object, ObjectPart, Task, UpsertItem,
    UpsertionPayload, Vector,
};
use quiver_tasks::{Actor, ActorContext, RetryPolicy};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::WorkerContext;

/// One item that made it through the embed stage.
struct Embedded {
    item: UpsertItem,
    vectors: Vec<Vector>,
}

/// Queue actor handling UPSERT tasks.
pub struct UpsertionActor {
    ctx: Arc<WorkerContext>,
}

impl UpsertionActor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Assemble the stored object of an embedded item. Multi-vector items
    /// additionally carry an averaged part used by AVG-aggregated search.
    fn build_object(item: &UpsertItem, vectors: &[Vector]) -> Object {
        let mut parts: Vec<ObjectPart> = vectors
            .iter()
            .enumerate()
            .map(|(i, vector)| ObjectPart {
                part_id: format!("{}_{i}", item.object_id),
                vector: vector.clone(),
                is_average: false,
            })
            .collect();

        if vectors.len() > 1 {
            let dim = vectors[0].len();
            let mut average = vec![0.0f32; dim];
            for vector in vectors {
                for (slot, value) in average.iter_mut().zip(vector.iter()) {
                    *slot += value;
                }
            }
            for value in &mut average {
                *value /= vectors.len() as f32;
            }
            parts.push(ObjectPart {
                part_id: format!("{}_avg", item.object_id),
                vector: average,
                is_average: true,
            });
        }

        Object::new(item.object_id.clone(), parts)
            .with_payload(item.payload.clone().unwrap_or(serde_json::Value::Null))
    }

    async fn write_batch(
        &self,
        collection: &CollectionInfo,
        batch: &mut Vec<Embedded>,
        failures: &mut Vec<FailedItem>,
        written: &mut usize,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let objects: Vec<Object> = batch
            .iter()
            .map(|embedded| Self::build_object(&embedded.item, &embedded.vectors))
            .collect();

        let policy = RetryPolicy::from_config(&self.ctx.config.dispatcher);
        let mut attempt = 1u32;
        loop {
            match self
                .ctx
                .vectors
                .upsert(collection, &objects, true)
                .await
            {
                Ok(()) => {
                    *written += objects.len();
                    break;
                }
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    warn!(attempt, error = %e, "Upsert batch failed, retrying");
                    tokio::time::sleep(policy.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    for object in &objects {
                        failures.push(FailedItem::new(&object.object_id, e.to_string()));
                    }
                    break;
                }
            }
        }
        batch.clear();
        Ok(())
    }
}

/// Embed stage: builds inference inputs and forwards them to the items model.
#[allow(clippy::too_many_arguments)]
async fn embed_stage(
    inference: Arc<dyn InferenceClient>,
    plugin: Arc<dyn ModelPlugin>,
    plugin_name: String,
    items_model: String,
    dimensions: usize,
    items: Vec<UpsertItem>,
    batch_size: usize,
    token: CancellationToken,
    tx: mpsc::Sender<Embedded>,
    fail_tx: mpsc::UnboundedSender<FailedItem>,
) {
    for chunk in items.chunks(batch_size.max(1)) {
        if token.is_cancelled() {
            return;
        }

        // Flatten per-item inputs so one inference call covers the chunk.
        let mut flat_inputs = Vec::new();
        let mut spans: Vec<(UpsertItem, usize)> = Vec::new();
        for item in chunk {
            match plugin.embedding_inputs(item) {
                Ok(inputs) if !inputs.is_empty() => {
                    flat_inputs.extend(inputs.iter().cloned());
                    spans.push((item.clone(), inputs.len()));
                }
                Ok(_) => {
                    let _ = fail_tx.send(FailedItem::new(&item.object_id, "no embedding inputs"));
                }
                Err(e) => {
                    let _ = fail_tx.send(FailedItem::new(&item.object_id, e.to_string()));
                }
            }
        }
        if flat_inputs.is_empty() {
            continue;
        }

        let vectors = match inference
            .forward_items(&plugin_name, &items_model, &flat_inputs)
            .await
        {
            Ok(vectors) => vectors,
            Err(e) => {
                for (item, _) in &spans {
                    let _ = fail_tx.send(FailedItem::new(&item.object_id, e.to_string()));
                }
                continue;
            }
        };

        let mut offset = 0usize;
        for (item, count) in spans {
            let item_vectors = vectors[offset..offset + count].to_vec();
            offset += count;

            if let Some(bad) = item_vectors.iter().find(|v| v.len() != dimensions) {
                let _ = fail_tx.send(FailedItem::new(
                    &item.object_id,
                    format!(
                        "embedding dimension {} does not match collection dimension {dimensions}",
                        bad.len()
                    ),
                ));
                continue;
            }

            if tx
                .send(Embedded {
                    item,
                    vectors: item_vectors,
                })
                .await
                .is_err()
            {
                // Write stage stopped; nothing left to embed for.
                return;
            }
        }
    }
}

#[async_trait]
impl Actor for UpsertionActor {
    fn queue(&self) -> &'static str {
        "upsertion_queue"
    }

    /// Warm the plugin registry and probe the blue model's inference
    /// endpoints once the queue is live.
    async fn on_boot(&self) -> Result<()> {
        for name in self.ctx.plugins.names() {
            debug!(plugin = %name, "Plugin registered");
        }
        if let Ok(collection) = self.ctx.resolve_regular(None, CollectionNamespace::Primary) {
            let plugin = self.ctx.plugins.get(&collection.model.plugin_name)?;
            let ids = plugin.inference_model_ids(&collection.model);
            match self
                .ctx
                .inference
                .is_model_ready(&collection.model.plugin_name, &ids.items)
                .await
            {
                Ok(ready) => info!(model = %ids.items, ready, "Blue items model probed"),
                Err(e) => warn!(model = %ids.items, error = %e, "Blue items model probe failed"),
            }
        }
        Ok(())
    }

    async fn handle(&self, task: &Task, actx: &ActorContext) -> Result<()> {
        let payload: UpsertionPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| QuiverError::validation(format!("invalid upsertion payload: {e}")))?;
        if payload.items.is_empty() {
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
        let plugin = self.ctx.plugins.get(&collection.model.plugin_name)?;
        let model_ids = plugin.inference_model_ids(&collection.model);

        info!(task_id = %task.task_id, collection_id = %collection.collection_id,
            items = payload.items.len(), "Starting upsertion");

        let batch_size = self.ctx.config.upsertion.batch_size;
        let (tx, mut rx) = mpsc::channel::<Embedded>(self.ctx.config.upsertion.channel_capacity.max(1));
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel::<FailedItem>();

        let embed = tokio::spawn(embed_stage(
            Arc::clone(&self.ctx.inference),
            Arc::clone(&plugin),
            collection.model.plugin_name.clone(),
            model_ids.items,
            collection.model.dimensions,
            payload.items.clone(),
            batch_size,
            actx.cancellation.clone(),
            tx,
            fail_tx,
        ));

        let mut failures: Vec<FailedItem> = Vec::new();
        let mut written = 0usize;
        let mut batch: Vec<Embedded> = Vec::with_capacity(batch_size);
        let mut canceled = false;

        while let Some(embedded) = rx.recv().await {
            batch.push(embedded);
            if batch.len() >= batch_size {
                self.write_batch(&collection, &mut batch, &mut failures, &mut written)
                    .await?;
                // Cancellation checkpoint between batches; the batch just
                // written stays, the rest is dropped.
                if actx.checkpoint().is_err() {
                    canceled = true;
                    break;
                }
            }
        }
        if !canceled {
            self.write_batch(&collection, &mut batch, &mut failures, &mut written)
                .await?;
        }

        embed
            .await
            .map_err(|e| QuiverError::internal(format!("embed stage join: {e}")))?;
        while let Ok(failure) = fail_rx.try_recv() {
            failures.push(failure);
        }

        if !failures.is_empty() {
            self.ctx
                .tasks
                .append_failures(&task.task_id, &failures)
                .await?;
        }
        debug!(task_id = %task.task_id, written, failed = failures.len(), "Upsertion finished");

        if canceled {
            return Err(QuiverError::Canceled);
        }
        if written == 0 && !failures.is_empty() {
            return Err(QuiverError::internal("every item failed to upsert"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::config::QuiverConfig;
    use quiver_core::types::{
        AggregationType, EmbeddingModelInfo, HnswParams, MetricType, TaskKind, TaskStatus,
    };
    use serde_json::json;

    fn model(id: &str, dimensions: usize) -> EmbeddingModelInfo {
        EmbeddingModelInfo {
            embedding_model_id: id.to_owned(),
            plugin_name: "static_text".to_owned(),
            dimensions,
            metric_type: MetricType::Cosine,
            aggregation_type: AggregationType::Avg,
            hnsw: HnswParams::default(),
        }
    }

    async fn ctx_with_blue(dimension: usize) -> Arc<WorkerContext> {
        let mut config = QuiverConfig::default();
        config.upsertion.batch_size = 2;
        let ctx = WorkerContext::in_memory(config, dimension).await.unwrap();
        ctx.lifecycle.create_pair(&model("m1", 3)).await.unwrap();
        ctx.lifecycle.promote_to_blue("m1").await.unwrap();
        ctx
    }

    fn upsert_task(items: Vec<UpsertItem>) -> Task {
        let payload = UpsertionPayload {
            embedding_model_id: None,
            items,
            categories: false,
        };
        Task::new(
            TaskKind::Upsert,
            serde_json::to_value(payload).unwrap(),
            Some("t1".into()),
        )
    }

    fn item(id: &str) -> UpsertItem {
        UpsertItem {
            object_id: id.to_owned(),
            payload: Some(json!({"title": id})),
            item_info: None,
        }
    }

    async fn run(ctx: &Arc<WorkerContext>, task: &Task) -> Result<()> {
        let actor = UpsertionActor::new(Arc::clone(ctx));
        let stored = ctx.tasks.create(task.clone()).await.unwrap();
        if stored.status == TaskStatus::Pending {
            ctx.tasks
                .update_status(&stored.task_id, TaskStatus::Processing)
                .await
                .unwrap();
        }
        let actx = ActorContext {
            cancellation: CancellationToken::new(),
            attempt: 1,
        };
        actor.handle(&stored, &actx).await
    }

    #[tokio::test]
    async fn items_are_embedded_and_written() {
        let ctx = ctx_with_blue(3).await;
        let task = upsert_task(vec![item("o1"), item("o2"), item("o3")]);
        run(&ctx, &task).await.unwrap();

        let collection = ctx.cache.get_blue(quiver_core::types::CollectionKind::Regular).unwrap();
        let objects = ctx
            .vectors
            .find_by_ids(&collection, &["o1".into(), "o2".into(), "o3".into()])
            .await
            .unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[0].parts.len(), 1);
        assert_eq!(objects[0].parts[0].vector.len(), 3);
    }

    #[tokio::test]
    async fn upsertion_is_idempotent() {
        let ctx = ctx_with_blue(3).await;
        let task = upsert_task(vec![item("o1")]);
        run(&ctx, &task).await.unwrap();
        // Re-running the same task leaves exactly one object row behind.
        run(&ctx, &task).await.unwrap();

        let collection = ctx.cache.get_blue(quiver_core::types::CollectionKind::Regular).unwrap();
        let objects = ctx
            .vectors
            .find_by_ids(&collection, &["o1".into()])
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].parts.len(), 1);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_recorded_and_errors() {
        // Mock inference yields 4-dimensional vectors for a 3-dim collection.
        let ctx = ctx_with_blue(4).await;
        let task = upsert_task(vec![item("o1")]);
        let err = run(&ctx, &task).await.unwrap_err();
        assert!(matches!(err, QuiverError::Internal(_)));

        let stored = ctx.tasks.get("t1").await.unwrap();
        assert_eq!(stored.failed_items.len(), 1);
        assert!(stored.failed_items[0].reason.contains("dimension"));

        let collection = ctx.cache.get_blue(quiver_core::types::CollectionKind::Regular).unwrap();
        assert!(ctx
            .vectors
            .find_by_ids(&collection, &["o1".into()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn missing_blue_collection_is_reported() {
        let ctx = WorkerContext::in_memory(QuiverConfig::default(), 3)
            .await
            .unwrap();
        let task = upsert_task(vec![item("o1")]);
        let stored = ctx.tasks.create(task).await.unwrap();
        let actor = UpsertionActor::new(Arc::clone(&ctx));
        let actx = ActorContext {
            cancellation: CancellationToken::new(),
            attempt: 1,
        };
        let err = actor.handle(&stored, &actx).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
