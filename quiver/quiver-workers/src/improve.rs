//! Clickstream improvement pipeline.
//!
//! Released sessions flagged for improvement are grouped, turned into
//! adjuster inputs (query vector plus clicked/non-clicked result vectors),
//! adjusted, and written back as personalized per-user copies. Originals are
//! never mutated; groups commit under object locks to keep memory flat and
//! writers serialized.

use async_trait::async_trait;
use quiver_core::error::{QuiverError, Result};
use quiver_core::traits::VectorAdjuster;
use quiver_core::types::{
    ClickstreamSession, CollectionInfo, CollectionKind, ImprovePayload, ImprovementElement,
    ImprovementInput, Object, ObjectPart, Task,
};
use quiver_tasks::{Actor, ActorContext};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::adjust::IterativeAdjuster;
use crate::context::WorkerContext;

/// One session prepared for adjustment, with the fetched objects it needs for
/// write-back.
struct PreparedSession {
    input: ImprovementInput,
    user_id: String,
    /// Fetched objects keyed by their object id (copies and originals).
    objects: HashMap<String, Object>,
    /// Original result ids, used for group locking.
    original_ids: Vec<String>,
}

/// Queue actor handling IMPROVE tasks.
pub struct ImproveActor {
    ctx: Arc<WorkerContext>,
}

impl ImproveActor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    fn eligible(session: &ClickstreamSession) -> bool {
        !session.is_payload_search
            && !session.is_irrelevant
            && !session.events.is_empty()
            && session.user_id.is_some()
    }

    async fn load_sessions(&self, payload: &ImprovePayload) -> Result<Vec<ClickstreamSession>> {
        if !payload.session_ids.is_empty() {
            let mut sessions = Vec::with_capacity(payload.session_ids.len());
            for id in &payload.session_ids {
                sessions.push(self.ctx.clickstream.get_session(id).await?);
            }
            return Ok(sessions);
        }
        if let Some(batch_id) = &payload.batch_id {
            let sessions = self
                .ctx
                .clickstream
                .get_batch_sessions(batch_id, None, 10_000, None)
                .await?;
            return Ok(sessions
                .into_iter()
                .filter(|s| s.use_for_improvement)
                .collect());
        }
        self.ctx
            .clickstream
            .improvement_candidates(self.ctx.config.improvement.group_size * 8)
            .await
    }

    /// Build the adjuster input of one session, fetching the query vector
    /// from the blue query collection and result vectors from the blue
    /// regular collection. Personalized copies take their originals' place.
    async fn prepare(
        &self,
        session: &ClickstreamSession,
        regular: &CollectionInfo,
        query_collection: &CollectionInfo,
    ) -> Result<Option<PreparedSession>> {
        let user_id = match &session.user_id {
            Some(user_id) => user_id.clone(),
            None => return Ok(None),
        };

        let query_objects = self
            .ctx
            .vectors
            .find_by_ids(query_collection, &[session.session_id.clone()])
            .await?;
        let Some(query_object) = query_objects.into_iter().next() else {
            debug!(session_id = %session.session_id, "No query vector stored, skipping");
            return Ok(None);
        };
        let Some(query_vector) = query_object.parts.first().map(|p| p.vector.clone()) else {
            return Ok(None);
        };

        let original_ids: Vec<String> = session
            .results
            .iter()
            .map(|r| r.object_id.clone())
            .collect();
        let mut lookup_ids = original_ids.clone();
        lookup_ids.extend(
            original_ids
                .iter()
                .map(|id| Object::personalized_id(id, &user_id)),
        );

        let fetched = self.ctx.vectors.find_by_ids(regular, &lookup_ids).await?;
        let objects: HashMap<String, Object> = fetched
            .into_iter()
            .map(|object| (object.object_id.clone(), object))
            .collect();

        let clicked_ids: HashSet<&str> = session
            .events
            .iter()
            .map(|event| event.object_id.as_str())
            .collect();

        let mut clicked = Vec::new();
        let mut non_clicked = Vec::new();
        for original_id in &original_ids {
            let copy_id = Object::personalized_id(original_id, &user_id);
            let Some(object) = objects.get(&copy_id).or_else(|| objects.get(original_id)) else {
                debug!(object_id = %original_id, "Result object missing, skipping");
                continue;
            };
            let element = ImprovementElement {
                object_id: object.object_id.clone(),
                vectors: object.parts.iter().map(|p| p.vector.clone()).collect(),
                is_average: object.parts.iter().map(|p| p.is_average).collect(),
                user_id: Some(user_id.clone()),
            };
            if clicked_ids.contains(original_id.as_str()) {
                clicked.push(element);
            } else {
                non_clicked.push(element);
            }
        }
        if clicked.is_empty() {
            return Ok(None);
        }

        Ok(Some(PreparedSession {
            input: ImprovementInput {
                session_id: session.session_id.clone(),
                query_vector,
                clicked,
                non_clicked,
            },
            user_id,
            objects,
            original_ids,
        }))
    }

    /// Write one adjusted element back as a personalized copy (or update the
    /// copy in place when the element already is one).
    fn personalized_object(
        element: &ImprovementElement,
        objects: &HashMap<String, Object>,
        user_id: &str,
    ) -> Option<Object> {
        let base = objects.get(&element.object_id)?;

        if base.is_personalized() {
            let mut updated = base.clone();
            for (part, vector) in updated.parts.iter_mut().zip(element.vectors.iter()) {
                part.vector = vector.clone();
            }
            return Some(updated);
        }

        let copy_id = Object::personalized_id(&base.object_id, user_id);
        let parts: Vec<ObjectPart> = element
            .vectors
            .iter()
            .zip(element.is_average.iter())
            .enumerate()
            .map(|(i, (vector, &is_average))| ObjectPart {
                part_id: format!("{copy_id}_{i}"),
                vector: vector.clone(),
                is_average,
            })
            .collect();

        let mut copy = Object::new(copy_id, parts).with_payload(base.payload.clone());
        copy.storage_meta = base.storage_meta.clone();
        copy.original_id = Some(base.object_id.clone());
        copy.user_id = Some(user_id.to_owned());
        Some(copy)
    }

    async fn commit_group(
        &self,
        regular: &CollectionInfo,
        prepared: Vec<PreparedSession>,
        adjuster: &dyn VectorAdjuster,
    ) -> Result<Vec<String>> {
        let mut lock_ids: Vec<String> = prepared
            .iter()
            .flat_map(|p| p.original_ids.iter().cloned())
            .collect();
        lock_ids.sort();
        lock_ids.dedup();
        let scope = self.ctx.vectors.lock_objects(regular, &lock_ids).await?;

        let inputs: Vec<ImprovementInput> = prepared.iter().map(|p| p.input.clone()).collect();
        let adjusted = adjuster.adjust(inputs, regular.model.metric_type);

        let mut session_ids = Vec::with_capacity(prepared.len());
        for (prepared, adjusted) in prepared.iter().zip(adjusted.iter()) {
            let mut writes = Vec::new();
            for element in adjusted.clicked.iter().chain(adjusted.non_clicked.iter()) {
                if let Some(object) =
                    Self::personalized_object(element, &prepared.objects, &prepared.user_id)
                {
                    writes.push(object);
                }
            }
            if !writes.is_empty() {
                self.ctx.vectors.upsert(regular, &writes, true).await?;
            }
            session_ids.push(prepared.input.session_id.clone());
        }

        scope.release().await?;
        Ok(session_ids)
    }
}

#[async_trait]
impl Actor for ImproveActor {
    fn queue(&self) -> &'static str {
        "improvement_queue"
    }

    async fn handle(&self, task: &Task, actx: &ActorContext) -> Result<()> {
        let payload: ImprovePayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| QuiverError::validation(format!("invalid improve payload: {e}")))?;

        let sessions = self.load_sessions(&payload).await?;
        let sessions: Vec<ClickstreamSession> =
            sessions.into_iter().filter(Self::eligible).collect();
        if sessions.is_empty() {
            return Ok(());
        }

        let regular = self
            .ctx
            .cache
            .get_blue(CollectionKind::Regular)
            .ok_or_else(|| QuiverError::not_found("blue collection", "REGULAR"))?;
        let query_collection = self
            .ctx
            .cache
            .get_blue(CollectionKind::Query)
            .ok_or_else(|| QuiverError::not_found("blue collection", "QUERY"))?;

        let plugin = self.ctx.plugins.get(&regular.model.plugin_name)?;
        let default_adjuster: Arc<dyn VectorAdjuster> = Arc::new(IterativeAdjuster::from_config(
            &self.ctx.config.improvement,
        ));
        let adjuster = plugin.adjuster().unwrap_or(default_adjuster);

        info!(task_id = %task.task_id, sessions = sessions.len(), "Starting improvement");

        let group_size = self.ctx.config.improvement.group_size.max(1);
        for group in sessions.chunks(group_size) {
            actx.checkpoint()?;

            let mut prepared = Vec::new();
            for session in group {
                if let Some(p) = self.prepare(session, &regular, &query_collection).await? {
                    prepared.push(p);
                }
            }
            // Sessions that produced no input are still consumed.
            let mut consumed: Vec<String> =
                group.iter().map(|s| s.session_id.clone()).collect();

            if !prepared.is_empty() {
                let committed = self.commit_group(&regular, prepared, adjuster.as_ref()).await?;
                debug!(committed = committed.len(), "Improvement group committed");
            }
            consumed.sort();
            consumed.dedup();
            self.ctx.clickstream.mark_improved(&consumed).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::config::QuiverConfig;
    use quiver_core::types::{
        AggregationType, EmbeddingModelInfo, HnswParams, MetricType, RegisterSession,
        SessionEvent, SessionResult, SimilarityQuery, TaskKind,
    };
    use serde_json::json;
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

    fn object(id: &str, vector: Vec<f32>) -> Object {
        Object::new(
            id,
            vec![ObjectPart {
                part_id: format!("{id}_0"),
                vector,
                is_average: false,
            }],
        )
        .with_payload(json!({"title": id}))
    }

    async fn seeded_ctx() -> Arc<WorkerContext> {
        let ctx = WorkerContext::in_memory(QuiverConfig::default(), 3)
            .await
            .unwrap();
        ctx.lifecycle.create_pair(&model("m1")).await.unwrap();
        ctx.lifecycle.promote_to_blue("m1").await.unwrap();

        let regular = ctx.cache.get_blue(CollectionKind::Regular).unwrap();
        ctx.vectors
            .insert(
                &regular,
                &[
                    object("p", vec![0.6, 0.8, 0.0]),
                    object("n", vec![0.5, -0.5, 0.7]),
                ],
            )
            .await
            .unwrap();

        // The query vector of session s1, stored under the session id.
        let query_collection = ctx.cache.get_blue(CollectionKind::Query).unwrap();
        let mut query_object = object("s1", vec![1.0, 0.0, 0.0]);
        query_object.session_id = Some("s1".into());
        ctx.vectors
            .insert(&query_collection, &[query_object])
            .await
            .unwrap();
        ctx
    }

    async fn register_clicked_session(ctx: &Arc<WorkerContext>) {
        ctx.clickstream
            .register_session(RegisterSession {
                session_id: "s1".into(),
                search_query: "query".into(),
                results: vec![
                    SessionResult {
                        object_id: "p".into(),
                        rank: 0.0,
                    },
                    SessionResult {
                        object_id: "n".into(),
                        rank: 1.0,
                    },
                ],
                user_id: Some("u".into()),
                is_payload_search: false,
            })
            .await
            .unwrap();
        ctx.clickstream
            .append_events("s1", &[SessionEvent::click("e1", "p")])
            .await
            .unwrap();
        ctx.clickstream.mark_for_improvement("s1").await.unwrap();
        ctx.clickstream.release_batch("r1").await.unwrap();
    }

    async fn run_improvement(ctx: &Arc<WorkerContext>) {
        let task = ctx
            .tasks
            .create(Task::new(
                TaskKind::Improve,
                serde_json::to_value(ImprovePayload::default()).unwrap(),
                None,
            ))
            .await
            .unwrap();
        let actor = ImproveActor::new(Arc::clone(ctx));
        let actx = ActorContext {
            cancellation: CancellationToken::new(),
            attempt: 1,
        };
        actor.handle(&task, &actx).await.unwrap();
    }

    #[tokio::test]
    async fn improvement_personalizes_clicked_and_non_clicked() {
        let ctx = seeded_ctx().await;
        register_clicked_session(&ctx).await;

        let regular = ctx.cache.get_blue(CollectionKind::Regular).unwrap();
        let query = vec![1.0, 0.0, 0.0];

        let before = ctx
            .vectors
            .find_similar(&regular, &SimilarityQuery::new(query.clone(), 10).with_user("u"))
            .await
            .unwrap();
        let d_p = before.iter().find(|h| h.object_id == "p").unwrap().distance;
        let d_n = before.iter().find(|h| h.object_id == "n").unwrap().distance;

        run_improvement(&ctx).await;

        // A personalized copy of the clicked object exists.
        let copies = ctx
            .vectors
            .find_by_original_ids(&regular, &["p".into()])
            .await
            .unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].object_id, "p_u");
        assert_eq!(copies[0].user_id.as_deref(), Some("u"));

        // Personalized search: clicked copy moved toward the query,
        // non-clicked copy moved away.
        let after = ctx
            .vectors
            .find_similar(&regular, &SimilarityQuery::new(query.clone(), 10).with_user("u"))
            .await
            .unwrap();
        let d_p_after = after
            .iter()
            .find(|h| h.object_id == "p_u")
            .unwrap()
            .distance;
        let d_n_after = after
            .iter()
            .find(|h| h.object_id == "n_u")
            .unwrap()
            .distance;
        assert!(d_p_after <= d_p);
        assert!(d_n_after >= d_n);

        // Originals are untouched.
        let originals = ctx
            .vectors
            .find_by_ids(&regular, &["p".into(), "n".into()])
            .await
            .unwrap();
        assert_eq!(originals[1].parts[0].vector, vec![0.6, 0.8, 0.0]);

        // Anonymous search still sees only originals.
        let anonymous = ctx
            .vectors
            .find_similar(&regular, &SimilarityQuery::new(query, 10))
            .await
            .unwrap();
        let ids: Vec<&str> = anonymous.iter().map(|h| h.object_id.as_str()).collect();
        assert!(ids.contains(&"p"));
        assert!(!ids.contains(&"p_u"));
    }

    #[tokio::test]
    async fn second_run_updates_copies_in_place() {
        let ctx = seeded_ctx().await;
        register_clicked_session(&ctx).await;
        run_improvement(&ctx).await;

        let regular = ctx.cache.get_blue(CollectionKind::Regular).unwrap();
        let first = ctx
            .vectors
            .find_by_ids(&regular, &["p_u".into()])
            .await
            .unwrap()[0]
            .clone();

        // Re-register the session in a new batch and improve again.
        ctx.clickstream
            .register_session(RegisterSession {
                session_id: "s2".into(),
                search_query: "query".into(),
                results: vec![SessionResult {
                    object_id: "p".into(),
                    rank: 0.0,
                }],
                user_id: Some("u".into()),
                is_payload_search: false,
            })
            .await
            .unwrap();
        let query_collection = ctx.cache.get_blue(CollectionKind::Query).unwrap();
        let mut query_object = object("s2", vec![1.0, 0.0, 0.0]);
        query_object.session_id = Some("s2".into());
        ctx.vectors
            .insert(&query_collection, &[query_object])
            .await
            .unwrap();
        ctx.clickstream
            .append_events("s2", &[SessionEvent::click("e2", "p")])
            .await
            .unwrap();
        ctx.clickstream.mark_for_improvement("s2").await.unwrap();
        ctx.clickstream.release_batch("r2").await.unwrap();

        run_improvement(&ctx).await;

        let copies = ctx
            .vectors
            .find_by_original_ids(&regular, &["p".into()])
            .await
            .unwrap();
        assert_eq!(copies.len(), 1, "copy is updated in place, not duplicated");
        assert_ne!(copies[0].parts[0].vector, first.parts[0].vector);
    }

    #[tokio::test]
    async fn clickless_sessions_are_dropped() {
        let ctx = seeded_ctx().await;
        ctx.clickstream
            .register_session(RegisterSession {
                session_id: "s1".into(),
                search_query: "query".into(),
                results: vec![SessionResult {
                    object_id: "p".into(),
                    rank: 0.0,
                }],
                user_id: Some("u".into()),
                is_payload_search: false,
            })
            .await
            .unwrap();
        ctx.clickstream.mark_for_improvement("s1").await.unwrap();
        ctx.clickstream.release_batch("r1").await.unwrap();

        run_improvement(&ctx).await;

        let regular = ctx.cache.get_blue(CollectionKind::Regular).unwrap();
        assert!(ctx
            .vectors
            .find_by_original_ids(&regular, &["p".into()])
            .await
            .unwrap()
            .is_empty());
    }
}
