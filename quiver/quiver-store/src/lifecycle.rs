//! Collection lifecycle manager.
//!
//! Creates, indexes, promotes and deletes the Regular/Query collection pair
//! of one embedding model. The Categories kinds get an independent manager
//! over the same stores with the categories namespace.

use quiver_core::error::{QuiverError, Result};
use quiver_core::traits::VectorStore;
use quiver_core::types::{
    CollectionInfo, CollectionKind, CollectionNamespace, EmbeddingModelInfo,
};
use std::sync::Arc;
use tracing::info;

use crate::cache::CollectionCache;
use crate::vector::OPTIMIZATIONS;

/// Lifecycle operations for one namespace's collection pairs.
pub struct CollectionLifecycle {
    cache: Arc<CollectionCache>,
    vectors: Arc<dyn VectorStore>,
    namespace: CollectionNamespace,
}

impl CollectionLifecycle {
    pub fn new(
        cache: Arc<CollectionCache>,
        vectors: Arc<dyn VectorStore>,
        namespace: CollectionNamespace,
    ) -> Self {
        Self {
            cache,
            vectors,
            namespace,
        }
    }

    pub fn namespace(&self) -> CollectionNamespace {
        self.namespace
    }

    pub fn cache(&self) -> &Arc<CollectionCache> {
        &self.cache
    }

    fn kinds(&self) -> [CollectionKind; 2] {
        let (regular, query) = self.namespace.kinds();
        [regular, query]
    }

    /// Create the Regular + Query pair of a model. Existing collections are
    /// returned unchanged.
    pub async fn create_pair(
        &self,
        model: &EmbeddingModelInfo,
    ) -> Result<Vec<CollectionInfo>> {
        model.validate()?;

        let mut pair = Vec::with_capacity(2);
        for kind in self.kinds() {
            match self.cache.get_with_kind(&model.embedding_model_id, kind) {
                Some(existing) => pair.push(existing),
                None => {
                    let info = CollectionInfo::new(model.clone(), kind);
                    self.vectors.create_collection(&info).await?;
                    self.cache.add(&info).await?;
                    info!(collection_id = %info.collection_id, kind = kind.as_str(),
                        "Created collection");
                    pair.push(
                        self.cache
                            .get_with_kind(&model.embedding_model_id, kind)
                            .ok_or_else(|| {
                                QuiverError::internal("collection missing after create")
                            })?,
                    );
                }
            }
        }
        Ok(pair)
    }

    /// Build the HNSW index on both collections of a model.
    pub async fn create_index(&self, embedding_model_id: &str) -> Result<()> {
        for kind in self.kinds() {
            let mut info = self
                .cache
                .get_with_kind(embedding_model_id, kind)
                .ok_or_else(|| QuiverError::not_found("collection", embedding_model_id))?;

            self.vectors.create_index(&info).await?;
            if !info.index_created {
                info.index_created = true;
                self.cache.update(&info).await?;
            }
        }
        Ok(())
    }

    /// Promote a model's pair to blue. The previous blue pair is demoted by
    /// the same pointer flip and stays readable until deleted.
    pub async fn promote_to_blue(&self, embedding_model_id: &str) -> Result<()> {
        for kind in self.kinds() {
            if self.cache.get_with_kind(embedding_model_id, kind).is_none() {
                return Err(QuiverError::not_found("collection", embedding_model_id));
            }
        }
        info!(embedding_model_id, namespace = self.namespace.as_str(), "Promoting to blue");
        self.cache
            .set_blue(self.namespace, embedding_model_id, embedding_model_id)
            .await
    }

    /// Delete a model's pair. Refused while either collection is blue.
    pub async fn delete_pair(&self, embedding_model_id: &str) -> Result<()> {
        let mut pair = Vec::with_capacity(2);
        for kind in self.kinds() {
            let info = self
                .cache
                .get_with_kind(embedding_model_id, kind)
                .ok_or_else(|| QuiverError::not_found("collection", embedding_model_id))?;
            if info.is_blue() {
                return Err(QuiverError::conflict(format!(
                    "collection {embedding_model_id} is blue and cannot be deleted"
                )));
            }
            pair.push(info);
        }

        for info in pair {
            self.vectors.drop_collection(&info).await?;
            self.cache.delete(&info.collection_id, info.kind).await?;
            info!(collection_id = %info.collection_id, kind = info.kind.as_str(),
                "Deleted collection");
        }
        Ok(())
    }

    /// Apply every known post-hoc optimization not yet recorded on the
    /// model's collections.
    pub async fn apply_optimizations(&self, embedding_model_id: &str) -> Result<()> {
        for kind in self.kinds() {
            let mut info = self
                .cache
                .get_with_kind(embedding_model_id, kind)
                .ok_or_else(|| QuiverError::not_found("collection", embedding_model_id))?;

            let mut applied = false;
            for &name in OPTIMIZATIONS {
                if info.applied_optimizations.iter().any(|o| o == name) {
                    continue;
                }
                self.vectors.apply_optimization(&info, name).await?;
                info.applied_optimizations.push(name.to_owned());
                applied = true;
            }
            if applied {
                self.cache.update(&info).await?;
            }
        }
        Ok(())
    }

    /// The blue collection of the namespace's regular kind, if any.
    pub fn blue_regular(&self) -> Option<CollectionInfo> {
        let (regular, _) = self.namespace.kinds();
        self.cache.get_blue(regular)
    }

    /// The blue collection of the namespace's query kind, if any.
    pub fn blue_query(&self) -> Option<CollectionInfo> {
        let (_, query) = self.namespace.kinds();
        self.cache.get_blue(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryMetadataStore, InMemoryVectorStore};
    use quiver_core::types::{AggregationType, HnswParams, MetricType};

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

    async fn lifecycle() -> CollectionLifecycle {
        let cache = Arc::new(
            CollectionCache::new(Arc::new(InMemoryMetadataStore::new()))
                .await
                .unwrap(),
        );
        CollectionLifecycle::new(
            cache,
            Arc::new(InMemoryVectorStore::new()),
            CollectionNamespace::Primary,
        )
    }

    #[tokio::test]
    async fn create_pair_is_idempotent() {
        let lifecycle = lifecycle().await;
        let first = lifecycle.create_pair(&model("m1")).await.unwrap();
        assert_eq!(first.len(), 2);

        let second = lifecycle.create_pair(&model("m1")).await.unwrap();
        assert_eq!(first[0].created_at, second[0].created_at);
    }

    #[tokio::test]
    async fn blue_delete_is_refused_until_switch() {
        let lifecycle = lifecycle().await;
        lifecycle.create_pair(&model("m1")).await.unwrap();
        lifecycle.create_pair(&model("m2")).await.unwrap();
        lifecycle.promote_to_blue("m1").await.unwrap();

        let err = lifecycle.delete_pair("m1").await.unwrap_err();
        assert!(err.is_conflict());

        lifecycle.promote_to_blue("m2").await.unwrap();
        lifecycle.delete_pair("m1").await.unwrap();

        assert!(lifecycle.cache().get("m1").is_none());
        assert_eq!(lifecycle.blue_regular().unwrap().collection_id, "m2");
    }

    #[tokio::test]
    async fn index_creation_marks_collections() {
        let lifecycle = lifecycle().await;
        lifecycle.create_pair(&model("m1")).await.unwrap();
        lifecycle.create_index("m1").await.unwrap();

        let info = lifecycle
            .cache()
            .get_with_kind("m1", CollectionKind::Regular)
            .unwrap();
        assert!(info.index_created);
    }

    #[tokio::test]
    async fn optimizations_recorded_once() {
        let lifecycle = lifecycle().await;
        lifecycle.create_pair(&model("m1")).await.unwrap();
        lifecycle.apply_optimizations("m1").await.unwrap();
        lifecycle.apply_optimizations("m1").await.unwrap();

        let info = lifecycle
            .cache()
            .get_with_kind("m1", CollectionKind::Regular)
            .unwrap();
        assert_eq!(info.applied_optimizations.len(), OPTIMIZATIONS.len());
    }

    #[tokio::test]
    async fn promote_requires_pair() {
        let lifecycle = lifecycle().await;
        let err = lifecycle.promote_to_blue("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
