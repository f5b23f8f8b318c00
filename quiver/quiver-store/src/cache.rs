//! In-memory projection of collection metadata.
//!
//! Reads are lock-free over an [`arc_swap`] snapshot; writes take a short
//! exclusive intent, perform the metadata write, and trigger a full reload.
//! The snapshot is the single place `work_state` gets derived from the blue
//! pointers, which is what makes a blue switch atomic for readers.

use arc_swap::ArcSwap;
use quiver_core::error::{QuiverError, Result};
use quiver_core::traits::{BluePair, CollectionMetadataStore};
use quiver_core::types::{CollectionInfo, CollectionKind, CollectionNamespace, WorkState};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct Snapshot {
    by_key: HashMap<(String, CollectionKind), CollectionInfo>,
    blues: HashMap<CollectionNamespace, BluePair>,
}

/// Process-local cache over the collection metadata store.
pub struct CollectionCache {
    store: Arc<dyn CollectionMetadataStore>,
    snapshot: ArcSwap<Snapshot>,
    write_intent: tokio::sync::Mutex<()>,
}

impl CollectionCache {
    /// Build the cache and perform the initial load.
    pub async fn new(store: Arc<dyn CollectionMetadataStore>) -> Result<Self> {
        let cache = Self {
            store,
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            write_intent: tokio::sync::Mutex::new(()),
        };
        cache.reload().await?;
        Ok(cache)
    }

    /// Reload the snapshot from the metadata store.
    pub async fn reload(&self) -> Result<()> {
        let (collections, blues) = self.store.load_all().await?;

        let mut by_key = HashMap::with_capacity(collections.len());
        for mut info in collections {
            let blue = blues.get(&info.kind.namespace()).is_some_and(|pair| {
                if info.kind.is_query() {
                    pair.query_id == info.collection_id
                } else {
                    pair.regular_id == info.collection_id
                }
            });
            info.work_state = if blue { WorkState::Blue } else { WorkState::Green };
            by_key.insert((info.collection_id.clone(), info.kind), info);
        }

        self.snapshot.store(Arc::new(Snapshot { by_key, blues }));
        debug!("Collection cache reloaded");
        Ok(())
    }

    /// Every collection of a kind.
    pub fn list(&self, kind: CollectionKind) -> Vec<CollectionInfo> {
        let snapshot = self.snapshot.load();
        let mut collections: Vec<_> = snapshot
            .by_key
            .values()
            .filter(|info| info.kind == kind)
            .cloned()
            .collect();
        collections.sort_by(|a, b| a.collection_id.cmp(&b.collection_id));
        collections
    }

    /// Look up a collection across all kinds, preferring the regular kinds.
    pub fn get(&self, collection_id: &str) -> Option<CollectionInfo> {
        let snapshot = self.snapshot.load();
        [
            CollectionKind::Regular,
            CollectionKind::Query,
            CollectionKind::CategoriesRegular,
            CollectionKind::CategoriesQuery,
        ]
        .iter()
        .find_map(|&kind| snapshot.by_key.get(&(collection_id.to_owned(), kind)).cloned())
    }

    /// Look up one collection by id and kind.
    pub fn get_with_kind(&self, collection_id: &str, kind: CollectionKind) -> Option<CollectionInfo> {
        self.snapshot
            .load()
            .by_key
            .get(&(collection_id.to_owned(), kind))
            .cloned()
    }

    /// The unique blue collection of a kind, if any.
    pub fn get_blue(&self, kind: CollectionKind) -> Option<CollectionInfo> {
        let snapshot = self.snapshot.load();
        let pair = snapshot.blues.get(&kind.namespace())?;
        let id = if kind.is_query() {
            &pair.query_id
        } else {
            &pair.regular_id
        };
        snapshot.by_key.get(&(id.clone(), kind)).cloned()
    }

    /// Atomically flip a namespace's blue pointer to the given pair. Both
    /// collections must exist.
    pub async fn set_blue(
        &self,
        namespace: CollectionNamespace,
        regular_id: &str,
        query_id: &str,
    ) -> Result<()> {
        let _intent = self.write_intent.lock().await;

        let (regular_kind, query_kind) = namespace.kinds();
        let snapshot = self.snapshot.load();
        if !snapshot
            .by_key
            .contains_key(&(regular_id.to_owned(), regular_kind))
        {
            return Err(QuiverError::not_found("collection", regular_id));
        }
        if !snapshot
            .by_key
            .contains_key(&(query_id.to_owned(), query_kind))
        {
            return Err(QuiverError::not_found("collection", query_id));
        }
        drop(snapshot);

        self.store.set_blue(namespace, regular_id, query_id).await?;
        self.reload().await
    }

    /// Mirror an insert into the metadata store. A duplicate key is logged
    /// and absorbed.
    pub async fn add(&self, info: &CollectionInfo) -> Result<()> {
        let _intent = self.write_intent.lock().await;
        match self.store.insert(info).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                warn!(
                    collection_id = %info.collection_id,
                    kind = info.kind.as_str(),
                    "Duplicate collection add ignored"
                );
            }
            Err(e) => return Err(e),
        }
        self.reload().await
    }

    /// Mirror an update into the metadata store.
    pub async fn update(&self, info: &CollectionInfo) -> Result<()> {
        let _intent = self.write_intent.lock().await;
        self.store.update(info).await?;
        self.reload().await
    }

    /// Mirror a delete into the metadata store.
    pub async fn delete(&self, collection_id: &str, kind: CollectionKind) -> Result<()> {
        let _intent = self.write_intent.lock().await;
        self.store.delete(collection_id, kind).await?;
        self.reload().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMetadataStore;
    use quiver_core::types::{
        AggregationType, EmbeddingModelInfo, HnswParams, MetricType,
    };

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

    async fn cache_with_pair(id: &str) -> CollectionCache {
        let store = Arc::new(InMemoryMetadataStore::new());
        let cache = CollectionCache::new(store).await.unwrap();
        cache
            .add(&CollectionInfo::new(model(id), CollectionKind::Regular))
            .await
            .unwrap();
        cache
            .add(&CollectionInfo::new(model(id), CollectionKind::Query))
            .await
            .unwrap();
        cache
    }

    #[tokio::test]
    async fn blue_pair_flips_together() {
        let cache = cache_with_pair("m1").await;
        assert!(cache.get_blue(CollectionKind::Regular).is_none());
        assert!(cache.get_blue(CollectionKind::Query).is_none());

        cache
            .set_blue(CollectionNamespace::Primary, "m1", "m1")
            .await
            .unwrap();

        let regular = cache.get_blue(CollectionKind::Regular).unwrap();
        let query = cache.get_blue(CollectionKind::Query).unwrap();
        assert_eq!(regular.collection_id, "m1");
        assert_eq!(query.collection_id, "m1");
        assert!(regular.is_blue());
        assert!(query.is_blue());
    }

    #[tokio::test]
    async fn set_blue_requires_both_collections() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let cache = CollectionCache::new(store).await.unwrap();
        cache
            .add(&CollectionInfo::new(model("m1"), CollectionKind::Regular))
            .await
            .unwrap();

        let err = cache
            .set_blue(CollectionNamespace::Primary, "m1", "m1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn promotion_demotes_previous_blue() {
        let cache = cache_with_pair("m1").await;
        cache
            .add(&CollectionInfo::new(model("m2"), CollectionKind::Regular))
            .await
            .unwrap();
        cache
            .add(&CollectionInfo::new(model("m2"), CollectionKind::Query))
            .await
            .unwrap();

        cache
            .set_blue(CollectionNamespace::Primary, "m1", "m1")
            .await
            .unwrap();
        cache
            .set_blue(CollectionNamespace::Primary, "m2", "m2")
            .await
            .unwrap();

        assert_eq!(
            cache.get_blue(CollectionKind::Regular).unwrap().collection_id,
            "m2"
        );
        let m1 = cache
            .get_with_kind("m1", CollectionKind::Regular)
            .unwrap();
        assert_eq!(m1.work_state, WorkState::Green);
        // Exactly one blue per kind.
        let blues: Vec<_> = cache
            .list(CollectionKind::Regular)
            .into_iter()
            .filter(CollectionInfo::is_blue)
            .collect();
        assert_eq!(blues.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_add_is_absorbed() {
        let cache = cache_with_pair("m1").await;
        let result = cache
            .add(&CollectionInfo::new(model("m1"), CollectionKind::Regular))
            .await;
        assert!(result.is_ok());
    }
}
