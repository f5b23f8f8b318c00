//! In-memory implementations of the metadata and vector stores.
//!
//! These back unit tests and local development; they implement the same
//! semantics as the Postgres drivers, including personalization shadowing,
//! aggregation, filter evaluation and per-object locking.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use quiver_core::error::{QuiverError, Result};
use quiver_core::filter::PayloadFilter;
use quiver_core::traits::{BluePair, CollectionMetadataStore, LockScope, VectorStore};
use quiver_core::types::{
    CollectionInfo, CollectionKind, CollectionNamespace, Object, SearchHit, SimilarityQuery,
    SortBy, SortOrder,
};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use crate::vector::OPTIMIZATIONS;

// ==============================================================================
// Metadata store
// ==============================================================================

#[derive(Default)]
struct MetadataState {
    collections: HashMap<(String, CollectionKind), CollectionInfo>,
    blues: HashMap<CollectionNamespace, BluePair>,
}

/// In-memory collection metadata store.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    state: Mutex<MetadataState>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CollectionMetadataStore for InMemoryMetadataStore {
    async fn load_all(
        &self,
    ) -> Result<(Vec<CollectionInfo>, HashMap<CollectionNamespace, BluePair>)> {
        let state = self.state.lock();
        Ok((
            state.collections.values().cloned().collect(),
            state.blues.clone(),
        ))
    }

    async fn insert(&self, info: &CollectionInfo) -> Result<()> {
        let mut state = self.state.lock();
        let key = (info.collection_id.clone(), info.kind);
        if state.collections.contains_key(&key) {
            return Err(QuiverError::conflict(format!(
                "collection {} ({}) already exists",
                info.collection_id,
                info.kind.as_str()
            )));
        }
        state.collections.insert(key, info.clone());
        Ok(())
    }

    async fn update(&self, info: &CollectionInfo) -> Result<()> {
        let mut state = self.state.lock();
        let key = (info.collection_id.clone(), info.kind);
        match state.collections.get_mut(&key) {
            Some(existing) => {
                *existing = info.clone();
                Ok(())
            }
            None => Err(QuiverError::not_found("collection", &info.collection_id)),
        }
    }

    async fn delete(&self, collection_id: &str, kind: CollectionKind) -> Result<()> {
        let mut state = self.state.lock();
        state
            .collections
            .remove(&(collection_id.to_owned(), kind))
            .map(|_| ())
            .ok_or_else(|| QuiverError::not_found("collection", collection_id))
    }

    async fn set_blue(
        &self,
        namespace: CollectionNamespace,
        regular_id: &str,
        query_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.blues.insert(
            namespace,
            BluePair {
                regular_id: regular_id.to_owned(),
                query_id: query_id.to_owned(),
            },
        );
        Ok(())
    }
}

// ==============================================================================
// Vector store
// ==============================================================================

struct CollectionData {
    objects: RwLock<BTreeMap<String, Object>>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CollectionData {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: RwLock::new(BTreeMap::new()),
            locks: DashMap::new(),
        })
    }

    fn object_lock(&self, object_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(object_id.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Acquire per-object locks in stable order.
    async fn lock_ids(&self, ids: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in &sorted {
            guards.push(self.object_lock(id).lock_owned().await);
        }
        guards
    }
}

struct MemoryLockScope {
    _guards: Vec<OwnedMutexGuard<()>>,
}

#[async_trait]
impl LockScope for MemoryLockScope {
    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// In-memory vector store.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: DashMap<String, Arc<CollectionData>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(collection: &CollectionInfo) -> String {
        format!(
            "{}:{}",
            collection.collection_id,
            collection.kind.table_suffix()
        )
    }

    fn data(&self, collection: &CollectionInfo) -> Result<Arc<CollectionData>> {
        self.collections
            .get(&Self::key(collection))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| QuiverError::not_found("collection", &collection.collection_id))
    }

    fn validate_batch(collection: &CollectionInfo, objects: &[Object]) -> Result<()> {
        for object in objects {
            object.validate_dimensions(collection.model.dimensions)?;
        }
        Ok(())
    }
}

/// Whether an object is visible to a search with the given user scope.
fn visible(objects: &BTreeMap<String, Object>, object: &Object, user_id: Option<&str>) -> bool {
    match user_id {
        None => object.user_id.is_none(),
        Some(user) => {
            if object.user_id.as_deref() == Some(user) {
                return true;
            }
            if object.user_id.is_some() {
                return false;
            }
            // Originals are shadowed by this user's personalized copy.
            !objects.values().any(|candidate| {
                candidate.original_id.as_deref() == Some(object.object_id.as_str())
                    && candidate.user_id.as_deref() == Some(user)
            })
        }
    }
}

/// Ascending jsonb-style type rank: null < string < number < bool < array < object.
fn json_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::String(_) => 1,
        Value::Number(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn cmp_json(a: &Value, b: &Value) -> Ordering {
    let rank = json_rank(a).cmp(&json_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Missing sort keys order last in either direction, like `NULLS LAST`.
fn cmp_sort_key(a: Option<&Value>, b: Option<&Value>, order: SortOrder) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => match order {
            SortOrder::Asc => cmp_json(x, y),
            SortOrder::Desc => cmp_json(y, x),
        },
    }
}

fn to_hit(object: &Object, distance: f32, with_vectors: bool) -> SearchHit {
    SearchHit {
        object_id: object.object_id.clone(),
        distance,
        payload: object.payload.clone(),
        storage_meta: object.storage_meta.clone(),
        original_id: object.original_id.clone(),
        user_id: object.user_id.clone(),
        parts: if with_vectors {
            object.parts.clone()
        } else {
            Vec::new()
        },
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn create_collection(&self, collection: &CollectionInfo) -> Result<()> {
        self.collections
            .entry(Self::key(collection))
            .or_insert_with(CollectionData::new);
        Ok(())
    }

    async fn drop_collection(&self, collection: &CollectionInfo) -> Result<()> {
        self.collections.remove(&Self::key(collection));
        Ok(())
    }

    async fn insert(&self, collection: &CollectionInfo, objects: &[Object]) -> Result<()> {
        Self::validate_batch(collection, objects)?;
        let data = self.data(collection)?;
        let ids: Vec<String> = objects.iter().map(|o| o.object_id.clone()).collect();
        let _guards = data.lock_ids(&ids).await;

        let mut store = data.objects.write();
        for object in objects {
            // Duplicate ids count as success and leave the stored row alone.
            store
                .entry(object.object_id.clone())
                .or_insert_with(|| object.clone());
        }
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &CollectionInfo,
        objects: &[Object],
        shrink_parts: bool,
    ) -> Result<()> {
        Self::validate_batch(collection, objects)?;
        let data = self.data(collection)?;
        let ids: Vec<String> = objects.iter().map(|o| o.object_id.clone()).collect();
        let _guards = data.lock_ids(&ids).await;

        let mut store = data.objects.write();
        for object in objects {
            match store.get_mut(&object.object_id) {
                Some(existing) if !shrink_parts => {
                    let mut merged = object.clone();
                    let mut parts = existing.parts.clone();
                    for part in &merged.parts {
                        match parts.iter_mut().find(|p| p.part_id == part.part_id) {
                            Some(slot) => *slot = part.clone(),
                            None => parts.push(part.clone()),
                        }
                    }
                    parts.sort_by(|a, b| a.part_id.cmp(&b.part_id));
                    merged.parts = parts;
                    *existing = merged;
                }
                _ => {
                    let mut replacement = object.clone();
                    replacement.parts.sort_by(|a, b| a.part_id.cmp(&b.part_id));
                    store.insert(object.object_id.clone(), replacement);
                }
            }
        }
        Ok(())
    }

    async fn delete(
        &self,
        collection: &CollectionInfo,
        object_ids: &[String],
    ) -> Result<Vec<String>> {
        let data = self.data(collection)?;
        let _guards = data.lock_ids(object_ids).await;

        let mut store = data.objects.write();
        let mut deleted = Vec::new();
        for id in object_ids {
            if store.remove(id).is_some() {
                deleted.push(id.clone());
            }
        }
        Ok(deleted)
    }

    async fn find_by_ids(
        &self,
        collection: &CollectionInfo,
        ids: &[String],
    ) -> Result<Vec<Object>> {
        let data = self.data(collection)?;
        let store = data.objects.read();
        Ok(ids.iter().filter_map(|id| store.get(id).cloned()).collect())
    }

    async fn find_by_original_ids(
        &self,
        collection: &CollectionInfo,
        original_ids: &[String],
    ) -> Result<Vec<Object>> {
        let data = self.data(collection)?;
        let store = data.objects.read();
        Ok(store
            .values()
            .filter(|object| {
                object
                    .original_id
                    .as_ref()
                    .is_some_and(|original| original_ids.contains(original))
            })
            .cloned()
            .collect())
    }

    async fn find_similar(
        &self,
        collection: &CollectionInfo,
        query: &SimilarityQuery,
    ) -> Result<Vec<SearchHit>> {
        if query.vector.len() != collection.model.dimensions {
            return Err(QuiverError::validation(format!(
                "query vector has dimension {}, expected {}",
                query.vector.len(),
                collection.model.dimensions
            )));
        }
        if let Some(filter) = &query.filter {
            filter.validate()?;
        }

        let metric = collection.model.metric_type;
        let aggregation = collection.model.aggregation_type;
        let data = self.data(collection)?;
        let store = data.objects.read();

        let mut scored: Vec<(f32, &Object)> = store
            .values()
            .filter(|object| visible(&store, object, query.user_id.as_deref()))
            .filter(|object| {
                query
                    .filter
                    .as_ref()
                    .is_none_or(|filter| filter.matches(object))
            })
            .map(|object| {
                let distances: Vec<f32> = object
                    .parts
                    .iter()
                    .map(|part| metric.distance(&part.vector, &query.vector))
                    .collect();
                (aggregation.aggregate(&distances), object)
            })
            .filter(|(distance, _)| query.max_distance.is_none_or(|max| *distance <= max))
            .collect();

        match (&query.sort_by, query.similarity_first) {
            (Some(sort_by), false) => {
                scored.sort_by(|(da, a), (db, b)| {
                    cmp_sort_key(
                        a.payload.get(&sort_by.field),
                        b.payload.get(&sort_by.field),
                        sort_by.order,
                    )
                    .then(da.partial_cmp(db).unwrap_or(Ordering::Equal))
                    .then(a.object_id.cmp(&b.object_id))
                });
            }
            _ => {
                scored.sort_by(|(da, a), (db, b)| {
                    da.partial_cmp(db)
                        .unwrap_or(Ordering::Equal)
                        .then(a.object_id.cmp(&b.object_id))
                });
            }
        }

        Ok(scored
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|(distance, object)| to_hit(object, distance, query.with_vectors))
            .collect())
    }

    async fn find_by_payload_filter(
        &self,
        collection: &CollectionInfo,
        filter: &PayloadFilter,
        limit: usize,
        offset: usize,
        sort_by: Option<&SortBy>,
    ) -> Result<Vec<SearchHit>> {
        filter.validate()?;
        let data = self.data(collection)?;
        let store = data.objects.read();

        let mut matching: Vec<&Object> =
            store.values().filter(|object| filter.matches(object)).collect();

        match sort_by {
            Some(sort_by) => matching.sort_by(|a, b| {
                cmp_sort_key(
                    a.payload.get(&sort_by.field),
                    b.payload.get(&sort_by.field),
                    sort_by.order,
                )
                .then(a.object_id.cmp(&b.object_id))
            }),
            None => matching.sort_by(|a, b| a.object_id.cmp(&b.object_id)),
        }

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|object| to_hit(object, 0.0, false))
            .collect())
    }

    async fn count_by_payload_filter(
        &self,
        collection: &CollectionInfo,
        filter: &PayloadFilter,
    ) -> Result<u64> {
        filter.validate()?;
        let data = self.data(collection)?;
        let store = data.objects.read();
        Ok(store.values().filter(|object| filter.matches(object)).count() as u64)
    }

    async fn create_index(&self, collection: &CollectionInfo) -> Result<()> {
        self.data(collection)?;
        Ok(())
    }

    async fn apply_optimization(&self, collection: &CollectionInfo, name: &str) -> Result<()> {
        self.data(collection)?;
        if !OPTIMIZATIONS.contains(&name) {
            return Err(QuiverError::validation(format!(
                "unknown optimization: {name}"
            )));
        }
        Ok(())
    }

    async fn list_object_ids(
        &self,
        collection: &CollectionInfo,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let data = self.data(collection)?;
        let store = data.objects.read();
        Ok(store
            .keys()
            .filter(|id| after.is_none_or(|a| id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn lock_objects(
        &self,
        collection: &CollectionInfo,
        ids: &[String],
    ) -> Result<Box<dyn LockScope>> {
        let data = self.data(collection)?;
        let guards = data.lock_ids(ids).await;
        Ok(Box::new(MemoryLockScope { _guards: guards }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::types::{
        AggregationType, EmbeddingModelInfo, HnswParams, MetricType, ObjectPart,
    };
    use serde_json::json;

    fn collection(metric: MetricType) -> CollectionInfo {
        CollectionInfo::new(
            EmbeddingModelInfo {
                embedding_model_id: "m1".into(),
                plugin_name: "static_text".into(),
                dimensions: 3,
                metric_type: metric,
                aggregation_type: AggregationType::Avg,
                hnsw: HnswParams::default(),
            },
            CollectionKind::Regular,
        )
    }

    fn object(id: &str, vector: Vec<f32>, payload: Value) -> Object {
        Object::new(
            id,
            vec![ObjectPart {
                part_id: format!("{id}_0"),
                vector,
                is_average: false,
            }],
        )
        .with_payload(payload)
    }

    async fn seeded_store() -> (InMemoryVectorStore, CollectionInfo) {
        let store = InMemoryVectorStore::new();
        let collection = collection(MetricType::Cosine);
        store.create_collection(&collection).await.unwrap();
        store
            .insert(
                &collection,
                &[
                    object("a", vec![1.0, 0.0, 0.0], json!({"category": "x"})),
                    object("b", vec![0.0, 1.0, 0.0], json!({"category": "y"})),
                ],
            )
            .await
            .unwrap();
        (store, collection)
    }

    #[tokio::test]
    async fn ingest_and_search() {
        let (store, collection) = seeded_store().await;

        let hits = store
            .find_similar(&collection, &SimilarityQuery::new(vec![1.0, 0.0, 0.0], 2))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].object_id, "a");
        assert!(hits[0].distance.abs() < 1e-6);
        assert_eq!(hits[1].object_id, "b");
        assert!((hits[1].distance - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn search_with_term_filter() {
        let (store, collection) = seeded_store().await;

        let query = SimilarityQuery::new(vec![1.0, 0.0, 0.0], 2)
            .with_filter(PayloadFilter::term("category", "y"));
        let hits = store.find_similar(&collection, &query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].object_id, "b");
    }

    #[tokio::test]
    async fn insert_is_at_least_once() {
        let (store, collection) = seeded_store().await;
        // Re-inserting an existing id succeeds without clobbering it.
        store
            .insert(
                &collection,
                &[object("a", vec![0.5, 0.5, 0.0], json!({"category": "z"}))],
            )
            .await
            .unwrap();

        let objects = store
            .find_by_ids(&collection, &["a".into()])
            .await
            .unwrap();
        assert_eq!(objects[0].payload, json!({"category": "x"}));
    }

    #[tokio::test]
    async fn dimension_mismatch_rejected() {
        let (store, collection) = seeded_store().await;
        let err = store
            .insert(&collection, &[object("c", vec![1.0, 0.0, 0.0, 0.0], json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, QuiverError::Validation(_)));
        assert!(store
            .find_by_ids(&collection, &["c".into()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn upsert_shrink_is_idempotent() {
        let (store, collection) = seeded_store().await;
        let updated = object("a", vec![0.0, 0.0, 1.0], json!({"category": "x2"}));

        store.upsert(&collection, &[updated.clone()], true).await.unwrap();
        store.upsert(&collection, &[updated.clone()], true).await.unwrap();

        let objects = store
            .find_by_ids(&collection, &["a".into()])
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].parts.len(), 1);
        assert_eq!(objects[0].payload, json!({"category": "x2"}));
    }

    #[tokio::test]
    async fn upsert_merge_keeps_other_parts() {
        let (store, collection) = seeded_store().await;
        let mut extra = object("a", vec![0.0, 0.0, 1.0], json!({"category": "x"}));
        extra.parts[0].part_id = "a_1".into();

        store.upsert(&collection, &[extra], false).await.unwrap();
        let objects = store
            .find_by_ids(&collection, &["a".into()])
            .await
            .unwrap();
        assert_eq!(objects[0].parts.len(), 2);
    }

    #[tokio::test]
    async fn personalized_copy_shadows_original() {
        let (store, collection) = seeded_store().await;

        let mut copy = object("a_u", vec![0.9, 0.1, 0.0], json!({"category": "x"}));
        copy.original_id = Some("a".into());
        copy.user_id = Some("u".into());
        store.upsert(&collection, &[copy], true).await.unwrap();

        // Anonymous search never sees the copy.
        let hits = store
            .find_similar(&collection, &SimilarityQuery::new(vec![1.0, 0.0, 0.0], 10))
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.object_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        // The user sees the copy in place of the original, never both.
        let hits = store
            .find_similar(
                &collection,
                &SimilarityQuery::new(vec![1.0, 0.0, 0.0], 10).with_user("u"),
            )
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.object_id.as_str()).collect();
        assert_eq!(ids, vec!["a_u", "b"]);
    }

    #[tokio::test]
    async fn payload_sort_beats_distance_when_not_similarity_first() {
        let (store, collection) = seeded_store().await;

        let query = SimilarityQuery::new(vec![1.0, 0.0, 0.0], 10).with_sort_by(
            SortBy {
                field: "category".into(),
                order: SortOrder::Desc,
            },
            false,
        );
        let hits = store.find_similar(&collection, &query).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.object_id.as_str()).collect();
        // "y" > "x" descending, despite "a" being closer.
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn max_distance_prefilters() {
        let (store, collection) = seeded_store().await;
        let query = SimilarityQuery::new(vec![1.0, 0.0, 0.0], 10).with_max_distance(0.5);
        let hits = store.find_similar(&collection, &query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].object_id, "a");
    }

    #[tokio::test]
    async fn payload_search_and_count() {
        let (store, collection) = seeded_store().await;
        let filter = PayloadFilter::term("category", "y");

        let hits = store
            .find_by_payload_filter(&collection, &filter, 10, 0, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].object_id, "b");

        assert_eq!(
            store.count_by_payload_filter(&collection, &filter).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn round_trip_find_by_ids() {
        let (store, collection) = seeded_store().await;
        let objects = store
            .find_by_ids(&collection, &["a".into(), "b".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].object_id, "a");
        assert_eq!(objects[0].parts.len(), 1);
    }

    #[tokio::test]
    async fn list_object_ids_pages_in_order() {
        let (store, collection) = seeded_store().await;
        let first = store
            .list_object_ids(&collection, None, 1)
            .await
            .unwrap();
        assert_eq!(first, vec!["a"]);
        let rest = store
            .list_object_ids(&collection, Some("a"), 10)
            .await
            .unwrap();
        assert_eq!(rest, vec!["b"]);
    }

    #[tokio::test]
    async fn lock_scope_serializes_writers() {
        let (store, collection) = seeded_store().await;
        let scope = store
            .lock_objects(&collection, &["a".into()])
            .await
            .unwrap();

        let store = Arc::new(store);
        let collection2 = collection.clone();
        let store2 = Arc::clone(&store);
        let writer = tokio::spawn(async move {
            store2
                .upsert(
                    &collection2,
                    &[object("a", vec![0.0, 1.0, 0.0], json!({}))],
                    true,
                )
                .await
        });

        // The writer cannot proceed while the scope holds the lock.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        scope.release().await.unwrap();
        writer.await.unwrap().unwrap();
    }
}
