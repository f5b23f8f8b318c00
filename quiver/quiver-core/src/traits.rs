//! Core traits defining the seams between Quiver subsystems.

use crate::error::Result;
use crate::filter::PayloadFilter;
use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The blue pointer of one namespace: the collection pair serving traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluePair {
    pub regular_id: String,
    pub query_id: String,
}

/// Persistence of collection metadata and the per-namespace blue pointers.
#[async_trait]
pub trait CollectionMetadataStore: Send + Sync {
    /// Load every collection record plus the blue pointers. `work_state` on
    /// the returned records is not yet derived; the cache applies pointers.
    async fn load_all(
        &self,
    ) -> Result<(Vec<CollectionInfo>, HashMap<CollectionNamespace, BluePair>)>;

    /// Insert a collection record. Duplicate keys are reported as conflicts.
    async fn insert(&self, info: &CollectionInfo) -> Result<()>;

    /// Update a collection record in place.
    async fn update(&self, info: &CollectionInfo) -> Result<()>;

    /// Delete a collection record.
    async fn delete(&self, collection_id: &str, kind: CollectionKind) -> Result<()>;

    /// Atomically flip a namespace's blue pointer to the given pair.
    async fn set_blue(
        &self,
        namespace: CollectionNamespace,
        regular_id: &str,
        query_id: &str,
    ) -> Result<()>;
}

/// Scoped row locks over a set of objects. Dropping the scope releases the
/// locks; `release` does so explicitly and surfaces errors.
#[async_trait]
pub trait LockScope: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

/// The vector store driver: per-collection object/part tables with ANN
/// search, payload filtering, and index management.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the physical tables of a collection. Idempotent.
    async fn create_collection(&self, collection: &CollectionInfo) -> Result<()>;

    /// Drop the physical tables of a collection.
    async fn drop_collection(&self, collection: &CollectionInfo) -> Result<()>;

    /// Insert objects. A duplicate object id counts as success for that
    /// object; a dimension mismatch rejects the whole call.
    async fn insert(&self, collection: &CollectionInfo, objects: &[Object]) -> Result<()>;

    /// Insert-or-replace objects. With `shrink_parts` every pre-existing part
    /// is removed first; otherwise parts merge by `part_id`.
    async fn upsert(
        &self,
        collection: &CollectionInfo,
        objects: &[Object],
        shrink_parts: bool,
    ) -> Result<()>;

    /// Delete objects, cascading to parts. Returns the ids actually deleted.
    async fn delete(&self, collection: &CollectionInfo, object_ids: &[String])
    -> Result<Vec<String>>;

    async fn find_by_ids(&self, collection: &CollectionInfo, ids: &[String])
    -> Result<Vec<Object>>;

    async fn find_by_original_ids(
        &self,
        collection: &CollectionInfo,
        original_ids: &[String],
    ) -> Result<Vec<Object>>;

    /// ANN search with payload filtering, personalization shadowing and
    /// payload ordering.
    async fn find_similar(
        &self,
        collection: &CollectionInfo,
        query: &SimilarityQuery,
    ) -> Result<Vec<SearchHit>>;

    /// Payload-only search; hit distances are zero.
    async fn find_by_payload_filter(
        &self,
        collection: &CollectionInfo,
        filter: &PayloadFilter,
        limit: usize,
        offset: usize,
        sort_by: Option<&SortBy>,
    ) -> Result<Vec<SearchHit>>;

    async fn count_by_payload_filter(
        &self,
        collection: &CollectionInfo,
        filter: &PayloadFilter,
    ) -> Result<u64>;

    /// Build the collection's HNSW index. Idempotent.
    async fn create_index(&self, collection: &CollectionInfo) -> Result<()>;

    /// Apply one named post-hoc optimization. Idempotent per name.
    async fn apply_optimization(&self, collection: &CollectionInfo, name: &str) -> Result<()>;

    /// Page over object ids in stable ascending order; `after` is exclusive.
    async fn list_object_ids(
        &self,
        collection: &CollectionInfo,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Acquire row locks spanning the given objects.
    async fn lock_objects(
        &self,
        collection: &CollectionInfo,
        ids: &[String],
    ) -> Result<Box<dyn LockScope>>;
}

/// Persistence and state machine of asynchronous tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Idempotent create: an existing task with the same id is returned
    /// unchanged.
    async fn create(&self, task: Task) -> Result<Task>;

    async fn get(&self, task_id: &str) -> Result<Task>;

    /// Paginated scan ordered by `created_at` descending.
    async fn list(
        &self,
        kind: TaskKind,
        status: Option<TaskStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Task>>;

    /// Atomic compare-set following the task status machine.
    async fn update_status(&self, task_id: &str, new_status: TaskStatus) -> Result<Task>;

    /// Record the broker id assigned at a queue send.
    async fn set_broker(&self, task_id: &str, broker_id: &str) -> Result<()>;

    async fn append_failures(&self, task_id: &str, items: &[FailedItem]) -> Result<()>;

    async fn append_failed_ids(&self, task_id: &str, ids: &[String]) -> Result<()>;

    async fn link_child(&self, parent_id: &str, child_id: &str) -> Result<()>;

    /// Reset a task to Pending, clearing failure lists. Allowed from
    /// Pending, Error and Canceled only.
    async fn restart(&self, task_id: &str) -> Result<Task>;
}

/// Persistence of search sessions, their events and release batches.
#[async_trait]
pub trait ClickstreamStore: Send + Sync {
    /// Insert a session into the active batch, opening one lazily. Session
    /// numbers are dense and strictly increasing within a batch.
    async fn register_session(&self, session: RegisterSession) -> Result<ClickstreamSession>;

    async fn get_session(&self, session_id: &str) -> Result<ClickstreamSession>;

    /// Append events, deduplicated by `event_id`. Rejected once the batch is
    /// released.
    async fn append_events(&self, session_id: &str, events: &[SessionEvent]) -> Result<()>;

    /// Flag a session for improvement. Payload-search sessions are refused.
    async fn mark_for_improvement(&self, session_id: &str) -> Result<()>;

    /// Page over a batch's sessions by session number (`after_number`
    /// exclusive), capping events per session at `events_limit`.
    async fn get_batch_sessions(
        &self,
        batch_id: &str,
        after_number: Option<i64>,
        limit: usize,
        events_limit: Option<usize>,
    ) -> Result<Vec<ClickstreamSession>>;

    /// Finalize the active batch. Idempotent on `release_id`.
    async fn release_batch(&self, release_id: &str) -> Result<Batch>;

    /// Released sessions flagged for improvement and not yet consumed.
    async fn improvement_candidates(&self, limit: usize) -> Result<Vec<ClickstreamSession>>;

    /// Mark sessions as consumed by the improvement pipeline.
    async fn mark_improved(&self, session_ids: &[String]) -> Result<()>;
}

/// Remote evaluator on the inference server.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn is_model_ready(&self, plugin_name: &str, model_id: &str) -> Result<bool>;

    async fn forward_query(
        &self,
        plugin_name: &str,
        model_id: &str,
        query: &str,
    ) -> Result<Vector>;

    /// One vector per input, in order.
    async fn forward_items(
        &self,
        plugin_name: &str,
        model_id: &str,
        items: &[serde_json::Value],
    ) -> Result<Vec<Vector>>;
}

/// Black-box vector adjustment: move clicked vectors toward the query and
/// non-clicked vectors away, under the collection's metric.
pub trait VectorAdjuster: Send + Sync {
    fn adjust(&self, inputs: Vec<ImprovementInput>, metric: MetricType) -> Vec<ImprovementInput>;
}
