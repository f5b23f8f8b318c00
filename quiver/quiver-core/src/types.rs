//! Domain types shared across the Quiver control plane.

use crate::error::{QuiverError, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single embedding vector.
pub type Vector = Vec<f32>;

static PLUGIN_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid plugin name regex"));

// ==============================================================================
// Embedding models
// ==============================================================================

/// Distance metric used by a collection's vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricType {
    Cosine,
    Dot,
    Euclid,
}

impl MetricType {
    /// Similarity between two vectors; higher means closer.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => {
                let dot = dot_product(a, b);
                let norm = l2_norm(a) * l2_norm(b);
                if norm == 0.0 { 0.0 } else { dot / norm }
            }
            Self::Dot => dot_product(a, b),
            Self::Euclid => -euclidean(a, b),
        }
    }

    /// Distance between two vectors; lower means closer.
    ///
    /// The definitions match the vector store's operators: cosine distance is
    /// `1 - cos`, dot distance is the negative inner product, and euclid is
    /// the L2 norm of the difference.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => 1.0 - self.similarity(a, b),
            Self::Dot => -dot_product(a, b),
            Self::Euclid => euclidean(a, b),
        }
    }
}

fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn l2_norm(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// How a multi-part object's per-part distances collapse into one distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregationType {
    Avg,
    Min,
}

impl AggregationType {
    /// Aggregate per-part distances into an object-level distance.
    pub fn aggregate(&self, distances: &[f32]) -> f32 {
        if distances.is_empty() {
            return f32::INFINITY;
        }
        match self {
            Self::Avg => distances.iter().sum::<f32>() / distances.len() as f32,
            Self::Min => distances.iter().cloned().fold(f32::INFINITY, f32::min),
        }
    }
}

/// HNSW index parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Number of edges per node
    pub m: u32,
    /// Number of neighbors considered during construction
    pub ef_construction: u32,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 100,
        }
    }
}

/// An embedding model as the control plane sees it: identity plus the
/// parameters every collection of that model shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModelInfo {
    pub embedding_model_id: String,
    pub plugin_name: String,
    pub dimensions: usize,
    pub metric_type: MetricType,
    pub aggregation_type: AggregationType,
    #[serde(default)]
    pub hnsw: HnswParams,
}

impl EmbeddingModelInfo {
    /// Validate identity and parameters before any collection is created.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_model_id.is_empty() {
            return Err(QuiverError::validation("embedding_model_id must not be empty"));
        }
        if !PLUGIN_NAME_RE.is_match(&self.plugin_name) {
            return Err(QuiverError::validation(format!(
                "plugin_name {:?} is not a valid identifier",
                self.plugin_name
            )));
        }
        if self.dimensions == 0 {
            return Err(QuiverError::validation("dimensions must be positive"));
        }
        Ok(())
    }
}

// ==============================================================================
// Collections
// ==============================================================================

/// Namespace a collection kind belongs to. Regular/Query collections and
/// their Categories twins have independent blue pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionNamespace {
    Primary,
    Categories,
}

impl CollectionNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Categories => "categories",
        }
    }

    /// The (regular, query) kind pair of this namespace.
    pub fn kinds(&self) -> (CollectionKind, CollectionKind) {
        match self {
            Self::Primary => (CollectionKind::Regular, CollectionKind::Query),
            Self::Categories => (
                CollectionKind::CategoriesRegular,
                CollectionKind::CategoriesQuery,
            ),
        }
    }
}

/// Kind of a vector collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionKind {
    Regular,
    Query,
    CategoriesRegular,
    CategoriesQuery,
}

impl CollectionKind {
    pub fn namespace(&self) -> CollectionNamespace {
        match self {
            Self::Regular | Self::Query => CollectionNamespace::Primary,
            Self::CategoriesRegular | Self::CategoriesQuery => CollectionNamespace::Categories,
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Self::Query | Self::CategoriesQuery)
    }

    /// The other half of this kind's blue/green pair.
    pub fn paired(&self) -> CollectionKind {
        match self {
            Self::Regular => Self::Query,
            Self::Query => Self::Regular,
            Self::CategoriesRegular => Self::CategoriesQuery,
            Self::CategoriesQuery => Self::CategoriesRegular,
        }
    }

    /// Stable suffix used in physical table names.
    pub fn table_suffix(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Query => "query",
            Self::CategoriesRegular => "cat_regular",
            Self::CategoriesQuery => "cat_query",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "REGULAR",
            Self::Query => "QUERY",
            Self::CategoriesRegular => "CATEGORIES_REGULAR",
            Self::CategoriesQuery => "CATEGORIES_QUERY",
        }
    }
}

/// Blue/green state of a collection. Blue serves live traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkState {
    Green,
    Blue,
}

/// Metadata record for a vector collection.
///
/// `work_state` is derived from the namespace blue pointer at load time; the
/// pointer flip is what makes blue promotion atomic for readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub collection_id: String,
    pub model: EmbeddingModelInfo,
    pub kind: CollectionKind,
    pub index_created: bool,
    pub work_state: WorkState,
    #[serde(default)]
    pub applied_optimizations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionInfo {
    /// Create a fresh green collection for a model.
    pub fn new(model: EmbeddingModelInfo, kind: CollectionKind) -> Self {
        let now = Utc::now();
        Self {
            collection_id: model.embedding_model_id.clone(),
            model,
            kind,
            index_created: false,
            work_state: WorkState::Green,
            applied_optimizations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_blue(&self) -> bool {
        self.work_state == WorkState::Blue
    }
}

// ==============================================================================
// Objects
// ==============================================================================

/// One embedding of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPart {
    pub part_id: String,
    pub vector: Vector,
    #[serde(default)]
    pub is_average: bool,
}

/// A logical item stored in a collection, composed of one or more vector
/// parts plus JSON payload and system metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub storage_meta: serde_json::Value,
    pub parts: Vec<ObjectPart>,
}

impl Object {
    pub fn new(object_id: impl Into<String>, parts: Vec<ObjectPart>) -> Self {
        Self {
            object_id: object_id.into(),
            original_id: None,
            user_id: None,
            session_id: None,
            payload: serde_json::Value::Null,
            storage_meta: serde_json::Value::Null,
            parts,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Identifier of the personalized copy of `original_id` for `user_id`.
    pub fn personalized_id(original_id: &str, user_id: &str) -> String {
        format!("{original_id}_{user_id}")
    }

    /// Whether this object is a personalized copy of another object.
    pub fn is_personalized(&self) -> bool {
        self.original_id.is_some() && self.user_id.is_some()
    }

    /// Validate that every part matches the collection's dimensionality.
    pub fn validate_dimensions(&self, dimensions: usize) -> Result<()> {
        if self.parts.is_empty() {
            return Err(QuiverError::validation(format!(
                "object {} has no parts",
                self.object_id
            )));
        }
        for part in &self.parts {
            if part.vector.len() != dimensions {
                return Err(QuiverError::validation(format!(
                    "object {} part {} has dimension {}, expected {}",
                    self.object_id,
                    part.part_id,
                    part.vector.len(),
                    dimensions
                )));
            }
        }
        Ok(())
    }
}

// ==============================================================================
// Search
// ==============================================================================

/// Sort direction for payload ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Payload field ordering for search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    #[serde(default = "SortBy::default_order")]
    pub order: SortOrder,
}

impl SortBy {
    fn default_order() -> SortOrder {
        SortOrder::Desc
    }
}

/// Parameters for an ANN similarity search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityQuery {
    pub vector: Vector,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_distance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<crate::filter::PayloadFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<SortBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub with_vectors: bool,
    #[serde(default = "SimilarityQuery::default_similarity_first")]
    pub similarity_first: bool,
}

impl SimilarityQuery {
    fn default_similarity_first() -> bool {
        true
    }

    pub fn new(vector: Vector, limit: usize) -> Self {
        Self {
            vector,
            limit,
            offset: 0,
            max_distance: None,
            filter: None,
            sort_by: None,
            user_id: None,
            with_vectors: false,
            similarity_first: true,
        }
    }

    pub fn with_filter(mut self, filter: crate::filter::PayloadFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_max_distance(mut self, max_distance: f32) -> Self {
        self.max_distance = Some(max_distance);
        self
    }

    pub fn with_sort_by(mut self, sort_by: SortBy, similarity_first: bool) -> Self {
        self.sort_by = Some(sort_by);
        self.similarity_first = similarity_first;
        self
    }

    pub fn with_vectors(mut self) -> Self {
        self.with_vectors = true;
        self
    }
}

/// One similarity search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub object_id: String,
    pub distance: f32,
    pub payload: serde_json::Value,
    pub storage_meta: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Populated only when the query asked for vectors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ObjectPart>,
}

// ==============================================================================
// Tasks
// ==============================================================================

/// Kind of a persisted asynchronous task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskKind {
    Upsert,
    Delete,
    Reindex,
    FineTune,
    Deploy,
    Undeploy,
    Improve,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "UPSERT",
            Self::Delete => "DELETE",
            Self::Reindex => "REINDEX",
            Self::FineTune => "FINE_TUNE",
            Self::Deploy => "DEPLOY",
            Self::Undeploy => "UNDEPLOY",
            Self::Improve => "IMPROVE",
        }
    }

    /// Named queue this kind is dispatched on.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::Upsert => "upsertion_queue",
            Self::Delete => "deletion_queue",
            Self::Reindex => "reindex_queue",
            Self::FineTune => "fine_tuning_queue",
            Self::Deploy => "deployment_queue",
            Self::Undeploy => "undeployment_queue",
            Self::Improve => "improvement_queue",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "UPSERT" => Ok(Self::Upsert),
            "DELETE" => Ok(Self::Delete),
            "REINDEX" => Ok(Self::Reindex),
            "FINE_TUNE" => Ok(Self::FineTune),
            "DEPLOY" => Ok(Self::Deploy),
            "UNDEPLOY" => Ok(Self::Undeploy),
            "IMPROVE" => Ok(Self::Improve),
            other => Err(QuiverError::validation(format!("unknown task kind: {other}"))),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Canceled,
    Error,
    Refused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Done => "DONE",
            Self::Canceled => "CANCELED",
            Self::Error => "ERROR",
            Self::Refused => "REFUSED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "DONE" => Ok(Self::Done),
            "CANCELED" => Ok(Self::Canceled),
            "ERROR" => Ok(Self::Error),
            "REFUSED" => Ok(Self::Refused),
            other => Err(QuiverError::validation(format!("unknown task status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Canceled | Self::Error | Self::Refused)
    }

    /// Whether the status machine permits `self -> to`.
    ///
    /// Pending -> Pending covers a restart re-send.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, to),
            (Pending, Processing)
                | (Pending, Canceled)
                | (Pending, Refused)
                | (Pending, Pending)
                | (Processing, Done)
                | (Processing, Error)
                | (Processing, Canceled)
        )
    }
}

/// One failed item of a task, recorded with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub object_id: String,
    pub reason: String,
}

impl FailedItem {
    pub fn new(object_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            reason: reason.into(),
        }
    }
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub failed_items: Vec<FailedItem>,
    #[serde(default)]
    pub failed_item_ids: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task. A caller-supplied `task_id` doubles as the
    /// idempotency key; otherwise a fresh UUID is generated.
    pub fn new(kind: TaskKind, payload: serde_json::Value, task_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind,
            status: TaskStatus::Pending,
            embedding_model_id: None,
            broker_id: None,
            parent_id: None,
            children: Vec::new(),
            failed_items: Vec::new(),
            failed_item_ids: Vec::new(),
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_model(mut self, embedding_model_id: impl Into<String>) -> Self {
        self.embedding_model_id = Some(embedding_model_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

// ==============================================================================
// Task payloads
// ==============================================================================

/// One item of an upsertion task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertItem {
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_info: Option<serde_json::Value>,
}

/// Payload of an UPSERT task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model_id: Option<String>,
    pub items: Vec<UpsertItem>,
    /// Target the categories namespace instead of the primary one.
    #[serde(default)]
    pub categories: bool,
}

/// Payload of a DELETE task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model_id: Option<String>,
    pub object_ids: Vec<String>,
    /// Target the categories namespace instead of the primary one.
    #[serde(default)]
    pub categories: bool,
}

/// One end of a reindex (source or destination).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexEnd {
    pub embedding_model_id: String,
}

/// Payload of a REINDEX task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexPayload {
    pub source: ReindexEnd,
    pub dest: ReindexEnd,
    #[serde(default)]
    pub deploy_as_blue: bool,
    #[serde(default)]
    pub wait_on_conflict: bool,
}

/// Payload of DEPLOY and UNDEPLOY tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPayload {
    pub embedding_model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
    /// Plugin to deploy under when the model has no collection yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
}

/// Payload of a FINE_TUNE task, handed to the external trainer's queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FineTunePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

/// Payload of an IMPROVE task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImprovePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub session_ids: Vec<String>,
}

// ==============================================================================
// Clickstream
// ==============================================================================

/// One search result of a registered session, with its rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub object_id: String,
    pub rank: f32,
}

/// One user interaction with a search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub event_id: String,
    pub object_id: String,
    #[serde(default = "SessionEvent::default_event_type")]
    pub event_type: String,
    pub created_at: DateTime<Utc>,
}

impl SessionEvent {
    fn default_event_type() -> String {
        "click".to_owned()
    }

    pub fn click(event_id: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            object_id: object_id.into(),
            event_type: Self::default_event_type(),
            created_at: Utc::now(),
        }
    }
}

/// Registration input for a search session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSession {
    pub session_id: String,
    pub search_query: String,
    #[serde(default)]
    pub results: Vec<SessionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_payload_search: bool,
}

/// A captured search session with its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickstreamSession {
    pub session_id: String,
    pub batch_id: String,
    pub session_number: i64,
    pub search_query: String,
    #[serde(default)]
    pub results: Vec<SessionResult>,
    #[serde(default)]
    pub is_irrelevant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub events: Vec<SessionEvent>,
    #[serde(default)]
    pub is_payload_search: bool,
    #[serde(default)]
    pub use_for_improvement: bool,
    pub created_at: DateTime<Utc>,
}

impl ClickstreamSession {
    /// Object ids referenced by at least one click event.
    pub fn clicked_ids(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.object_id.as_str()).collect()
    }
}

/// A clickstream batch. At most one active (unreleased) batch exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub released: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ==============================================================================
// Improvement
// ==============================================================================

/// Vectors of one result object entering the improvement step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementElement {
    pub object_id: String,
    pub vectors: Vec<Vector>,
    pub is_average: Vec<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Derived input of the vector adjuster: one session's query vector with its
/// clicked and non-clicked result vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementInput {
    pub session_id: String,
    pub query_vector: Vector,
    pub clicked: Vec<ImprovementElement>,
    pub non_clicked: Vec<ImprovementElement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_distances() {
        let a = [1.0_f32, 0.0, 0.0];
        let b = [0.0_f32, 1.0, 0.0];

        assert!((MetricType::Cosine.distance(&a, &a)).abs() < 1e-6);
        assert!((MetricType::Cosine.distance(&a, &b) - 1.0).abs() < 1e-6);
        assert!((MetricType::Dot.distance(&a, &a) + 1.0).abs() < 1e-6);
        assert!((MetricType::Euclid.distance(&a, &b) - 2.0_f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn aggregation() {
        assert_eq!(AggregationType::Avg.aggregate(&[1.0, 3.0]), 2.0);
        assert_eq!(AggregationType::Min.aggregate(&[1.0, 3.0]), 1.0);
        assert_eq!(AggregationType::Min.aggregate(&[]), f32::INFINITY);
    }

    #[test]
    fn model_validation() {
        let mut model = EmbeddingModelInfo {
            embedding_model_id: "m1".into(),
            plugin_name: "text_default".into(),
            dimensions: 3,
            metric_type: MetricType::Cosine,
            aggregation_type: AggregationType::Avg,
            hnsw: HnswParams::default(),
        };
        assert!(model.validate().is_ok());

        model.plugin_name = "1bad-name".into();
        assert!(model.validate().is_err());

        model.plugin_name = "ok_name".into();
        model.dimensions = 0;
        assert!(model.validate().is_err());
    }

    #[test]
    fn task_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition(Processing));
        assert!(Pending.can_transition(Canceled));
        assert!(Processing.can_transition(Done));
        assert!(Processing.can_transition(Error));
        assert!(Processing.can_transition(Canceled));
        assert!(!Pending.can_transition(Done));
        assert!(!Done.can_transition(Processing));
        assert!(!Canceled.can_transition(Processing));
        assert!(Refused.is_terminal());
    }

    #[test]
    fn kind_queue_round_trip() {
        for kind in [
            TaskKind::Upsert,
            TaskKind::Delete,
            TaskKind::Reindex,
            TaskKind::FineTune,
            TaskKind::Deploy,
            TaskKind::Undeploy,
            TaskKind::Improve,
        ] {
            assert_eq!(TaskKind::parse(kind.as_str()).unwrap(), kind);
            assert!(!kind.queue().is_empty());
        }
    }

    #[test]
    fn dimension_validation() {
        let object = Object::new(
            "a",
            vec![ObjectPart {
                part_id: "a_0".into(),
                vector: vec![1.0, 0.0, 0.0],
                is_average: false,
            }],
        );
        assert!(object.validate_dimensions(3).is_ok());
        assert!(object.validate_dimensions(4).is_err());

        let empty = Object::new("b", vec![]);
        assert!(empty.validate_dimensions(3).is_err());
    }

    #[test]
    fn personalized_id_format() {
        assert_eq!(Object::personalized_id("p", "u"), "p_u");
    }

    #[test]
    fn kind_serde_wire_form() {
        let json = serde_json::to_string(&CollectionKind::CategoriesRegular).unwrap();
        assert_eq!(json, "\"CATEGORIES_REGULAR\"");
        let status: TaskStatus = serde_json::from_str("\"PENDING\"").unwrap();
        assert_eq!(status, TaskStatus::Pending);
    }
}
