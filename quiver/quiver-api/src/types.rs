//! API request and response bodies.

use quiver_core::error::{QuiverError, Result};
use quiver_core::filter::PayloadFilter;
use quiver_core::types::{
    AggregationType, EmbeddingModelInfo, HnswParams, MetricType, Object, SearchHit, SortBy,
};
use serde::{Deserialize, Serialize};

/// Body of `POST /collections/create`. Model parameters may be omitted when
/// the model is already known from an existing collection.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCollectionRequest {
    pub embedding_model_id: String,
    #[serde(default)]
    pub plugin_name: Option<String>,
    #[serde(default)]
    pub dimensions: Option<usize>,
    #[serde(default)]
    pub metric_type: Option<MetricType>,
    #[serde(default)]
    pub aggregation_type: Option<AggregationType>,
    #[serde(default)]
    pub hnsw: Option<HnswParams>,
}

impl CreateCollectionRequest {
    /// Build the model record, requiring plugin and dimensions for a model
    /// the control plane has never seen.
    pub fn into_model(self, known: Option<EmbeddingModelInfo>) -> Result<EmbeddingModelInfo> {
        if let Some(known) = known {
            return Ok(known);
        }
        let plugin_name = self.plugin_name.ok_or_else(|| {
            QuiverError::validation("plugin_name is required for a new embedding model")
        })?;
        let dimensions = self.dimensions.ok_or_else(|| {
            QuiverError::validation("dimensions is required for a new embedding model")
        })?;
        Ok(EmbeddingModelInfo {
            embedding_model_id: self.embedding_model_id,
            plugin_name,
            dimensions,
            metric_type: self.metric_type.unwrap_or(MetricType::Cosine),
            aggregation_type: self.aggregation_type.unwrap_or(AggregationType::Avg),
            hnsw: self.hnsw.unwrap_or_default(),
        })
    }
}

/// Body of the single-model collection operations.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelIdRequest {
    pub embedding_model_id: String,
}

/// Query string of `GET /collections/get-info`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelIdQuery {
    pub embedding_model_id: String,
}

/// Body of `POST /collections/objects/insert`.
#[derive(Debug, Clone, Deserialize)]
pub struct InsertObjectsRequest {
    #[serde(default)]
    pub embedding_model_id: Option<String>,
    pub objects: Vec<Object>,
}

/// Body of `POST /collections/objects/upsert`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertObjectsRequest {
    #[serde(default)]
    pub embedding_model_id: Option<String>,
    pub objects: Vec<Object>,
    #[serde(default = "default_true")]
    pub shrink_parts: bool,
}

fn default_true() -> bool {
    true
}

/// Body of `POST /collections/objects/delete`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteObjectsRequest {
    #[serde(default)]
    pub embedding_model_id: Option<String>,
    pub object_ids: Vec<String>,
}

/// Response of `POST /collections/objects/delete`.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteObjectsResponse {
    pub deleted_ids: Vec<String>,
}

/// Body of `POST /collections/objects/find-by-ids`.
#[derive(Debug, Clone, Deserialize)]
pub struct FindByIdsRequest {
    #[serde(default)]
    pub embedding_model_id: Option<String>,
    pub object_ids: Vec<String>,
}

/// Body of `POST /collections/objects/find-similar`.
#[derive(Debug, Clone, Deserialize)]
pub struct FindSimilarRequest {
    #[serde(default)]
    pub embedding_model_id: Option<String>,
    #[serde(flatten)]
    pub query: quiver_core::types::SimilarityQuery,
}

/// Body of `POST /embeddings/similarity-search`.
#[derive(Debug, Clone, Deserialize)]
pub struct SimilaritySearchRequest {
    #[serde(default)]
    pub search_query: Option<String>,
    #[serde(default)]
    pub query_vector: Option<Vec<f32>>,
    #[serde(default)]
    pub filter: Option<PayloadFilter>,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub max_distance: Option<f32>,
    #[serde(default)]
    pub sort_by: Option<SortBy>,
    #[serde(default)]
    pub create_session: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_true")]
    pub similarity_first: bool,
}

/// One public search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultEntry {
    pub object_id: String,
    pub distance: f32,
    pub payload: serde_json::Value,
    pub meta: serde_json::Value,
}

impl From<SearchHit> for SearchResultEntry {
    fn from(hit: SearchHit) -> Self {
        Self {
            object_id: hit.object_id,
            distance: hit.distance,
            payload: hit.payload,
            meta: hit.storage_meta,
        }
    }
}

/// Response of the public search endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub search_results: Vec<SearchResultEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_offset: Option<usize>,
    pub meta_info: serde_json::Value,
}

/// Body of `POST /embeddings/payload-search`.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadSearchRequest {
    pub filter: PayloadFilter,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub sort_by: Option<SortBy>,
    #[serde(default)]
    pub create_session: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Body of `POST /embeddings/payload-count`.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadCountRequest {
    pub filter: PayloadFilter,
}

/// Response of `POST /embeddings/payload-count`.
#[derive(Debug, Clone, Serialize)]
pub struct PayloadCountResponse {
    pub count: u64,
}

/// Body of `POST /clickstream/session`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterSessionRequest {
    pub session_id: String,
    pub search_query: String,
    #[serde(default)]
    pub results: Vec<quiver_core::types::SessionResult>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_payload_search: bool,
}

/// Body of `POST /clickstream/session/events`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppendEventsRequest {
    pub session_id: String,
    pub events: Vec<quiver_core::types::SessionEvent>,
}

/// Body of `POST /clickstream/internal/session/use-for-improvement`.
#[derive(Debug, Clone, Deserialize)]
pub struct UseForImprovementRequest {
    pub session_id: String,
}

/// Query string of `GET /clickstream/internal/batch/sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSessionsQuery {
    pub batch_id: String,
    #[serde(default)]
    pub after_number: Option<i64>,
    #[serde(default = "default_sessions_limit")]
    pub limit: usize,
    #[serde(default)]
    pub events_limit: Option<usize>,
}

fn default_sessions_limit() -> usize {
    100
}

/// Body of `POST /clickstream/internal/batch/release`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseBatchRequest {
    pub release_id: String,
}

/// Query string of the task info/restart/cancel endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskIdQuery {
    pub task_id: String,
}

/// Query string of the task list endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskListQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_tasks_limit")]
    pub limit: usize,
    #[serde(default)]
    pub status: Option<quiver_core::types::TaskStatus>,
}

fn default_tasks_limit() -> usize {
    50
}
