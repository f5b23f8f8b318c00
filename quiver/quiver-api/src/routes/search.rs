//! Public search endpoints: similarity search with optional session capture,
//! payload search and payload count.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use quiver_core::error::QuiverError;
use quiver_core::types::{
    CollectionKind, Object, ObjectPart, RegisterSession, SessionResult, SimilarityQuery,
};
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::types::{
    PayloadCountRequest, PayloadCountResponse, PayloadSearchRequest, SearchResponse,
    SearchResultEntry, SimilaritySearchRequest,
};
use crate::ApiContext;

/// Public embedding search routes.
pub fn search_routes(api: ApiContext) -> Router {
    Router::new()
        .route("/embeddings/similarity-search", post(similarity_search))
        .route("/embeddings/payload-search", post(payload_search))
        .route("/embeddings/payload-count", post(payload_count))
        .with_state(api)
}

async fn similarity_search(
    State(api): State<ApiContext>,
    Json(request): Json<SimilaritySearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    let regular = api
        .ctx
        .cache
        .get_blue(CollectionKind::Regular)
        .ok_or_else(|| QuiverError::not_found("blue collection", "REGULAR"))?;

    let vector = match (&request.query_vector, &request.search_query) {
        (Some(vector), _) => vector.clone(),
        (None, Some(text)) => {
            let plugin = api.ctx.plugins.get(&regular.model.plugin_name)?;
            let ids = plugin.inference_model_ids(&regular.model);
            api.ctx
                .inference
                .forward_query(&regular.model.plugin_name, &ids.query, text)
                .await?
        }
        (None, None) => {
            return Err(QuiverError::validation(
                "either search_query or query_vector is required",
            )
            .into());
        }
    };

    let mut query = SimilarityQuery::new(vector.clone(), request.limit);
    query.offset = request.offset;
    query.max_distance = request.max_distance;
    query.filter = request.filter.clone();
    query.user_id = request.user_id.clone();
    query.similarity_first = request.similarity_first;
    if let Some(sort_by) = request.sort_by.clone() {
        query.sort_by = Some(sort_by);
    }

    let hits = api.ctx.vectors.find_similar(&regular, &query).await?;

    let session_id = if request.create_session {
        Some(
            capture_session(&api, &request, &vector, &hits)
                .await?,
        )
    } else {
        None
    };

    let next_page_offset = if hits.len() == request.limit {
        Some(request.offset + hits.len())
    } else {
        None
    };

    Ok(Json(SearchResponse {
        session_id,
        search_results: hits.into_iter().map(SearchResultEntry::from).collect(),
        next_page_offset,
        meta_info: serde_json::Value::Null,
    }))
}

/// Register the search as a clickstream session and stash its query vector in
/// the blue query collection for the improvement pipeline.
async fn capture_session(
    api: &ApiContext,
    request: &SimilaritySearchRequest,
    vector: &[f32],
    hits: &[quiver_core::types::SearchHit],
) -> Result<String, QuiverError> {
    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let results = hits
        .iter()
        .map(|hit| SessionResult {
            object_id: hit.object_id.clone(),
            rank: hit.distance,
        })
        .collect();
    api.ctx
        .clickstream
        .register_session(RegisterSession {
            session_id: session_id.clone(),
            search_query: request.search_query.clone().unwrap_or_default(),
            results,
            user_id: request.user_id.clone(),
            is_payload_search: false,
        })
        .await?;

    if let Some(query_collection) = api.ctx.cache.get_blue(CollectionKind::Query) {
        let mut query_object = Object::new(
            session_id.clone(),
            vec![ObjectPart {
                part_id: format!("{session_id}_0"),
                vector: vector.to_vec(),
                is_average: false,
            }],
        );
        query_object.session_id = Some(session_id.clone());
        api.ctx
            .vectors
            .upsert(&query_collection, &[query_object], true)
            .await?;
    }
    debug!(session_id = %session_id, "Captured search session");
    Ok(session_id)
}

async fn payload_search(
    State(api): State<ApiContext>,
    Json(request): Json<PayloadSearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    let regular = api
        .ctx
        .cache
        .get_blue(CollectionKind::Regular)
        .ok_or_else(|| QuiverError::not_found("blue collection", "REGULAR"))?;

    let hits = api
        .ctx
        .vectors
        .find_by_payload_filter(
            &regular,
            &request.filter,
            request.limit,
            request.offset,
            request.sort_by.as_ref(),
        )
        .await?;

    let session_id = if request.create_session {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let results = hits
            .iter()
            .enumerate()
            .map(|(rank, hit)| SessionResult {
                object_id: hit.object_id.clone(),
                rank: rank as f32,
            })
            .collect();
        api.ctx
            .clickstream
            .register_session(RegisterSession {
                session_id: session_id.clone(),
                search_query: String::new(),
                results,
                user_id: request.user_id.clone(),
                is_payload_search: true,
            })
            .await?;
        Some(session_id)
    } else {
        None
    };

    let next_page_offset = if hits.len() == request.limit {
        Some(request.offset + hits.len())
    } else {
        None
    };

    Ok(Json(SearchResponse {
        session_id,
        search_results: hits.into_iter().map(SearchResultEntry::from).collect(),
        next_page_offset,
        meta_info: serde_json::Value::Null,
    }))
}

async fn payload_count(
    State(api): State<ApiContext>,
    Json(request): Json<PayloadCountRequest>,
) -> ApiResult<Json<PayloadCountResponse>> {
    let regular = api
        .ctx
        .cache
        .get_blue(CollectionKind::Regular)
        .ok_or_else(|| QuiverError::not_found("blue collection", "REGULAR"))?;
    let count = api
        .ctx
        .vectors
        .count_by_payload_filter(&regular, &request.filter)
        .await?;
    Ok(Json(PayloadCountResponse { count }))
}
