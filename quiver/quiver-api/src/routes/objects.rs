//! Object-level vector store endpoints.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use quiver_core::types::{CollectionNamespace, Object};

use crate::error::ApiResult;
use crate::types::{
    DeleteObjectsRequest, DeleteObjectsResponse, FindByIdsRequest, FindSimilarRequest,
    InsertObjectsRequest, UpsertObjectsRequest,
};
use crate::ApiContext;

/// Object routes mounted under `/collections/objects`.
pub fn object_routes(api: ApiContext) -> Router {
    Router::new()
        .route("/collections/objects/insert", post(insert))
        .route("/collections/objects/upsert", post(upsert))
        .route("/collections/objects/delete", post(delete))
        .route("/collections/objects/find-by-ids", post(find_by_ids))
        .route("/collections/objects/find-similar", post(find_similar))
        .with_state(api)
}

async fn insert(
    State(api): State<ApiContext>,
    Json(request): Json<InsertObjectsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let collection = api.ctx.resolve_regular(
        request.embedding_model_id.as_deref(),
        CollectionNamespace::Primary,
    )?;
    api.ctx.vectors.insert(&collection, &request.objects).await?;
    Ok(Json(serde_json::json!({"inserted": request.objects.len()})))
}

async fn upsert(
    State(api): State<ApiContext>,
    Json(request): Json<UpsertObjectsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let collection = api.ctx.resolve_regular(
        request.embedding_model_id.as_deref(),
        CollectionNamespace::Primary,
    )?;
    api.ctx
        .vectors
        .upsert(&collection, &request.objects, request.shrink_parts)
        .await?;
    Ok(Json(serde_json::json!({"upserted": request.objects.len()})))
}

async fn delete(
    State(api): State<ApiContext>,
    Json(request): Json<DeleteObjectsRequest>,
) -> ApiResult<Json<DeleteObjectsResponse>> {
    let collection = api.ctx.resolve_regular(
        request.embedding_model_id.as_deref(),
        CollectionNamespace::Primary,
    )?;
    let deleted_ids = api
        .ctx
        .vectors
        .delete(&collection, &request.object_ids)
        .await?;
    Ok(Json(DeleteObjectsResponse { deleted_ids }))
}

async fn find_by_ids(
    State(api): State<ApiContext>,
    Json(request): Json<FindByIdsRequest>,
) -> ApiResult<Json<Vec<Object>>> {
    let collection = api.ctx.resolve_regular(
        request.embedding_model_id.as_deref(),
        CollectionNamespace::Primary,
    )?;
    let objects = api
        .ctx
        .vectors
        .find_by_ids(&collection, &request.object_ids)
        .await?;
    Ok(Json(objects))
}

async fn find_similar(
    State(api): State<ApiContext>,
    Json(request): Json<FindSimilarRequest>,
) -> ApiResult<Json<Vec<quiver_core::types::SearchHit>>> {
    let collection = api.ctx.resolve_regular(
        request.embedding_model_id.as_deref(),
        CollectionNamespace::Primary,
    )?;
    let hits = api
        .ctx
        .vectors
        .find_similar(&collection, &request.query)
        .await?;
    Ok(Json(hits))
}
