//! Collection management endpoints, shared by the primary and categories
//! namespaces.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use quiver_core::error::QuiverError;
use quiver_core::types::{CollectionInfo, CollectionNamespace};
use tracing::debug;

use crate::error::ApiResult;
use crate::types::{CreateCollectionRequest, ModelIdQuery, ModelIdRequest};
use crate::ApiContext;

#[derive(Clone)]
struct CollectionsContext {
    api: ApiContext,
    namespace: CollectionNamespace,
}

/// Collection routes mounted under `prefix` for one namespace.
pub fn collection_routes(
    api: ApiContext,
    namespace: CollectionNamespace,
    prefix: &str,
) -> Router {
    let context = CollectionsContext { api, namespace };
    Router::new()
        .route(&format!("{prefix}/create"), post(create))
        .route(&format!("{prefix}/create-index"), post(create_index))
        .route(&format!("{prefix}/delete"), post(delete))
        .route(&format!("{prefix}/set-blue"), post(set_blue))
        .route(&format!("{prefix}/list"), get(list))
        .route(&format!("{prefix}/queries/list"), get(queries_list))
        .route(&format!("{prefix}/get-info"), get(get_info))
        .route(&format!("{prefix}/get-blue-info"), get(get_blue_info))
        .with_state(context)
}

async fn create(
    State(ctx): State<CollectionsContext>,
    Json(request): Json<CreateCollectionRequest>,
) -> ApiResult<Json<Vec<CollectionInfo>>> {
    let known = ctx
        .api
        .ctx
        .cache
        .get(&request.embedding_model_id)
        .map(|info| info.model);
    let model = request.into_model(known)?;
    let lifecycle = ctx.api.ctx.lifecycle_for(ctx.namespace);
    let pair = lifecycle.create_pair(&model).await?;
    debug!(embedding_model_id = %model.embedding_model_id, "Collection pair ensured");
    Ok(Json(pair))
}

async fn create_index(
    State(ctx): State<CollectionsContext>,
    Json(request): Json<ModelIdRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.api
        .ctx
        .lifecycle_for(ctx.namespace)
        .create_index(&request.embedding_model_id)
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn delete(
    State(ctx): State<CollectionsContext>,
    Json(request): Json<ModelIdRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.api
        .ctx
        .lifecycle_for(ctx.namespace)
        .delete_pair(&request.embedding_model_id)
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn set_blue(
    State(ctx): State<CollectionsContext>,
    Json(request): Json<ModelIdRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.api
        .ctx
        .lifecycle_for(ctx.namespace)
        .promote_to_blue(&request.embedding_model_id)
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn list(State(ctx): State<CollectionsContext>) -> ApiResult<Json<Vec<CollectionInfo>>> {
    let (regular, _) = ctx.namespace.kinds();
    Ok(Json(ctx.api.ctx.cache.list(regular)))
}

async fn queries_list(
    State(ctx): State<CollectionsContext>,
) -> ApiResult<Json<Vec<CollectionInfo>>> {
    let (_, query) = ctx.namespace.kinds();
    Ok(Json(ctx.api.ctx.cache.list(query)))
}

async fn get_info(
    State(ctx): State<CollectionsContext>,
    Query(query): Query<ModelIdQuery>,
) -> ApiResult<Json<CollectionInfo>> {
    let (regular, _) = ctx.namespace.kinds();
    let info = ctx
        .api
        .ctx
        .cache
        .get_with_kind(&query.embedding_model_id, regular)
        .ok_or_else(|| QuiverError::not_found("collection", &query.embedding_model_id))?;
    Ok(Json(info))
}

async fn get_blue_info(
    State(ctx): State<CollectionsContext>,
) -> ApiResult<Json<CollectionInfo>> {
    let (regular, _) = ctx.namespace.kinds();
    let info = ctx
        .api
        .ctx
        .cache
        .get_blue(regular)
        .ok_or_else(|| QuiverError::not_found("blue collection", regular.as_str()))?;
    Ok(Json(info))
}
