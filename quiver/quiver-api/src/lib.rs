//! HTTP surface of the Quiver control plane.
//!
//! A thin axum layer over the core subsystems: collection management, object
//! ops, public search, the generic task endpoint families, and clickstream
//! capture. No business logic lives here.

pub mod error;
pub mod routes;
pub mod types;

use axum::routing::get;
use axum::{Json, Router};
use quiver_core::types::CollectionNamespace;
use quiver_workers::WorkerContext;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use routes::clickstream::clickstream_routes;
use routes::collections::collection_routes;
use routes::objects::object_routes;
use routes::search::search_routes;
use routes::tasks::{
    CategoriesDeletionFamily, CategoriesUpsertionFamily, DeletionFamily, DeployFamily,
    FineTuneFamily, ReindexFamily, UndeployFamily, UpsertionFamily, task_family_routes,
};

/// Shared state of every handler.
#[derive(Clone)]
pub struct ApiContext {
    pub ctx: Arc<WorkerContext>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Assemble the full router.
pub fn build_router(api: ApiContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(collection_routes(
            api.clone(),
            CollectionNamespace::Primary,
            "/collections",
        ))
        .merge(collection_routes(
            api.clone(),
            CollectionNamespace::Categories,
            "/collections/categories",
        ))
        .merge(object_routes(api.clone()))
        .merge(search_routes(api.clone()))
        .merge(clickstream_routes(api.clone()))
        .merge(task_family_routes::<UpsertionFamily>(
            api.clone(),
            "/embeddings/upsertion-tasks",
        ))
        .merge(task_family_routes::<DeletionFamily>(
            api.clone(),
            "/embeddings/deletion-tasks",
        ))
        .merge(task_family_routes::<CategoriesUpsertionFamily>(
            api.clone(),
            "/embeddings/categories-upsertion-tasks",
        ))
        .merge(task_family_routes::<CategoriesDeletionFamily>(
            api.clone(),
            "/embeddings/categories-deletion-tasks",
        ))
        .merge(task_family_routes::<ReindexFamily>(
            api.clone(),
            "/internal/reindex-tasks",
        ))
        .merge(task_family_routes::<FineTuneFamily>(
            api.clone(),
            "/fine-tuning/task",
        ))
        .merge(task_family_routes::<DeployFamily>(
            api.clone(),
            "/inference-deployment/deploy",
        ))
        .merge(task_family_routes::<UndeployFamily>(
            api.clone(),
            "/inference-deployment/delete",
        ))
        .layer(TraceLayer::new_for_http())
}
