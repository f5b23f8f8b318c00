//! Generic task endpoints.
//!
//! Every task kind gets the same five endpoints (run/info/list/restart/
//! cancel) from one router factory parameterized by a [`TaskFamily`]; the
//! families only differ in kind, payload schema and validation.

use axum::extract::{Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use quiver_core::error::{QuiverError, Result};
use quiver_core::types::{
    DeletionPayload, DeploymentPayload, FineTunePayload, ReindexPayload, Task, TaskKind,
    UpsertionPayload,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ApiResult;
use crate::types::{TaskIdQuery, TaskListQuery};
use crate::ApiContext;

/// One task kind's endpoint family.
pub trait TaskFamily: Send + Sync + 'static {
    const KIND: TaskKind;
    type Payload: DeserializeOwned + Serialize + Send + 'static;

    /// Normalize the payload before it is stored (e.g. force a namespace).
    fn prepare(_payload: &mut Self::Payload) {}

    fn validate(_payload: &Self::Payload) -> Result<()> {
        Ok(())
    }

    fn model_id(_payload: &Self::Payload) -> Option<String> {
        None
    }
}

#[derive(Deserialize)]
struct RunRequest<P> {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(flatten)]
    payload: P,
}

/// The run/info/list/restart/cancel routes of one family under `prefix`.
pub fn task_family_routes<F: TaskFamily>(api: ApiContext, prefix: &str) -> Router {
    Router::new()
        .route(&format!("{prefix}/run"), post(run::<F>))
        .route(&format!("{prefix}/info"), get(info))
        .route(&format!("{prefix}/list"), get(list::<F>))
        .route(&format!("{prefix}/restart"), put(restart))
        .route(&format!("{prefix}/cancel"), put(cancel))
        .with_state(api)
}

/// Send a task, tolerating kinds whose queue lives in another process (the
/// fine-tuning trainer drains its own queue); the task stays Pending there.
async fn send_tolerant(api: &ApiContext, task: &Task) {
    match api.ctx.dispatcher.ensure_sent(task).await {
        Ok(_) => {}
        Err(QuiverError::Unavailable(reason)) => {
            warn!(task_id = %task.task_id, reason, "Task left pending for external worker");
        }
        Err(e) => {
            warn!(task_id = %task.task_id, error = %e, "Queue send failed");
        }
    }
}

async fn run<F: TaskFamily>(
    State(api): State<ApiContext>,
    Json(request): Json<RunRequest<F::Payload>>,
) -> ApiResult<Json<Task>> {
    let mut payload = request.payload;
    F::prepare(&mut payload);
    F::validate(&payload)?;

    let mut task = Task::new(
        F::KIND,
        serde_json::to_value(&payload).map_err(QuiverError::from)?,
        request.task_id,
    );
    if let Some(model_id) = F::model_id(&payload) {
        task = task.with_model(model_id);
    }

    let task = api.ctx.tasks.create(task).await?;
    send_tolerant(&api, &task).await;
    Ok(Json(api.ctx.tasks.get(&task.task_id).await?))
}

async fn info(
    State(api): State<ApiContext>,
    Query(query): Query<TaskIdQuery>,
) -> ApiResult<Json<Task>> {
    Ok(Json(api.ctx.tasks.get(&query.task_id).await?))
}

async fn list<F: TaskFamily>(
    State(api): State<ApiContext>,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let tasks = api
        .ctx
        .tasks
        .list(F::KIND, query.status, query.offset, query.limit)
        .await?;
    Ok(Json(tasks))
}

async fn restart(
    State(api): State<ApiContext>,
    Query(query): Query<TaskIdQuery>,
) -> ApiResult<Json<Task>> {
    let task = api.ctx.tasks.restart(&query.task_id).await?;
    send_tolerant(&api, &task).await;
    Ok(Json(api.ctx.tasks.get(&task.task_id).await?))
}

async fn cancel(
    State(api): State<ApiContext>,
    Query(query): Query<TaskIdQuery>,
) -> ApiResult<Json<Task>> {
    api.ctx.dispatcher.cancel(&query.task_id).await?;
    Ok(Json(api.ctx.tasks.get(&query.task_id).await?))
}

// ==============================================================================
// Families
// ==============================================================================

pub struct UpsertionFamily;

impl TaskFamily for UpsertionFamily {
    const KIND: TaskKind = TaskKind::Upsert;
    type Payload = UpsertionPayload;

    fn validate(payload: &Self::Payload) -> Result<()> {
        if payload.items.iter().any(|item| item.object_id.is_empty()) {
            return Err(QuiverError::validation("items require non-empty object ids"));
        }
        Ok(())
    }

    fn model_id(payload: &Self::Payload) -> Option<String> {
        payload.embedding_model_id.clone()
    }
}

pub struct CategoriesUpsertionFamily;

impl TaskFamily for CategoriesUpsertionFamily {
    const KIND: TaskKind = TaskKind::Upsert;
    type Payload = UpsertionPayload;

    fn prepare(payload: &mut Self::Payload) {
        payload.categories = true;
    }

    fn validate(payload: &Self::Payload) -> Result<()> {
        UpsertionFamily::validate(payload)
    }

    fn model_id(payload: &Self::Payload) -> Option<String> {
        payload.embedding_model_id.clone()
    }
}

pub struct DeletionFamily;

impl TaskFamily for DeletionFamily {
    const KIND: TaskKind = TaskKind::Delete;
    type Payload = DeletionPayload;

    fn model_id(payload: &Self::Payload) -> Option<String> {
        payload.embedding_model_id.clone()
    }
}

pub struct CategoriesDeletionFamily;

impl TaskFamily for CategoriesDeletionFamily {
    const KIND: TaskKind = TaskKind::Delete;
    type Payload = DeletionPayload;

    fn prepare(payload: &mut Self::Payload) {
        payload.categories = true;
    }

    fn model_id(payload: &Self::Payload) -> Option<String> {
        payload.embedding_model_id.clone()
    }
}

pub struct ReindexFamily;

impl TaskFamily for ReindexFamily {
    const KIND: TaskKind = TaskKind::Reindex;
    type Payload = ReindexPayload;

    fn validate(payload: &Self::Payload) -> Result<()> {
        if payload.source.embedding_model_id == payload.dest.embedding_model_id {
            return Err(QuiverError::validation(
                "reindex source and destination must differ",
            ));
        }
        Ok(())
    }

    fn model_id(payload: &Self::Payload) -> Option<String> {
        Some(payload.dest.embedding_model_id.clone())
    }
}

pub struct FineTuneFamily;

impl TaskFamily for FineTuneFamily {
    const KIND: TaskKind = TaskKind::FineTune;
    type Payload = FineTunePayload;

    fn model_id(payload: &Self::Payload) -> Option<String> {
        payload.embedding_model_id.clone()
    }
}

pub struct DeployFamily;

impl TaskFamily for DeployFamily {
    const KIND: TaskKind = TaskKind::Deploy;
    type Payload = DeploymentPayload;

    fn model_id(payload: &Self::Payload) -> Option<String> {
        Some(payload.embedding_model_id.clone())
    }
}

pub struct UndeployFamily;

impl TaskFamily for UndeployFamily {
    const KIND: TaskKind = TaskKind::Undeploy;
    type Payload = DeploymentPayload;

    fn model_id(payload: &Self::Payload) -> Option<String> {
        Some(payload.embedding_model_id.clone())
    }
}
