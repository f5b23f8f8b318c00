//! Clickstream endpoints.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use quiver_core::types::{Batch, ClickstreamSession, ImprovePayload, RegisterSession, Task, TaskKind};
use tracing::warn;

use crate::error::ApiResult;
use crate::types::{
    AppendEventsRequest, BatchSessionsQuery, RegisterSessionRequest, ReleaseBatchRequest,
    UseForImprovementRequest,
};
use crate::ApiContext;

/// Clickstream routes.
pub fn clickstream_routes(api: ApiContext) -> Router {
    Router::new()
        .route("/clickstream/session", post(register_session))
        .route("/clickstream/session/events", post(append_events))
        .route(
            "/clickstream/internal/session/use-for-improvement",
            post(use_for_improvement),
        )
        .route("/clickstream/internal/batch/sessions", get(batch_sessions))
        .route("/clickstream/internal/batch/release", post(release_batch))
        .with_state(api)
}

async fn register_session(
    State(api): State<ApiContext>,
    Json(request): Json<RegisterSessionRequest>,
) -> ApiResult<Json<ClickstreamSession>> {
    let session = api
        .ctx
        .clickstream
        .register_session(RegisterSession {
            session_id: request.session_id,
            search_query: request.search_query,
            results: request.results,
            user_id: request.user_id,
            is_payload_search: request.is_payload_search,
        })
        .await?;
    Ok(Json(session))
}

async fn append_events(
    State(api): State<ApiContext>,
    Json(request): Json<AppendEventsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    api.ctx
        .clickstream
        .append_events(&request.session_id, &request.events)
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn use_for_improvement(
    State(api): State<ApiContext>,
    Json(request): Json<UseForImprovementRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    api.ctx
        .clickstream
        .mark_for_improvement(&request.session_id)
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn batch_sessions(
    State(api): State<ApiContext>,
    Query(query): Query<BatchSessionsQuery>,
) -> ApiResult<Json<Vec<ClickstreamSession>>> {
    let sessions = api
        .ctx
        .clickstream
        .get_batch_sessions(
            &query.batch_id,
            query.after_number,
            query.limit,
            query.events_limit,
        )
        .await?;
    Ok(Json(sessions))
}

/// Release the active batch and hand it to the improvement pipeline.
async fn release_batch(
    State(api): State<ApiContext>,
    Json(request): Json<ReleaseBatchRequest>,
) -> ApiResult<Json<Batch>> {
    let batch = api.ctx.clickstream.release_batch(&request.release_id).await?;

    let payload = ImprovePayload {
        batch_id: Some(batch.batch_id.clone()),
        session_ids: Vec::new(),
    };
    let improve = Task::new(
        TaskKind::Improve,
        serde_json::to_value(&payload).map_err(quiver_core::error::QuiverError::from)?,
        Some(format!("improve_{}", batch.batch_id)),
    );
    let improve = api.ctx.tasks.create(improve).await?;
    if let Err(e) = api.ctx.dispatcher.ensure_sent(&improve).await {
        warn!(batch_id = %batch.batch_id, error = %e,
            "Improvement task left pending; no improvement worker registered");
    }

    Ok(Json(batch))
}
