//! End-to-end API tests over the in-memory stores.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use quiver_api::{ApiContext, build_router};
use quiver_core::QuiverConfig;
use quiver_core::types::TaskStatus;
use quiver_workers::{WorkerContext, register_workers};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn app() -> (Router, Arc<WorkerContext>) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = QuiverConfig::default();
    config.model_repo.root = dir.keep();
    let ctx = WorkerContext::in_memory(config, 3).await.unwrap();
    register_workers(&ctx);
    let router = build_router(ApiContext {
        ctx: Arc::clone(&ctx),
    });
    (router, ctx)
}

async fn post(router: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn get(router: &Router, path: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_and_promote(router: &Router, model_id: &str) {
    let (status, _) = post(
        router,
        "/collections/create",
        json!({
            "embedding_model_id": model_id,
            "plugin_name": "static_text",
            "dimensions": 3
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post(
        router,
        "/collections/set-blue",
        json!({"embedding_model_id": model_id}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_answers() {
    let (router, _ctx) = app().await;
    let (status, body) = get(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn ingest_and_similarity_search() {
    let (router, _ctx) = app().await;
    create_and_promote(&router, "m1").await;

    let (status, _) = post(
        &router,
        "/collections/objects/insert",
        json!({
            "objects": [
                {
                    "object_id": "a",
                    "payload": {"category": "x"},
                    "parts": [{"part_id": "a_0", "vector": [1.0, 0.0, 0.0]}]
                },
                {
                    "object_id": "b",
                    "payload": {"category": "y"},
                    "parts": [{"part_id": "b_0", "vector": [0.0, 1.0, 0.0]}]
                }
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(
        &router,
        "/embeddings/similarity-search",
        json!({"query_vector": [1.0, 0.0, 0.0], "limit": 2}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["search_results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["object_id"], "a");
    assert!(results[0]["distance"].as_f64().unwrap().abs() < 1e-6);
    assert_eq!(results[1]["object_id"], "b");
    assert!((results[1]["distance"].as_f64().unwrap() - 1.0).abs() < 1e-6);

    let (status, body) = post(
        &router,
        "/embeddings/similarity-search",
        json!({
            "query_vector": [1.0, 0.0, 0.0],
            "limit": 2,
            "filter": {"term": {"field": "category", "value": "y"}}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["search_results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["object_id"], "b");
}

#[tokio::test]
async fn payload_search_and_count() {
    let (router, _ctx) = app().await;
    create_and_promote(&router, "m1").await;
    post(
        &router,
        "/collections/objects/insert",
        json!({
            "objects": [{
                "object_id": "a",
                "payload": {"category": "x"},
                "parts": [{"part_id": "a_0", "vector": [1.0, 0.0, 0.0]}]
            }]
        }),
    )
    .await;

    let (status, body) = post(
        &router,
        "/embeddings/payload-search",
        json!({"filter": {"term": {"field": "category", "value": "x"}}, "limit": 10}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["search_results"].as_array().unwrap().len(), 1);

    let (status, body) = post(
        &router,
        "/embeddings/payload-count",
        json!({"filter": {"term": {"field": "category", "value": "x"}}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn idempotent_upsertion_task() {
    let (router, ctx) = app().await;
    create_and_promote(&router, "m1").await;

    let body = json!({
        "task_id": "t1",
        "items": [{"object_id": "o1", "payload": {"title": "one"}}]
    });
    let (status, first) = post(&router, "/embeddings/upsertion-tasks/run", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["task_id"], "t1");

    let (status, second) = post(&router, "/embeddings/upsertion-tasks/run", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["task_id"], "t1");

    // Exactly one task exists and finishes with exactly one object row.
    for _ in 0..200 {
        let task = ctx.tasks.get("t1").await.unwrap();
        if task.status == TaskStatus::Done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let (status, listed) = get(&router, "/embeddings/upsertion-tasks/list?offset=0&limit=10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let collection = ctx
        .cache
        .get_blue(quiver_core::types::CollectionKind::Regular)
        .unwrap();
    let objects = ctx
        .vectors
        .find_by_ids(&collection, &["o1".into()])
        .await
        .unwrap();
    assert_eq!(objects.len(), 1);
    ctx.dispatcher.shutdown();
}

#[tokio::test]
async fn blue_collection_delete_is_guarded() {
    let (router, _ctx) = app().await;
    create_and_promote(&router, "m1").await;

    // Deleting the blue pair conflicts.
    let (status, _) = post(
        &router,
        "/collections/delete",
        json!({"embedding_model_id": "m1"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Promote m2, then m1 deletes cleanly.
    create_and_promote(&router, "m2").await;
    let (status, _) = post(
        &router,
        "/collections/delete",
        json!({"embedding_model_id": "m1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, listed) = get(&router, "/collections/list").await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        listed
            .as_array()
            .unwrap()
            .iter()
            .all(|c| c["collection_id"] != "m1")
    );

    let (status, blue) = get(&router, "/collections/get-blue-info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(blue["collection_id"], "m2");
}

#[tokio::test]
async fn dimension_mismatch_is_rejected() {
    let (router, ctx) = app().await;
    create_and_promote(&router, "m1").await;

    let (status, body) = post(
        &router,
        "/collections/objects/upsert",
        json!({
            "objects": [{
                "object_id": "bad",
                "parts": [{"part_id": "bad_0", "vector": [1.0, 0.0, 0.0, 0.0]}]
            }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("dimension"));

    let collection = ctx
        .cache
        .get_blue(quiver_core::types::CollectionKind::Regular)
        .unwrap();
    assert!(
        ctx.vectors
            .find_by_ids(&collection, &["bad".into()])
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn missing_resources_are_404() {
    let (router, _ctx) = app().await;

    let (status, _) = get(&router, "/embeddings/upsertion-tasks/info?task_id=ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&router, "/collections/get-info?embedding_model_id=ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&router, "/collections/get-blue-info").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn clickstream_round_trip_via_api() {
    let (router, _ctx) = app().await;
    create_and_promote(&router, "m1").await;

    let (status, session) = post(
        &router,
        "/clickstream/session",
        json!({
            "session_id": "s1",
            "search_query": "red shoes",
            "results": [{"object_id": "p", "rank": 0.0}],
            "user_id": "u"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["session_number"], 0);
    let batch_id = session["batch_id"].as_str().unwrap().to_owned();

    let (status, _) = post(
        &router,
        "/clickstream/session/events",
        json!({
            "session_id": "s1",
            "events": [{
                "event_id": "e1",
                "object_id": "p",
                "event_type": "click",
                "created_at": "2026-08-01T00:00:00Z"
            }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post(
        &router,
        "/clickstream/internal/session/use-for-improvement",
        json!({"session_id": "s1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, batch) = post(
        &router,
        "/clickstream/internal/batch/release",
        json!({"release_id": "r1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(batch["batch_id"].as_str().unwrap(), batch_id);

    let (status, sessions) = get(
        &router,
        &format!("/clickstream/internal/batch/sessions?batch_id={batch_id}&limit=10"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["session_id"], "s1");
    assert_eq!(sessions[0]["events"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn task_cancel_via_api() {
    let (router, _ctx) = app().await;

    // A fine-tune task has no in-process worker: it stays Pending.
    let (status, task) = post(
        &router,
        "/fine-tuning/task/run",
        json!({"batch_id": "b1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "PENDING");
    let task_id = task["task_id"].as_str().unwrap().to_owned();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/fine-tuning/task/cancel?task_id={task_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let canceled: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(canceled["status"], "CANCELED");
}
