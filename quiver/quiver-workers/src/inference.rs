//! Inference server dispatch.
//!
//! The inference server hosts per-model endpoints; the control plane treats
//! it as a remote evaluator behind the [`InferenceClient`] trait. The mock
//! implementation produces deterministic vectors for tests and local runs.

use async_trait::async_trait;
use dashmap::DashMap;
use quiver_core::config::InferenceConfig;
use quiver_core::error::{QuiverError, Result};
use quiver_core::traits::InferenceClient;
use quiver_core::types::Vector;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::debug;

/// HTTP client against the inference server.
pub struct HttpInferenceClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ReadyResponse {
    ready: bool,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct QueryResponse {
    vector: Vector,
}

#[derive(Serialize)]
struct ItemsRequest<'a> {
    items: &'a [serde_json::Value],
}

#[derive(Deserialize)]
struct ItemsResponse {
    vectors: Vec<Vector>,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| QuiverError::internal(format!("building inference client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn model_url(&self, plugin_name: &str, model_id: &str, suffix: &str) -> String {
        format!(
            "{}/v1/models/{plugin_name}/{model_id}/{suffix}",
            self.base_url
        )
    }
}

fn transport_err(context: &str, e: reqwest::Error) -> QuiverError {
    if e.is_timeout() {
        QuiverError::timeout(format!("{context}: {e}"))
    } else {
        QuiverError::unavailable(format!("{context}: {e}"))
    }
}

async fn check_status(context: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        Err(QuiverError::validation(format!("{context}: {status}: {body}")))
    } else {
        Err(QuiverError::unavailable(format!("{context}: {status}: {body}")))
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn is_model_ready(&self, plugin_name: &str, model_id: &str) -> Result<bool> {
        let url = self.model_url(plugin_name, model_id, "ready");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_err("readiness probe", e))?;

        // A model the server does not know yet is simply not ready.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let response = check_status("readiness probe", response).await?;
        let body: ReadyResponse = response
            .json()
            .await
            .map_err(|e| transport_err("decoding readiness", e))?;
        Ok(body.ready)
    }

    async fn forward_query(
        &self,
        plugin_name: &str,
        model_id: &str,
        query: &str,
    ) -> Result<Vector> {
        let url = self.model_url(plugin_name, model_id, "query");
        let response = self
            .client
            .post(&url)
            .json(&QueryRequest { query })
            .send()
            .await
            .map_err(|e| transport_err("query inference", e))?;
        let response = check_status("query inference", response).await?;
        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| transport_err("decoding query vector", e))?;
        Ok(body.vector)
    }

    async fn forward_items(
        &self,
        plugin_name: &str,
        model_id: &str,
        items: &[serde_json::Value],
    ) -> Result<Vec<Vector>> {
        debug!(plugin_name, model_id, items = items.len(), "Forwarding items");
        let url = self.model_url(plugin_name, model_id, "items");
        let response = self
            .client
            .post(&url)
            .json(&ItemsRequest { items })
            .send()
            .await
            .map_err(|e| transport_err("item inference", e))?;
        let response = check_status("item inference", response).await?;
        let body: ItemsResponse = response
            .json()
            .await
            .map_err(|e| transport_err("decoding item vectors", e))?;

        if body.vectors.len() != items.len() {
            return Err(QuiverError::validation(format!(
                "expected {} vectors, got {}",
                items.len(),
                body.vectors.len()
            )));
        }
        Ok(body.vectors)
    }
}

/// Deterministic in-process inference for tests and local development.
///
/// Vectors derive from a hash of the input, so equal inputs embed equally;
/// specific inputs can be pinned with [`MockInferenceClient::set_vector`].
pub struct MockInferenceClient {
    dimension: usize,
    ready: DashMap<String, bool>,
    pinned: DashMap<String, Vector>,
}

impl MockInferenceClient {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ready: DashMap::new(),
            pinned: DashMap::new(),
        }
    }

    pub fn set_ready(&self, model_id: impl Into<String>, ready: bool) {
        self.ready.insert(model_id.into(), ready);
    }

    /// Pin the vector returned for one serialized input.
    pub fn set_vector(&self, input: &serde_json::Value, vector: Vector) {
        self.pinned.insert(input.to_string(), vector);
    }

    fn vector_for(&self, input: &str) -> Vector {
        let mut vector = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let mut hasher = DefaultHasher::new();
            input.hash(&mut hasher);
            i.hash(&mut hasher);
            let raw = (hasher.finish() % 2000) as f32 / 1000.0 - 1.0;
            vector.push(raw);
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }

    fn embed(&self, input: &serde_json::Value) -> Vector {
        let key = input.to_string();
        self.pinned
            .get(&key)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.vector_for(&key))
    }
}

#[async_trait]
impl InferenceClient for MockInferenceClient {
    async fn is_model_ready(&self, _plugin_name: &str, model_id: &str) -> Result<bool> {
        Ok(self
            .ready
            .get(model_id)
            .map(|entry| *entry.value())
            .unwrap_or(true))
    }

    async fn forward_query(
        &self,
        _plugin_name: &str,
        _model_id: &str,
        query: &str,
    ) -> Result<Vector> {
        Ok(self.embed(&serde_json::Value::String(query.to_owned())))
    }

    async fn forward_items(
        &self,
        _plugin_name: &str,
        _model_id: &str,
        items: &[serde_json::Value],
    ) -> Result<Vec<Vector>> {
        Ok(items.iter().map(|item| self.embed(item)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_is_deterministic() {
        let mock = MockInferenceClient::new(4);
        let a = mock
            .forward_items("p", "m", &[json!({"title": "x"})])
            .await
            .unwrap();
        let b = mock
            .forward_items("p", "m", &[json!({"title": "x"})])
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 4);
    }

    #[tokio::test]
    async fn mock_pins_and_readiness() {
        let mock = MockInferenceClient::new(3);
        mock.set_vector(&json!("q"), vec![1.0, 0.0, 0.0]);
        assert_eq!(
            mock.forward_query("p", "m", "q").await.unwrap(),
            vec![1.0, 0.0, 0.0]
        );

        mock.set_ready("m", false);
        assert!(!mock.is_model_ready("p", "m").await.unwrap());
    }
}
