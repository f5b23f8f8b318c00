//! Typed registry for model-specific plugin code.
//!
//! Each embedding model names a plugin; the registry resolves the name to a
//! concrete implementation of a fixed capability set. The core never
//! reflects on types; it looks up by string and dispatches through the
//! [`ModelPlugin`] interface.

use crate::error::{QuiverError, Result};
use crate::traits::VectorAdjuster;
use crate::types::{AggregationType, EmbeddingModelInfo, HnswParams, MetricType, UpsertItem};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Inference model identifiers of one embedding model, as hosted on the
/// inference server. Queries and items may be served by different models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceModelIds {
    pub query: String,
    pub items: String,
}

impl InferenceModelIds {
    /// Whether queries and items share one hosted model.
    pub fn shared(&self) -> bool {
        self.query == self.items
    }
}

/// Index parameters a plugin declares for its collections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchIndexInfo {
    pub metric_type: MetricType,
    pub aggregation_type: AggregationType,
    pub hnsw: HnswParams,
}

/// Capability set of a model plugin.
pub trait ModelPlugin: Send + Sync {
    /// Registry key; must match `[A-Za-z_][A-Za-z0-9_]*`.
    fn name(&self) -> &str;

    /// Build the inference inputs of one item, one entry per object part.
    fn embedding_inputs(&self, item: &UpsertItem) -> Result<Vec<serde_json::Value>>;

    /// Hosted model ids used for query and item inference.
    fn inference_model_ids(&self, model: &EmbeddingModelInfo) -> InferenceModelIds;

    /// Plugin-specific vector adjuster; `None` selects the platform default.
    fn adjuster(&self) -> Option<Arc<dyn VectorAdjuster>> {
        None
    }

    /// Index parameters for this plugin's collections.
    fn search_index_info(&self, model: &EmbeddingModelInfo) -> SearchIndexInfo {
        SearchIndexInfo {
            metric_type: model.metric_type,
            aggregation_type: model.aggregation_type,
            hnsw: model.hnsw,
        }
    }
}

impl std::fmt::Debug for dyn ModelPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPlugin").field("name", &self.name()).finish()
    }
}

/// Registry of model plugins keyed by plugin name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<dyn ModelPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Re-registering a name replaces the previous entry
    /// and logs a warning.
    pub fn register(&self, plugin: Arc<dyn ModelPlugin>) {
        let name = plugin.name().to_owned();
        if self.plugins.insert(name.clone(), plugin).is_some() {
            warn!(plugin = %name, "plugin re-registered, replacing previous entry");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ModelPlugin>> {
        self.plugins
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| QuiverError::not_found("plugin", name))
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|e| e.key().clone()).collect()
    }
}

/// Plugin that embeds an item's payload (or `item_info` when present) as a
/// single inference input. Suitable for models whose preprocessing lives
/// entirely on the inference server.
pub struct StaticPlugin {
    name: String,
}

impl StaticPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ModelPlugin for StaticPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn embedding_inputs(&self, item: &UpsertItem) -> Result<Vec<serde_json::Value>> {
        let input = item
            .item_info
            .clone()
            .or_else(|| item.payload.clone())
            .ok_or_else(|| {
                QuiverError::validation(format!(
                    "item {} carries neither payload nor item_info",
                    item.object_id
                ))
            })?;
        Ok(vec![input])
    }

    fn inference_model_ids(&self, model: &EmbeddingModelInfo) -> InferenceModelIds {
        InferenceModelIds {
            query: format!("{}_query", model.embedding_model_id),
            items: format!("{}_items", model.embedding_model_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model() -> EmbeddingModelInfo {
        EmbeddingModelInfo {
            embedding_model_id: "m1".into(),
            plugin_name: "static_text".into(),
            dimensions: 3,
            metric_type: MetricType::Cosine,
            aggregation_type: AggregationType::Avg,
            hnsw: HnswParams::default(),
        }
    }

    #[test]
    fn registry_lookup() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(StaticPlugin::new("static_text")));

        assert!(registry.get("static_text").is_ok());
        assert!(registry.get("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn static_plugin_inputs() {
        let plugin = StaticPlugin::new("static_text");
        let item = UpsertItem {
            object_id: "o1".into(),
            payload: Some(json!({"title": "x"})),
            item_info: None,
        };
        let inputs = plugin.embedding_inputs(&item).unwrap();
        assert_eq!(inputs, vec![json!({"title": "x"})]);

        let empty = UpsertItem {
            object_id: "o2".into(),
            payload: None,
            item_info: None,
        };
        assert!(plugin.embedding_inputs(&empty).is_err());
    }

    #[test]
    fn default_index_info_mirrors_model() {
        let plugin = StaticPlugin::new("static_text");
        let info = plugin.search_index_info(&model());
        assert_eq!(info.metric_type, MetricType::Cosine);
        assert_eq!(info.hnsw, HnswParams::default());
    }

    #[test]
    fn query_and_items_models_are_distinct() {
        let plugin = StaticPlugin::new("static_text");
        let ids = plugin.inference_model_ids(&model());
        assert_eq!(ids.query, "m1_query");
        assert_eq!(ids.items, "m1_items");
        assert!(!ids.shared());
    }
}
