//! Worker wiring: one explicit context struct holding every subsystem handle.
//!
//! Subsystems are independent handles passed in at construction; there is no
//! process-wide ambient state.

use quiver_core::config::QuiverConfig;
use quiver_core::error::{QuiverError, Result};
use quiver_core::plugin::{PluginRegistry, StaticPlugin};
use quiver_core::traits::{ClickstreamStore, InferenceClient, TaskStore, VectorStore};
use quiver_core::types::{CollectionInfo, CollectionNamespace};
use quiver_clickstream::InMemoryClickstreamStore;
use quiver_store::{CollectionCache, CollectionLifecycle, InMemoryMetadataStore, InMemoryVectorStore};
use quiver_tasks::{Dispatcher, InMemoryTaskStore};
use std::sync::Arc;

use crate::deploy::ModelDeployer;
use crate::inference::MockInferenceClient;

/// Shared handles of every worker.
pub struct WorkerContext {
    pub config: QuiverConfig,
    pub plugins: Arc<PluginRegistry>,
    pub tasks: Arc<dyn TaskStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub cache: Arc<CollectionCache>,
    pub vectors: Arc<dyn VectorStore>,
    pub lifecycle: Arc<CollectionLifecycle>,
    pub categories_lifecycle: Arc<CollectionLifecycle>,
    pub clickstream: Arc<dyn ClickstreamStore>,
    pub inference: Arc<dyn InferenceClient>,
    pub deployer: Arc<ModelDeployer>,
}

impl WorkerContext {
    /// Lifecycle manager of one namespace.
    pub fn lifecycle_for(&self, namespace: CollectionNamespace) -> &Arc<CollectionLifecycle> {
        match namespace {
            CollectionNamespace::Primary => &self.lifecycle,
            CollectionNamespace::Categories => &self.categories_lifecycle,
        }
    }

    /// Resolve the regular collection a task targets: the explicit model if
    /// given, else the namespace's blue regular collection.
    pub fn resolve_regular(
        &self,
        embedding_model_id: Option<&str>,
        namespace: CollectionNamespace,
    ) -> Result<CollectionInfo> {
        let (regular, _) = namespace.kinds();
        match embedding_model_id {
            Some(id) => self
                .cache
                .get_with_kind(id, regular)
                .ok_or_else(|| QuiverError::not_found("collection", id)),
            None => self
                .cache
                .get_blue(regular)
                .ok_or_else(|| QuiverError::not_found("blue collection", regular.as_str())),
        }
    }

    /// Fully in-memory context for tests and local development: in-memory
    /// stores, mock inference, and a model repository under the configured
    /// root.
    pub async fn in_memory(config: QuiverConfig, dimension: usize) -> Result<Arc<Self>> {
        let plugins = Arc::new(PluginRegistry::new());
        plugins.register(Arc::new(StaticPlugin::new("static_text")));

        let tasks: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = Arc::new(Dispatcher::new(&config.dispatcher, Arc::clone(&tasks)));
        let cache = Arc::new(CollectionCache::new(Arc::new(InMemoryMetadataStore::new())).await?);
        let vectors: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let inference: Arc<dyn InferenceClient> = Arc::new(MockInferenceClient::new(dimension));

        let lifecycle = Arc::new(CollectionLifecycle::new(
            Arc::clone(&cache),
            Arc::clone(&vectors),
            CollectionNamespace::Primary,
        ));
        let categories_lifecycle = Arc::new(CollectionLifecycle::new(
            Arc::clone(&cache),
            Arc::clone(&vectors),
            CollectionNamespace::Categories,
        ));
        let deployer = Arc::new(ModelDeployer::new(
            config.model_repo.root.clone(),
            Arc::clone(&inference),
            config.inference.clone(),
        )?);

        Ok(Arc::new(Self {
            config,
            plugins,
            tasks,
            dispatcher,
            cache,
            vectors,
            lifecycle,
            categories_lifecycle,
            clickstream: Arc::new(InMemoryClickstreamStore::new()),
            inference,
            deployer,
        }))
    }
}
