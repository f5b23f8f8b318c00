//! Quiver control plane server.

use anyhow::{Context, Result};
use clap::Parser;
use quiver_api::{ApiContext, build_router};
use quiver_clickstream::PgClickstreamStore;
use quiver_core::QuiverConfig;
use quiver_core::plugin::{PluginRegistry, StaticPlugin};
use quiver_core::traits::{ClickstreamStore, InferenceClient, TaskStore, VectorStore};
use quiver_core::types::CollectionNamespace;
use quiver_store::{CollectionCache, CollectionLifecycle, PgMetadataStore, PgVectorStore, schema};
use quiver_tasks::{Dispatcher, PgTaskStore};
use quiver_workers::{HttpInferenceClient, ModelDeployer, WorkerContext, register_workers};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quiver-server", about = "Quiver vector-search control plane")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, env = "QUIVER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = QuiverConfig::load(args.config.as_deref()).context("loading configuration")?;

    let pool = quiver_store::connect(&config.database)
        .await
        .context("connecting to Postgres")?;
    let prefix = config.database.table_prefix.clone();
    schema::ensure_schema(&pool, &prefix)
        .await
        .context("ensuring metadata schema")?;

    let task_store = PgTaskStore::new(pool.clone(), &prefix);
    task_store.ensure_schema().await.context("ensuring task schema")?;
    let clickstream_store = PgClickstreamStore::new(pool.clone(), prefix.clone());
    clickstream_store
        .ensure_schema()
        .await
        .context("ensuring clickstream schema")?;

    let plugins = Arc::new(PluginRegistry::new());
    plugins.register(Arc::new(StaticPlugin::new("static_text")));

    let tasks: Arc<dyn TaskStore> = Arc::new(task_store);
    let dispatcher = Arc::new(Dispatcher::new(&config.dispatcher, Arc::clone(&tasks)));
    let cache = Arc::new(
        CollectionCache::new(Arc::new(PgMetadataStore::new(pool.clone(), prefix.clone()))).await?,
    );
    let vectors: Arc<dyn VectorStore> = Arc::new(PgVectorStore::new(pool, prefix));
    let inference: Arc<dyn InferenceClient> = Arc::new(HttpInferenceClient::new(&config.inference)?);
    let clickstream: Arc<dyn ClickstreamStore> = Arc::new(clickstream_store);

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

    let bind_addr = config.api.bind_addr.clone();
    let ctx = Arc::new(WorkerContext {
        config,
        plugins,
        tasks,
        dispatcher,
        cache,
        vectors,
        lifecycle,
        categories_lifecycle,
        clickstream,
        inference,
        deployer,
    });

    register_workers(&ctx);
    let resent = ctx.dispatcher.resend_pending().await?;
    if resent > 0 {
        info!(resent, "Re-queued pending tasks from a previous run");
    }

    let router = build_router(ApiContext {
        ctx: Arc::clone(&ctx),
    });
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "Quiver control plane listening");
    axum::serve(listener, router).await.context("serving")?;

    Ok(())
}
