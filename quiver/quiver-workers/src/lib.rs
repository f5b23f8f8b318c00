//! Worker pools of the Quiver control plane: upsertion, deletion, reindex and
//! improvement workflows, inference dispatch, and model deploy/undeploy under
//! per-model file locks.

pub mod adjust;
pub mod context;
pub mod delete;
pub mod deploy;
pub mod improve;
pub mod inference;
pub mod reindex;
pub mod upsert;

pub use adjust::IterativeAdjuster;
pub use context::WorkerContext;
pub use delete::{DeletionActor, DeployActor, UndeployActor};
pub use deploy::ModelDeployer;
pub use improve::ImproveActor;
pub use inference::{HttpInferenceClient, MockInferenceClient};
pub use reindex::ReindexActor;
pub use upsert::UpsertionActor;

use std::sync::Arc;

/// Register every worker actor on the context's dispatcher.
pub fn register_workers(ctx: &Arc<WorkerContext>) {
    let dispatcher = &ctx.dispatcher;
    dispatcher.register(Arc::new(UpsertionActor::new(Arc::clone(ctx))));
    dispatcher.register(Arc::new(DeletionActor::new(Arc::clone(ctx))));
    dispatcher.register(Arc::new(ReindexActor::new(Arc::clone(ctx))));
    dispatcher.register(Arc::new(DeployActor::new(Arc::clone(ctx))));
    dispatcher.register(Arc::new(UndeployActor::new(Arc::clone(ctx))));
    dispatcher.register(Arc::new(ImproveActor::new(Arc::clone(ctx))));
}
