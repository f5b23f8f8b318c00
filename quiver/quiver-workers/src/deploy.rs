//! Model deploy/undeploy on the shared inference filesystem.
//!
//! Multiple inference workers share the model repository, so every mutation
//! of a model's on-disk artifacts runs under an exclusive file lock named
//! after the model id. Deploy stages artifacts into a temp file and renames
//! them into place, then polls readiness until the configured timeout.

use fs2::FileExt;
use quiver_core::config::InferenceConfig;
use quiver_core::error::{QuiverError, Result};
use quiver_core::plugin::InferenceModelIds;
use quiver_core::traits::InferenceClient;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deployment record written next to a model's directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployManifest {
    pub model_id: String,
    pub plugin_name: String,
    pub query_model: String,
    pub items_model: String,
    /// Whether the items model belongs to this deployment alone.
    pub items_exclusive: bool,
}

/// Exclusive per-model file lock, released on drop.
struct ModelLock {
    file: fs::File,
    path: PathBuf,
}

impl ModelLock {
    async fn acquire(lock_dir: &Path, model_id: &str) -> Result<Self> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{model_id}.lock"));
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        // fs2 locks block the thread, so take them off the runtime.
        let file = tokio::task::spawn_blocking(move || {
            file.lock_exclusive().map(|()| file)
        })
        .await
        .map_err(|e| QuiverError::internal(format!("lock task join: {e}")))??;

        debug!(path = %path.display(), "Acquired model lock");
        Ok(Self { file, path })
    }
}

impl Drop for ModelLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release model lock");
        }
    }
}

/// Deploys and removes models in the shared repository.
pub struct ModelDeployer {
    repo_root: PathBuf,
    inference: Arc<dyn InferenceClient>,
    http: reqwest::Client,
    config: InferenceConfig,
    slots: tokio::sync::Semaphore,
}

impl ModelDeployer {
    pub fn new(
        repo_root: PathBuf,
        inference: Arc<dyn InferenceClient>,
        config: InferenceConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| QuiverError::internal(format!("building artifact client: {e}")))?;
        let slots = tokio::sync::Semaphore::new(config.max_concurrent_deployments.max(1));
        Ok(Self {
            repo_root,
            inference,
            http,
            config,
            slots,
        })
    }

    fn lock_dir(&self) -> PathBuf {
        self.repo_root.join(".locks")
    }

    fn model_dir(&self, model_id: &str) -> PathBuf {
        self.repo_root.join(model_id)
    }

    fn manifest_path(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join("manifest.json")
    }

    /// Deploy a model: stage artifacts, write the manifest atomically, and
    /// block until the inference server reports it ready.
    pub async fn deploy(
        &self,
        model_id: &str,
        plugin_name: &str,
        ids: &InferenceModelIds,
        artifact_url: Option<&str>,
    ) -> Result<()> {
        let _slot = self
            .slots
            .try_acquire()
            .map_err(|_| QuiverError::capacity("too many concurrent deployments"))?;
        let _lock = ModelLock::acquire(&self.lock_dir(), model_id).await?;
        info!(model_id, plugin_name, "Deploying model");

        let model_dir = self.model_dir(model_id);
        fs::create_dir_all(model_dir.join("query"))?;
        fs::create_dir_all(model_dir.join("items"))?;

        if let Some(url) = artifact_url {
            self.download_artifact(url, &model_dir).await?;
        }

        let manifest = DeployManifest {
            model_id: model_id.to_owned(),
            plugin_name: plugin_name.to_owned(),
            query_model: ids.query.clone(),
            items_model: ids.items.clone(),
            items_exclusive: !ids.shared(),
        };
        write_atomically(
            &self.manifest_path(model_id),
            serde_json::to_vec_pretty(&manifest)?.as_slice(),
        )?;

        self.wait_until_ready(plugin_name, ids).await
    }

    /// Remove a model's directories. A shared items model survives unless it
    /// is exclusive to this deployment.
    pub async fn undeploy(&self, model_id: &str) -> Result<()> {
        let _lock = ModelLock::acquire(&self.lock_dir(), model_id).await?;
        info!(model_id, "Undeploying model");

        let model_dir = self.model_dir(model_id);
        if !model_dir.exists() {
            return Err(QuiverError::not_found("deployment", model_id));
        }

        let items_exclusive = match fs::read(self.manifest_path(model_id)) {
            Ok(bytes) => serde_json::from_slice::<DeployManifest>(&bytes)
                .map(|m| m.items_exclusive)
                .unwrap_or(true),
            Err(_) => true,
        };

        remove_dir_if_present(&model_dir.join("query"))?;
        if items_exclusive {
            remove_dir_if_present(&model_dir.join("items"))?;
        }

        // Drop the whole model directory once nothing shared remains in it.
        if !model_dir.join("items").exists() {
            remove_dir_if_present(&model_dir)?;
        } else {
            let _ = fs::remove_file(self.manifest_path(model_id));
        }
        Ok(())
    }

    /// Whether both hosted models of a deployment answer ready.
    pub async fn is_ready(&self, plugin_name: &str, ids: &InferenceModelIds) -> Result<bool> {
        if !self.inference.is_model_ready(plugin_name, &ids.query).await? {
            return Ok(false);
        }
        if ids.shared() {
            return Ok(true);
        }
        self.inference.is_model_ready(plugin_name, &ids.items).await
    }

    async fn wait_until_ready(&self, plugin_name: &str, ids: &InferenceModelIds) -> Result<()> {
        let deadline = Duration::from_secs(self.config.deploy_timeout_secs);
        let poll = Duration::from_secs(self.config.ready_poll_interval_secs.max(1));

        let wait = async {
            loop {
                match self.is_ready(plugin_name, ids).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(e) if e.is_retryable() => {
                        debug!(error = %e, "Readiness probe failed, retrying");
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(poll).await;
            }
        };

        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| {
                QuiverError::timeout(format!(
                    "model {} not ready after {}s",
                    ids.query, self.config.deploy_timeout_secs
                ))
            })?
    }

    async fn download_artifact(&self, url: &str, model_dir: &Path) -> Result<()> {
        debug!(url, "Downloading model artifact");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| QuiverError::unavailable(format!("artifact download: {e}")))?;
        if !response.status().is_success() {
            return Err(QuiverError::unavailable(format!(
                "artifact download: {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| QuiverError::unavailable(format!("artifact download: {e}")))?;

        write_atomically(&model_dir.join("artifact.bin"), &bytes)
    }
}

/// Write through a temp file in the target directory plus rename.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| QuiverError::internal("artifact path has no parent"))?;
    fs::create_dir_all(dir)?;
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    fs::write(temp.path(), bytes)?;
    temp.persist(path)
        .map_err(|e| QuiverError::Io(e.error))?;
    Ok(())
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::MockInferenceClient;
    use quiver_core::config::InferenceConfig;

    fn deployer(root: &Path, mock: Arc<MockInferenceClient>) -> ModelDeployer {
        let config = InferenceConfig {
            deploy_timeout_secs: 2,
            ready_poll_interval_secs: 1,
            ..Default::default()
        };
        ModelDeployer::new(root.to_path_buf(), mock, config).unwrap()
    }

    fn ids(shared: bool) -> InferenceModelIds {
        InferenceModelIds {
            query: "m1_query".to_owned(),
            items: if shared { "m1_query" } else { "m1_items" }.to_owned(),
        }
    }

    #[tokio::test]
    async fn deploy_writes_manifest_and_waits_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockInferenceClient::new(3));
        let deployer = deployer(dir.path(), Arc::clone(&mock));

        deployer
            .deploy("m1", "static_text", &ids(false), None)
            .await
            .unwrap();

        let manifest: DeployManifest = serde_json::from_slice(
            &fs::read(dir.path().join("m1").join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert!(manifest.items_exclusive);
        assert!(dir.path().join("m1").join("query").exists());
    }

    #[tokio::test]
    async fn deploy_times_out_when_never_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockInferenceClient::new(3));
        mock.set_ready("m1_query", false);
        let deployer = deployer(dir.path(), Arc::clone(&mock));

        let err = deployer
            .deploy("m1", "static_text", &ids(true), None)
            .await
            .unwrap_err();
        assert!(matches!(err, QuiverError::Timeout(_)));
    }

    #[tokio::test]
    async fn undeploy_removes_exclusive_items() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockInferenceClient::new(3));
        let deployer = deployer(dir.path(), Arc::clone(&mock));

        deployer
            .deploy("m1", "static_text", &ids(false), None)
            .await
            .unwrap();
        deployer.undeploy("m1").await.unwrap();
        assert!(!dir.path().join("m1").exists());

        assert!(deployer.undeploy("m1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn undeploy_keeps_shared_items_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockInferenceClient::new(3));
        let deployer = deployer(dir.path(), Arc::clone(&mock));

        deployer
            .deploy("m1", "static_text", &ids(true), None)
            .await
            .unwrap();
        // Another deployment still uses the items directory.
        fs::write(dir.path().join("m1").join("items").join("weights"), b"w").unwrap();
        let manifest_path = dir.path().join("m1").join("manifest.json");
        let mut manifest: DeployManifest =
            serde_json::from_slice(&fs::read(&manifest_path).unwrap()).unwrap();
        manifest.items_exclusive = false;
        fs::write(&manifest_path, serde_json::to_vec(&manifest).unwrap()).unwrap();

        deployer.undeploy("m1").await.unwrap();
        assert!(dir.path().join("m1").join("items").exists());
        assert!(!dir.path().join("m1").join("query").exists());
    }
}
