//! Configuration for the Quiver control plane.
//!
//! Every subsystem receives its sub-config struct at construction; there is
//! no process-wide ambient state. Values come from defaults, an optional TOML
//! file, and `QUIVER_*` environment overrides, in that order.

use crate::error::{QuiverError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuiverConfig {
    pub database: DatabaseConfig,
    pub inference: InferenceConfig,
    pub dispatcher: DispatcherConfig,
    pub upsertion: UpsertionConfig,
    pub reindex: ReindexConfig,
    pub improvement: ImprovementConfig,
    pub model_repo: ModelRepoConfig,
    pub api: ApiConfig,
}

/// Metadata and vector store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Prefix of every physical table name.
    pub table_prefix: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/quiver".to_owned(),
            max_connections: 16,
            acquire_timeout_secs: 10,
            table_prefix: "quiver".to_owned(),
        }
    }
}

/// Inference server endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Upper bound on a deployment becoming ready.
    pub deploy_timeout_secs: u64,
    pub ready_poll_interval_secs: u64,
    /// Deployments allowed to run at once.
    pub max_concurrent_deployments: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_owned(),
            request_timeout_secs: 30,
            deploy_timeout_secs: 600,
            ready_poll_interval_secs: 2,
            max_concurrent_deployments: 2,
        }
    }
}

/// Queue dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            max_attempts: 4,
            backoff_base_ms: 200,
            backoff_cap_ms: 10_000,
        }
    }
}

/// Upsertion pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpsertionConfig {
    /// Items per write batch.
    pub batch_size: usize,
    /// Capacity of the channels between pipeline stages.
    pub channel_capacity: usize,
}

impl Default for UpsertionConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            channel_capacity: 4,
        }
    }
}

/// Reindex workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReindexConfig {
    /// Source objects per child upsertion task.
    pub batch_size: usize,
    pub children_poll_secs: u64,
    pub conflict_poll_secs: u64,
    pub conflict_wait_timeout_secs: u64,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            children_poll_secs: 2,
            conflict_poll_secs: 5,
            conflict_wait_timeout_secs: 600,
        }
    }
}

/// Improvement pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovementConfig {
    /// Sessions processed per locked group; bounds memory.
    pub group_size: usize,
    /// Adjustment iterations of the default adjuster.
    pub steps: usize,
    /// Step size of the default adjuster.
    pub step_size: f32,
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            group_size: 32,
            steps: 10,
            step_size: 0.05,
        }
    }
}

/// Shared model repository on the inference filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRepoConfig {
    pub root: PathBuf,
}

impl Default for ModelRepoConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./models"),
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8084".to_owned(),
        }
    }
}

impl QuiverConfig {
    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content)
            .map_err(|e| QuiverError::validation(format!("invalid config file: {e}")))
    }

    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_from(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply `QUIVER_*` overrides through a lookup function.
    pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(url) = get("QUIVER_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(url) = get("QUIVER_INFERENCE_URL") {
            self.inference.base_url = url;
        }
        if let Some(addr) = get("QUIVER_API_BIND") {
            self.api.bind_addr = addr;
        }
        if let Some(root) = get("QUIVER_MODEL_REPO") {
            self.model_repo.root = PathBuf::from(root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = QuiverConfig::default();
        assert!(config.database.max_connections > 0);
        assert!(config.dispatcher.max_attempts > 0);
        assert!(config.upsertion.batch_size > 0);
        assert!(config.improvement.group_size > 0);
    }

    #[test]
    fn partial_file_overlays_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[database]\nurl = \"postgres://db:5432/quiver\"\n\n[reindex]\nbatch_size = 100"
        )
        .unwrap();

        let config = QuiverConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database.url, "postgres://db:5432/quiver");
        assert_eq!(config.reindex.batch_size, 100);
        // Untouched sections keep defaults.
        assert_eq!(config.upsertion.batch_size, 64);
    }

    #[test]
    fn env_overrides() {
        let mut config = QuiverConfig::default();
        config.apply_env_from(|name| match name {
            "QUIVER_DATABASE_URL" => Some("postgres://env/db".to_owned()),
            "QUIVER_API_BIND" => Some("127.0.0.1:9000".to_owned()),
            _ => None,
        });
        assert_eq!(config.database.url, "postgres://env/db");
        assert_eq!(config.api.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.inference.base_url, "http://localhost:8001");
    }
}
