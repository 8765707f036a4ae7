use serde::{Deserialize, Serialize};
use silver_core::{DiscoveryOptions, Result, SilverError};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    pub backend: CoordinationBackend,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    pub metadata_prefix: String,
    pub node_prefix: String,
}

impl CoordinationConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

fn default_dial_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    Etcd,
    Memory,
}

impl CoordinationBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Etcd => "etcd",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub directories: Vec<PathBuf>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("SILVER"))
            .build()
            .map_err(|e| SilverError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| SilverError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.directories.is_empty() {
            return Err(SilverError::Config(
                "storage.directories cannot be empty".to_string(),
            ));
        }

        if self.coordination.backend == CoordinationBackend::Etcd
            && self.coordination.endpoints.is_empty()
        {
            return Err(SilverError::Config(
                "coordination.endpoints are required for the etcd backend".to_string(),
            ));
        }

        for (name, prefix) in [
            ("metadata_prefix", &self.coordination.metadata_prefix),
            ("node_prefix", &self.coordination.node_prefix),
        ] {
            if !prefix.starts_with('/') {
                return Err(SilverError::Config(format!(
                    "coordination.{} must start with '/': {}",
                    name, prefix
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silver.yaml");
        std::fs::write(&path, contents).unwrap();
        let path = path.to_string_lossy().to_string();
        (dir, path)
    }

    #[test]
    fn test_from_file_with_defaults() {
        let (_dir, path) = write_config(
            r#"
coordination:
  backend: etcd
  endpoints: ["127.0.0.1:2379"]
  metadata_prefix: /silver/meta
  node_prefix: /silver/nodes
storage:
  directories: [/data/d0, /data/d1]
"#,
        );

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.coordination.backend, CoordinationBackend::Etcd);
        assert_eq!(config.coordination.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.storage.directories.len(), 2);

        let options = config.discovery.options();
        assert_eq!(options.initial_backoff, Duration::from_millis(100));
        assert_eq!(options.max_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_incomplete_config() {
        let (_dir, path) = write_config(
            r#"
coordination:
  backend: etcd
  metadata_prefix: /silver/meta
  node_prefix: /silver/nodes
storage:
  directories: [/data/d0]
"#,
        );
        assert!(matches!(
            Config::from_file(&path),
            Err(SilverError::Config(_))
        ));

        let (_dir, path) = write_config(
            r#"
coordination:
  backend: memory
  metadata_prefix: silver/meta
  node_prefix: /silver/nodes
storage:
  directories: [/data/d0]
"#,
        );
        assert!(matches!(
            Config::from_file(&path),
            Err(SilverError::Config(_))
        ));
    }
}
