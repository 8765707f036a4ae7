use super::{CoordinationStore, EtcdCoordinationStore, MemoryCoordinationStore};
use crate::{Result, SilverError};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct CoordinationBuilder {
    backend: Option<String>,
    etcd_endpoints: Option<Vec<String>>,
    dial_timeout: Option<Duration>,
}

impl CoordinationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = Some(endpoints);
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(SilverError::Config(
                "coordination backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    fn resolve_dial_timeout(&self) -> Result<Duration> {
        let timeout = self.dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT);
        if timeout.is_zero() {
            return Err(SilverError::Config(
                "coordination dial timeout must be positive".to_string(),
            ));
        }
        Ok(timeout)
    }

    pub async fn build(&self) -> Result<Arc<dyn CoordinationStore>> {
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "etcd" => {
                let endpoints = self.etcd_endpoints.clone().ok_or_else(|| {
                    SilverError::Config("etcd endpoints are required for etcd backend".to_string())
                })?;

                if endpoints.is_empty() {
                    return Err(SilverError::Config(
                        "etcd endpoints cannot be empty for etcd backend".to_string(),
                    ));
                }

                let dial_timeout = self.resolve_dial_timeout()?;
                let store = EtcdCoordinationStore::connect(&endpoints, dial_timeout).await?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryCoordinationStore::new())),
            other => Err(SilverError::Config(format!(
                "unsupported coordination backend: {}",
                other
            ))),
        }
    }
}
