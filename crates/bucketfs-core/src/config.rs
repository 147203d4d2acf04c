//! Backend selection and connection parameters.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[cfg(feature = "s3")]
use crate::backend::{S3Backend, S3Options};
use crate::backend::{MemoryBackend, NativeBackend};
use crate::executor::BackendExecutor;
use crate::retry::RetryPolicy;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Backend root {path} is not a directory")]
    NotADirectory { path: PathBuf },
}

/// Which storage system to talk to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local object store; contents vanish on exit.
    Memory,
    /// Local or network-mounted directory tree.
    Native { root: PathBuf },
    /// S3-compatible bucket.
    #[cfg(feature = "s3")]
    S3(S3Options),
}

/// Backend configuration.
///
/// ```
/// use bucketfs_core::config::{BackendConfig, BackendKind};
///
/// let config = BackendConfig::default().with_root_dir("exports/vm1");
/// assert_eq!(config.backend, BackendKind::Memory);
/// assert_eq!(config.root_dir, "exports/vm1");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub backend: BackendKind,
    /// Key prefix every path is mapped under (object stores only).
    pub root_dir: String,
    pub retry: RetryPolicy,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            root_dir: String::from("/"),
            retry: RetryPolicy::default(),
        }
    }
}

impl BackendConfig {
    /// Native passthrough over `root`.
    pub fn native(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Native { root: root.into() },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_root_dir(mut self, root_dir: impl Into<String>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if let BackendKind::Native { root } = &self.backend
            && !root.is_dir()
        {
            return Err(ConfigError::NotADirectory { path: root.clone() });
        }
        #[cfg(feature = "s3")]
        if let BackendKind::S3(options) = &self.backend
            && options.bucket.is_empty()
        {
            return Err(ConfigError::InvalidValue {
                field: "backend.bucket",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Validates the configuration and connects the backend.
    pub async fn build(&self) -> Result<BackendExecutor, ConfigError> {
        self.validate()?;
        let retry = self.retry.clone();
        let executor = match &self.backend {
            BackendKind::Memory => {
                BackendExecutor::object_store(Arc::new(MemoryBackend::new()), &self.root_dir, retry)
            }
            BackendKind::Native { root } => {
                BackendExecutor::native(Arc::new(NativeBackend::new(root.clone())), retry)
            }
            #[cfg(feature = "s3")]
            BackendKind::S3(options) => {
                let backend = S3Backend::connect(options).await;
                BackendExecutor::object_store(Arc::new(backend), &self.root_dir, retry)
            }
        };
        info!(backend = executor.backend().name(), root_dir = %self.root_dir, "Backend ready");
        Ok(executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_deserialize_native_with_humantime_retry() {
        let json = r#"{
            "backend": { "kind": "native", "root": "/srv/data" },
            "retry": { "max_attempts": 6, "initial_backoff": "20ms" }
        }"#;
        let config: BackendConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.backend,
            BackendKind::Native {
                root: PathBuf::from("/srv/data")
            }
        );
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(20));
        assert_eq!(config.retry.max_backoff, RetryPolicy::default().max_backoff);
        assert_eq!(config.root_dir, "/");
    }

    #[test]
    fn test_validate_rejects_missing_native_root() {
        let config = BackendConfig::native("/definitely/not/here/bucketfs");
        assert!(matches!(config.validate(), Err(ConfigError::NotADirectory { .. })));
    }

    #[tokio::test]
    async fn test_build_memory_backend() {
        let executor = BackendConfig::default().with_root_dir("pfx").build().await.unwrap();
        assert_eq!(executor.backend().name(), "memory");
        assert_eq!(executor.mapper().prefix(), "pfx/");
    }
}
