//! Configuration file support for the `bucketfs` CLI.
//!
//! The file is TOML. Every section is optional; missing values fall back to
//! the library defaults.
//!
//! # Example configuration
//!
//! ```toml
//! [backend]
//! root_dir = "exports/vm1"
//!
//! [backend.backend]
//! kind = "native"
//! root = "/srv/bucketfs"
//!
//! [backend.retry]
//! max_attempts = 6
//! initial_backoff = "20ms"
//!
//! [engine]
//! attr_ttl = "1s"
//!
//! [engine.cache]
//! capacity_bytes = 67108864
//! ttl = "10s"
//! write_back = true
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use bucketfs_core::{BackendConfig, BackendKind};
use bucketfs_engine::EngineConfig;
use serde::{Deserialize, Serialize};

/// Backend selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendChoice {
    /// Process-local object store (empty on every run)
    Memory,
    /// Directory tree on the local filesystem
    Native,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FileConfig {
    pub backend: BackendConfig,
    pub engine: EngineConfig,
}

impl FileConfig {
    /// Loads `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Applies `--backend` and `--root`. A root without a backend implies native.
    pub fn apply_overrides(&mut self, backend: Option<BackendChoice>, root: Option<PathBuf>) -> Result<()> {
        match (backend, root) {
            (None, None) => {}
            (Some(BackendChoice::Memory), None) => self.backend.backend = BackendKind::Memory,
            (Some(BackendChoice::Memory), Some(_)) => bail!("--root only applies to the native backend"),
            (Some(BackendChoice::Native) | None, Some(root)) => {
                self.backend.backend = BackendKind::Native { root };
            }
            (Some(BackendChoice::Native), None) => {
                if !matches!(self.backend.backend, BackendKind::Native { .. }) {
                    bail!("--backend native needs --root or a native root in the config file");
                }
            }
        }
        Ok(())
    }
}
