pub mod cat;
pub mod ls;
pub mod mkdir;
pub mod mv;
pub mod rm;
pub mod stat;
pub mod stats;
pub mod write;

use anyhow::{Context, Result};
use bucketfs_core::FsPath;

/// Parses a guest path, accepting `test.txt` as `/test.txt`.
pub fn parse_path(path: &str) -> Result<FsPath> {
    let normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    FsPath::parse(&normalized).with_context(|| format!("Invalid path: {path}"))
}
