//! Directory entries derived live from backend metadata.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::path::FsPath;

/// Kind of a namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn is_dir(self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::File => f.write_str("file"),
            EntryKind::Directory => f.write_str("directory"),
        }
    }
}

/// One file or directory as the backend reports it right now.
///
/// Never cached: every lookup, getattr and readdir builds fresh entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: FsPath,
    pub kind: EntryKind,
    /// Object length for files, 0 for directories.
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

impl DirectoryEntry {
    /// Entry for a directory with no backend metadata (root, implicit prefixes).
    pub fn directory(path: FsPath) -> Self {
        Self {
            name: path.name().unwrap_or("/").to_string(),
            path,
            kind: EntryKind::Directory,
            size: 0,
            mtime: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}
