//! Storage backends.
//!
//! An [`ObjectBackend`] speaks in flat keys and knows nothing about paths;
//! the [`BackendExecutor`](crate::executor::BackendExecutor) layers the
//! directory policy and retries on top of it.
//!
//! Directory-shaped keys end in `/`. Object stores keep them as zero-byte
//! marker objects; the native backend maps them to real directories.

mod memory;
mod native;
#[cfg(feature = "s3")]
mod s3;

use std::io;
use std::ops::Range;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use memory::MemoryBackend;
pub use native::NativeBackend;
#[cfg(feature = "s3")]
pub use s3::{S3Backend, S3Options};

/// Metadata for one key as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<SystemTime>,
    /// True for directory markers, common prefixes and native directories.
    pub is_dir: bool,
}

impl ObjectMeta {
    /// Metadata for a directory-shaped key with nothing else known.
    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            last_modified: None,
            is_dir: true,
        }
    }
}

/// Failure category reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    NotFound,
    AlreadyExists,
    NotEmpty,
    Unsupported,
    /// Timeouts, throttling, dropped connections: worth retrying.
    Transient,
    Fatal,
}

/// Error returned by an [`ObjectBackend`] call.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    kind: BackendErrorKind,
    message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(key: &str) -> Self {
        Self::new(BackendErrorKind::NotFound, format!("no object at {key:?}"))
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Fatal, message)
    }

    pub fn unsupported(what: &str) -> Self {
        Self::new(BackendErrorKind::Unsupported, format!("{what} is not supported"))
    }

    pub fn kind(&self) -> BackendErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == BackendErrorKind::NotFound
    }
}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::NotFound => BackendErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => BackendErrorKind::AlreadyExists,
            io::ErrorKind::DirectoryNotEmpty => BackendErrorKind::NotEmpty,
            io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => BackendErrorKind::Transient,
            io::ErrorKind::Unsupported => BackendErrorKind::Unsupported,
            _ => BackendErrorKind::Fatal,
        };
        Self::new(kind, e.to_string())
    }
}

/// Result type for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Flat key capability set every storage backend provides.
#[async_trait]
pub trait ObjectBackend: Send + Sync + std::fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Metadata for exactly `key`.
    async fn stat(&self, key: &str) -> BackendResult<ObjectMeta>;

    /// Object bytes, optionally limited to `range` (clamped to the object length).
    async fn get(&self, key: &str, range: Option<Range<u64>>) -> BackendResult<Bytes>;

    /// Replaces the whole object at `key`. Directory-shaped keys create a directory.
    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()>;

    /// Removes `key`. Directory-shaped keys remove the (empty) directory.
    async fn delete(&self, key: &str) -> BackendResult<()>;

    /// Entries under the directory key `prefix`.
    ///
    /// Non-recursive listings return immediate children only, with nested
    /// prefixes collapsed into directory-shaped entries. Recursive listings
    /// return every key below `prefix`. The marker for `prefix` itself may
    /// appear in either.
    async fn list(&self, prefix: &str, recursive: bool) -> BackendResult<Vec<ObjectMeta>>;

    /// Server-side copy of a file key.
    async fn copy(&self, from: &str, to: &str) -> BackendResult<()> {
        let data = self.get(from, None).await?;
        self.put(to, data).await
    }

    /// Atomic rename, for backends that have one.
    async fn rename(&self, _from: &str, _to: &str) -> BackendResult<()> {
        Err(BackendError::unsupported("rename"))
    }
}

/// Clamps a requested byte range to an object of length `len`.
pub(crate) fn clamp_range(range: Option<Range<u64>>, len: usize) -> Range<usize> {
    match range {
        None => 0..len,
        Some(r) => {
            let start = (r.start as usize).min(len);
            let end = (r.end as usize).clamp(start, len);
            start..end
        }
    }
}
