//! Error taxonomy shared by every bucketfs layer.
//!
//! Every failure that reaches a transport is one [`FsError`]. Callers that
//! only need the category (for a reply status or an errno) use
//! [`FsError::kind`], which yields the `Copy` [`ErrorKind`].

use std::fmt;

use thiserror::Error;

use crate::entry::EntryKind;

/// Errors surfaced by the namespace engine.
///
/// `Clone` so that a single backend failure can be broadcast to every
/// waiter of a coalesced fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    /// No file or directory exists at the path.
    #[error("No such file or directory: {0}")]
    NotFound(String),

    /// The path already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Directory still has children.
    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Expected a file and found a directory, or the reverse.
    #[error("Expected a {expected} at {path}, found a {found}")]
    TypeMismatch {
        path: String,
        expected: EntryKind,
        found: EntryKind,
    },

    /// Unknown handle, or a handle from an older generation.
    #[error("Invalid or stale handle {id} (generation {generation})")]
    InvalidHandle { id: u64, generation: u64 },

    /// Malformed name or an impossible request (e.g. renaming a directory into itself).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation outside the supported set.
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// A transient backend failure. Retried internally and never returned
    /// to a transport; kept in the taxonomy so retry code can name it.
    #[error("Transient backend failure during {op} on {key:?}: {message}")]
    BackendTransient {
        op: &'static str,
        key: String,
        message: String,
    },

    /// Non-transient backend failure, or retries exhausted.
    #[error("Backend failure during {op} on {key:?}: {message}")]
    BackendFatal {
        op: &'static str,
        key: String,
        message: String,
    },

    /// No block could be reclaimed in a size class. Internal: the cache
    /// resolves it by writing through, so it never reaches a transport.
    #[error("Cache exhausted for {block_size}-byte size class")]
    CacheExhausted { block_size: usize },
}

/// Category of an [`FsError`], used as the reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NotEmpty,
    /// Expected a file, found a directory.
    IsDirectory,
    /// Expected a directory, found a file.
    NotDirectory,
    InvalidHandle,
    InvalidArgument,
    Unsupported,
    BackendTransient,
    BackendFatal,
    CacheExhausted,
}

impl FsError {
    /// Builds a type mismatch where a file was expected.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        FsError::TypeMismatch {
            path: path.into(),
            expected: EntryKind::File,
            found: EntryKind::Directory,
        }
    }

    /// Builds a type mismatch where a directory was expected.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        FsError::TypeMismatch {
            path: path.into(),
            expected: EntryKind::Directory,
            found: EntryKind::File,
        }
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotFound(_) => ErrorKind::NotFound,
            FsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FsError::NotEmpty(_) => ErrorKind::NotEmpty,
            FsError::TypeMismatch {
                expected: EntryKind::File,
                ..
            } => ErrorKind::IsDirectory,
            FsError::TypeMismatch {
                expected: EntryKind::Directory,
                ..
            } => ErrorKind::NotDirectory,
            FsError::InvalidHandle { .. } => ErrorKind::InvalidHandle,
            FsError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FsError::Unsupported(_) => ErrorKind::Unsupported,
            FsError::BackendTransient { .. } => ErrorKind::BackendTransient,
            FsError::BackendFatal { .. } => ErrorKind::BackendFatal,
            FsError::CacheExhausted { .. } => ErrorKind::CacheExhausted,
        }
    }

    /// Converts this error to a libc error code.
    pub fn to_errno(&self) -> i32 {
        self.kind().to_errno()
    }
}

impl ErrorKind {
    /// Converts this category to a libc error code.
    pub fn to_errno(self) -> i32 {
        match self {
            ErrorKind::NotFound => libc::ENOENT,
            ErrorKind::AlreadyExists => libc::EEXIST,
            ErrorKind::NotEmpty => libc::ENOTEMPTY,
            ErrorKind::IsDirectory => libc::EISDIR,
            ErrorKind::NotDirectory => libc::ENOTDIR,
            ErrorKind::InvalidHandle => libc::ESTALE,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::Unsupported => libc::ENOSYS,
            ErrorKind::BackendTransient => libc::EAGAIN,
            ErrorKind::BackendFatal => libc::EIO,
            ErrorKind::CacheExhausted => libc::ENOSPC,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::NotEmpty => "not empty",
            ErrorKind::IsDirectory => "is a directory",
            ErrorKind::NotDirectory => "not a directory",
            ErrorKind::InvalidHandle => "invalid handle",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::BackendTransient => "backend transient",
            ErrorKind::BackendFatal => "backend fatal",
            ErrorKind::CacheExhausted => "cache exhausted",
        };
        f.write_str(name)
    }
}

/// Result type for namespace operations.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound("/a".into()).to_errno(), libc::ENOENT);
        assert_eq!(FsError::AlreadyExists("/a".into()).to_errno(), libc::EEXIST);
        assert_eq!(FsError::NotEmpty("/a".into()).to_errno(), libc::ENOTEMPTY);
        assert_eq!(
            FsError::InvalidHandle { id: 7, generation: 1 }.to_errno(),
            libc::ESTALE
        );
        assert_eq!(
            FsError::BackendFatal {
                op: "put",
                key: "a".into(),
                message: "boom".into()
            }
            .to_errno(),
            libc::EIO
        );
    }

    #[test]
    fn test_type_mismatch_direction() {
        assert_eq!(FsError::is_a_directory("/d").to_errno(), libc::EISDIR);
        assert_eq!(FsError::not_a_directory("/f").to_errno(), libc::ENOTDIR);
        assert_eq!(FsError::is_a_directory("/d").kind(), ErrorKind::IsDirectory);
    }

    #[test]
    fn test_display_includes_context() {
        let e = FsError::not_a_directory("/a/file.txt");
        let msg = e.to_string();
        assert!(msg.contains("/a/file.txt"));
        assert!(msg.contains("directory"));

        let e = FsError::CacheExhausted { block_size: 4096 };
        assert!(e.to_string().contains("4096"));
    }
}
