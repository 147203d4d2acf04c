//! Namespace primitives for exposing object storage as a hierarchical filesystem.
//!
//! This crate holds everything below the cache: how paths become keys, how
//! keys are stored, and how backend failures become filesystem errors.
//!
//! # Components
//!
//! ## Namespace
//!
//! - [`FsPath`] - Absolute, normalized guest path
//! - [`KeyMapper`] - Pure, reversible path to backend key mapping
//! - [`DirectoryEntry`] / [`EntryKind`] - Live entry metadata
//!
//! ## Storage
//!
//! - [`ObjectBackend`] - Flat key capability set (stat/get/put/delete/list)
//! - [`MemoryBackend`], [`NativeBackend`] and, with the `s3` feature,
//!   `S3Backend`
//! - [`BackendExecutor`] - Retries, directory emulation and error mapping
//! - [`RetryPolicy`] - Bounded exponential backoff with jitter
//!
//! ## Errors
//!
//! [`FsError`] is the single error type every operation returns. Each variant
//! maps to one POSIX errno through [`FsError::to_errno`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bucketfs_core::{BackendExecutor, FsPath, MemoryBackend, RetryPolicy};
//!
//! # tokio_test_block_on(async {
//! let exec = BackendExecutor::object_store(Arc::new(MemoryBackend::new()), "tenant-a", RetryPolicy::none());
//! let dir = FsPath::parse("/docs").unwrap();
//! exec.mkdir(&dir).await.unwrap();
//! assert!(exec.lookup(&dir).await.unwrap().is_dir());
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod config;
mod entry;
mod error;
pub mod executor;
pub mod path;
pub mod retry;

/// Testing utilities shared by the engine and backend test suites.
///
/// Provides an instrumented backend wrapper (call counters, fault
/// injection, latency) and payload generators.
pub mod testing;

pub use backend::{BackendError, BackendErrorKind, MemoryBackend, NativeBackend, ObjectBackend, ObjectMeta};
pub use config::{BackendConfig, BackendKind, ConfigError};
pub use entry::{DirectoryEntry, EntryKind};
pub use error::{ErrorKind, FsError, FsResult};
pub use executor::{BackendExecutor, Strategy};
pub use path::{FsPath, KeyMapper};
pub use retry::RetryPolicy;
