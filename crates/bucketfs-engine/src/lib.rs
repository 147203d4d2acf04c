//! Namespace engine: handles, a size-classed write-back cache and the
//! operation dispatcher that ties them to a [`bucketfs_core`] backend.
//!
//! # Components
//!
//! - [`HandleTable`] - Numeric handles with generations and reference counts
//! - [`CachePool`] - Size-classed block cache
//!   - lock-free free list per size class
//!   - single-flight whole-object fetches
//!   - TTL invalidation, LRU eviction, write-back with background sweep
//! - [`Engine`] - Answers decoded [`Operation`]s with [`Reply`] records
//! - [`spawn_dispatcher`] - mpsc front end running each operation as a task
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bucketfs_core::{BackendExecutor, MemoryBackend, RetryPolicy};
//! use bucketfs_engine::{Engine, EngineConfig, OpenMode, Operation, Response};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let exec = BackendExecutor::object_store(Arc::new(MemoryBackend::new()), "", RetryPolicy::default());
//! let engine = Engine::new(exec, EngineConfig::default()).unwrap();
//!
//! let Response::Created(file) = engine
//!     .execute(Operation::Create {
//!         parent: engine.root(),
//!         name: "hello.txt".into(),
//!         mode: OpenMode::READ_WRITE,
//!         exclusive: true,
//!     })
//!     .await
//!     .unwrap()
//! else {
//!     unreachable!()
//! };
//! engine
//!     .execute(Operation::Write { handle: file.handle, offset: 0, data: "hi".into() })
//!     .await
//!     .unwrap();
//! let Response::Data(data) = engine
//!     .execute(Operation::Read { handle: file.handle, offset: 0, length: 16 })
//!     .await
//!     .unwrap()
//! else {
//!     unreachable!()
//! };
//! assert_eq!(data, "hi");
//! # });
//! ```

#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod handle_table;
pub mod request;
pub mod stats;

pub use cache::{CachePool, KeyGuard, MAX_FILE_SIZE, SweepReport};
pub use config::{CacheConfig, EngineConfig};
pub use dispatch::{DispatchClient, Submission, spawn_dispatcher};
pub use engine::Engine;
pub use handle_table::{HandleId, HandleTable, OpenMode, ROOT_ID, ResolvedHandle};
pub use request::{Attributes, DirEntryReply, EntryReply, Operation, Reply, Response, Status};
pub use stats::{ClassUsage, PoolStats, PoolStatsSnapshot, format_bytes};
