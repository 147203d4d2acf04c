//! Testing utilities for engine and backend tests.
//!
//! - **Instrumented backend**: counts calls per capability, injects
//!   failures and latency in front of any [`ObjectBackend`](crate::backend::ObjectBackend)
//! - **Generators**: deterministic and random payloads sized around the
//!   default cache size classes
//!
//! # Usage
//!
//! ```ignore
//! use bucketfs_core::testing::{InstrumentedBackend, Capability, random_bytes};
//!
//! let backend = InstrumentedBackend::memory();
//! backend.fail_next(Capability::Delete, 1, BackendErrorKind::Fatal);
//! ```

pub mod generators;
mod instrumented;

pub use generators::{SIZE_CLASS_SAMPLES, patterned, random_bytes};
pub use instrumented::{Capability, CallCounts, InstrumentedBackend};
