//! Common test utilities for engine integration tests.

pub mod harness;

pub use harness::TestEngine;

#[allow(unused_imports)]
pub use bucketfs_core::testing::{Capability, patterned, random_bytes};
