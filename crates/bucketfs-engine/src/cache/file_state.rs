//! Per-key cache state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bucketfs_core::{FsError, FsPath};
use tokio::sync::RwLock;

use super::size_class::Claim;

/// Valid everywhere: no truncation below the backend's length.
pub(crate) const NO_TRUNCATION: u64 = u64::MAX;

/// A cached block of one file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockRef {
    pub claim: Claim,
    /// Millisecond deadline after which a clean block must be refetched.
    pub expires_at: u64,
}

/// Everything the pool knows about one key.
///
/// Guarded by the entry's `RwLock`: readers of cached data share it, and
/// anything that changes blocks, length or dirtiness holds it exclusively.
#[derive(Debug)]
pub(crate) struct FileState {
    /// Size class of every block of this key; chosen with the first block.
    pub class: Option<usize>,
    /// Logical length, when known.
    pub size: Option<u64>,
    /// Until when a clean `size` may be trusted without a stat.
    pub size_valid_until: u64,
    /// Backend bytes at or past this offset read as zero (set by truncate).
    pub remote_valid_len: u64,
    pub blocks: BTreeMap<u64, BlockRef>,
    pub dirty: BTreeSet<u64>,
    /// Length changed locally (truncate or extend) and is not yet flushed.
    pub size_dirty: bool,
    /// When the oldest unflushed change was made.
    pub dirty_since: Option<u64>,
    pub flush_attempts: u32,
    pub next_retry_at: u64,
    pub last_error: Option<FsError>,
    /// Removed from the pool; holders of the entry must look it up again.
    pub detached: bool,
    /// Bumped whenever the local copy or its relation to the backend
    /// changes. Work prepared without the lock checks it before applying.
    pub version: u64,
}

impl Default for FileState {
    fn default() -> Self {
        Self {
            class: None,
            size: None,
            size_valid_until: 0,
            remote_valid_len: NO_TRUNCATION,
            blocks: BTreeMap::new(),
            dirty: BTreeSet::new(),
            size_dirty: false,
            dirty_since: None,
            flush_attempts: 0,
            next_retry_at: 0,
            last_error: None,
            detached: false,
            version: 0,
        }
    }
}

impl FileState {
    pub(crate) fn is_dirty(&self) -> bool {
        self.size_dirty || !self.dirty.is_empty()
    }

    /// Length that can be used without asking the backend.
    pub(crate) fn trusted_size(&self, now: u64) -> Option<u64> {
        if self.is_dirty() || self.size_valid_until > now {
            self.size
        } else {
            None
        }
    }

    pub(crate) fn mark_dirty(&mut self, now: u64) {
        self.dirty_since.get_or_insert(now);
        self.bump();
    }

    pub(crate) fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// State after the backend copy became identical to the local one.
    pub(crate) fn mark_clean(&mut self, size: u64, valid_until: u64) {
        self.dirty.clear();
        self.size_dirty = false;
        self.dirty_since = None;
        self.flush_attempts = 0;
        self.next_retry_at = 0;
        self.last_error = None;
        self.size = Some(size);
        self.size_valid_until = valid_until;
        self.remote_valid_len = NO_TRUNCATION;
        self.bump();
    }

    /// Nothing worth keeping: no blocks and no unflushed changes.
    pub(crate) fn is_idle(&self) -> bool {
        self.blocks.is_empty() && !self.is_dirty()
    }
}

/// Pool entry for one key.
#[derive(Debug)]
pub(crate) struct FileEntry {
    pub path: FsPath,
    pub state: Arc<RwLock<FileState>>,
}

impl FileEntry {
    pub(crate) fn new(path: FsPath) -> Self {
        Self {
            path,
            state: Arc::new(RwLock::new(FileState::default())),
        }
    }
}

/// Block indices covering `start..end` for `block_size`.
pub(crate) fn block_span(start: u64, end: u64, block_size: usize) -> std::ops::Range<u64> {
    let bs = block_size as u64;
    if end <= start {
        return start / bs..start / bs;
    }
    start / bs..end.div_ceil(bs)
}
