//! Size-classed block cache with write-back, TTL invalidation and LRU eviction.
//!
//! # Layout
//!
//! The pool owns one [`SizeClassPool`] per configured block size and a map
//! from path to per-file state. Every block of a file comes from the same
//! class, chosen from the file's length when its first block is allocated.
//! Slots are claimed from a lock-free free list; when it is empty the
//! class is scanned for a victim (clean before dirty, then LRU, then FIFO).
//!
//! # Consistency
//!
//! - Objects are fetched and written whole. A flush assembles the object
//!   from dirty blocks plus backend bytes for everything else.
//! - Clean blocks and a clean file length are trusted for `ttl`; after
//!   that the next read goes back to the backend.
//! - Concurrent fetches of one key share a single backend `get`.
//! - Dirty data is only dropped by a successful flush, an explicit
//!   truncate, or [`CachePool::discard`].
//!
//! # Locking
//!
//! Each file has a `tokio` `RwLock`. Hits take it shared; anything that
//! changes blocks or length takes it exclusively. Eviction only ever
//! `try_write`s a foreign file, so two allocators can never wait on each
//! other. Backend fetches never run under a lock their leader needs.
//!
//! Reads, writes and truncates do their backend round trips without the
//! exclusive lock and then check the key's version before applying what
//! they learned; a changed key sends them round again. Explicit flushes
//! hold the lock shared during the `put`. A successful `put` retires any
//! fetch still in flight for the key, so its bytes are never cached.

mod file_state;
mod free_list;
mod single_flight;
mod size_class;
mod sweeper;

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bucketfs_core::{BackendExecutor, ConfigError, FsError, FsPath, FsResult};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::OwnedRwLockWriteGuard;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::CacheConfig;
use crate::stats::{ClassUsage, PoolStats, PoolStatsSnapshot};
use file_state::{BlockRef, FileEntry, FileState, NO_TRUNCATION, block_span};
use single_flight::{AttachResult, InFlightFetches};
use size_class::{BlockOwner, Claim, SizeClassPool};

pub(crate) use sweeper::Sweeper;

/// Allocation attempts (free list, then one eviction scan) before giving up.
const EVICTION_ROUNDS: usize = 3;

/// Longest delay between background retries of a failing flush.
const MAX_FLUSH_BACKOFF_MS: u64 = 30_000;

/// Attempts at preparing an operation outside the key's lock before it
/// runs entirely under the lock.
const CONTENDED_ROUNDS: usize = 3;

/// Largest file length: the largest value an `off_t` can hold.
pub const MAX_FILE_SIZE: u64 = u64::MAX >> 1;

/// Why a key is being flushed. Only the background sweep spends the key's
/// retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushCause {
    Sweep,
    Explicit,
    Eviction,
}

/// Outcome of trying to take one block away from its key.
enum Reclaim {
    Taken,
    Skipped,
    FlushFailed,
}

/// End of a write of `len` bytes at `offset`, if the file may grow that far.
fn write_end(offset: u64, len: u64) -> FsResult<u64> {
    offset
        .checked_add(len)
        .filter(|&end| end <= MAX_FILE_SIZE)
        .ok_or_else(|| {
            FsError::InvalidArgument(format!(
                "write of {len} bytes at offset {offset} exceeds the largest file size"
            ))
        })
}

/// Whether the block at `block_start` must start from backend bytes before
/// `offset..end` is copied in: it holds backend data below `limit` that the
/// write does not completely replace.
fn needs_backend_bytes(offset: u64, end: u64, block_start: u64, block_size: u64, limit: u64) -> bool {
    block_start < limit && !(offset <= block_start && end >= (block_start + block_size).min(limit))
}

/// What one background sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub flushed: usize,
    pub flush_failures: usize,
    pub expired_blocks: usize,
    pub dropped_files: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Exclusive hold on one key's cache state.
///
/// Used by namespace operations (unlink, rename) that must keep the cache
/// from flushing a key while they change it on the backend.
pub struct KeyGuard<'a> {
    pool: &'a CachePool,
    entry: Arc<FileEntry>,
    state: OwnedRwLockWriteGuard<FileState>,
}

impl KeyGuard<'_> {
    pub fn path(&self) -> &FsPath {
        &self.entry.path
    }

    pub fn is_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    /// Writes pending changes of this key to the backend.
    pub async fn flush(&mut self) -> FsResult<()> {
        self.pool
            .flush_locked(&self.entry.path, &mut self.state, FlushCause::Explicit)
            .await
    }

    /// Drops every block and pending change of this key.
    pub fn discard(mut self) {
        self.pool.detach(&self.entry, &mut self.state);
    }
}

/// The block cache shared by every operation of one engine.
#[derive(Debug)]
pub struct CachePool {
    config: CacheConfig,
    classes: Vec<SizeClassPool>,
    files: DashMap<FsPath, Arc<FileEntry>>,
    inflight: InFlightFetches,
    backend: Arc<BackendExecutor>,
    epoch: Instant,
    ticks: AtomicU64,
    stats: PoolStats,
}

impl CachePool {
    pub fn new(config: CacheConfig, backend: Arc<BackendExecutor>) -> Result<Self, ConfigError> {
        config.validate()?;
        let classes: Vec<SizeClassPool> = config
            .size_classes
            .iter()
            .map(|&block_size| SizeClassPool::new(block_size, config.slots_per_class(block_size)))
            .collect();
        for class in &classes {
            debug!(
                block_size = class.block_size(),
                blocks = class.capacity(),
                "Size class ready"
            );
        }
        info!(
            capacity = config.capacity_bytes,
            classes = classes.len(),
            write_back = config.write_back,
            ttl = ?config.ttl,
            "Cache pool created"
        );
        Ok(Self {
            config,
            classes,
            files: DashMap::new(),
            inflight: InFlightFetches::default(),
            backend,
            epoch: Instant::now(),
            ticks: AtomicU64::new(0),
            stats: PoolStats::default(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<BackendExecutor> {
        &self.backend
    }

    // ---- clock ---------------------------------------------------------

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Monotonic access counter for LRU ordering.
    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn deadline(&self) -> u64 {
        self.now().saturating_add(self.config.ttl.as_millis() as u64)
    }

    // ---- entries -------------------------------------------------------

    fn entry(&self, path: &FsPath) -> Arc<FileEntry> {
        let entry = self
            .files
            .entry(path.clone())
            .or_insert_with(|| Arc::new(FileEntry::new(path.clone())));
        Arc::clone(entry.value())
    }

    fn existing(&self, path: &FsPath) -> Option<Arc<FileEntry>> {
        self.files.get(path).map(|e| Arc::clone(e.value()))
    }

    async fn lock(&self, path: &FsPath) -> (Arc<FileEntry>, OwnedRwLockWriteGuard<FileState>) {
        loop {
            let entry = self.entry(path);
            let guard = Arc::clone(&entry.state).write_owned().await;
            if !guard.detached {
                return (entry, guard);
            }
        }
    }

    /// Locks one key for a namespace operation.
    pub async fn lock_key(&self, path: &FsPath) -> KeyGuard<'_> {
        let (entry, state) = self.lock(path).await;
        KeyGuard {
            pool: self,
            entry,
            state,
        }
    }

    /// Releases every block of `state` and removes the entry from the pool.
    fn detach(&self, entry: &Arc<FileEntry>, state: &mut FileState) {
        self.release_where(state, |_, _, _| true);
        state.size_dirty = false;
        state.dirty_since = None;
        state.detached = true;
        self.files
            .remove_if(&entry.path, |_, current| Arc::ptr_eq(current, entry));
    }

    fn class_for(&self, size: u64) -> usize {
        self.classes
            .iter()
            .position(|c| c.block_size() as u64 >= size)
            .unwrap_or(self.classes.len() - 1)
    }

    /// Releases the blocks selected by `should_release(index, block, dirty)`.
    fn release_where(
        &self,
        state: &mut FileState,
        mut should_release: impl FnMut(u64, &BlockRef, bool) -> bool,
    ) -> usize {
        let Some(class) = state.class else {
            return 0;
        };
        let pool = &self.classes[class];
        let doomed: Vec<u64> = state
            .blocks
            .iter()
            .filter(|(index, block)| should_release(**index, block, state.dirty.contains(*index)))
            .map(|(index, _)| *index)
            .collect();
        for index in &doomed {
            if let Some(block) = state.blocks.remove(index) {
                pool.release(block.claim);
            }
            state.dirty.remove(index);
        }
        if state.blocks.is_empty() {
            state.class = None;
        }
        doomed.len()
    }

    // ---- rendering -----------------------------------------------------

    /// Bytes `range` of a file of length `size`, clipped to `size`.
    ///
    /// Dirty blocks always win. Clean blocks are used only while unexpired
    /// and only when no fresher `remote` copy is supplied. Everything else
    /// comes from `remote`, zero-filled past the truncation point. Returns
    /// `None` when backend bytes are needed but `remote` is absent.
    fn render(
        &self,
        state: &FileState,
        size: u64,
        range: Range<u64>,
        remote: Option<&[u8]>,
        now: u64,
    ) -> Option<Vec<u8>> {
        let start = range.start.min(size);
        let end = range.end.min(size);
        let mut out = vec![0u8; (end - start) as usize];
        if out.is_empty() {
            return Some(out);
        }
        let pool = state.class.map(|c| &self.classes[c]);
        let block_size = pool.map_or(self.classes[0].block_size(), SizeClassPool::block_size) as u64;
        let limit = size.min(state.remote_valid_len);
        let tick = self.tick();

        for index in block_span(start, end, block_size as usize) {
            let block_start = index * block_size;
            let seg_start = block_start.max(start);
            let seg_end = (block_start + block_size).min(end);
            let dst = &mut out[(seg_start - start) as usize..(seg_end - start) as usize];

            let cached = state
                .blocks
                .get(&index)
                .filter(|b| state.dirty.contains(&index) || (remote.is_none() && b.expires_at > now));
            if let (Some(block), Some(pool)) = (cached, pool) {
                let data = pool.data(block.claim);
                dst.copy_from_slice(&data[(seg_start - block_start) as usize..(seg_end - block_start) as usize]);
                pool.touch(block.claim, tick);
                continue;
            }

            let remote_end = seg_end.min(limit);
            if seg_start >= remote_end {
                continue;
            }
            let remote = remote?;
            let available = remote_end.min(remote.len() as u64);
            if seg_start < available {
                let n = (available - seg_start) as usize;
                dst[..n].copy_from_slice(&remote[seg_start as usize..available as usize]);
            }
        }
        Some(out)
    }

    /// Overwrites a block's payload with backend bytes, zero past `limit`.
    fn fill_from_remote(pool: &SizeClassPool, claim: Claim, index: u64, remote: &[u8], limit: u64) {
        let block_size = pool.block_size() as u64;
        let block_start = index * block_size;
        let end = (block_start + block_size).min(limit).min(remote.len() as u64);
        let mut data = pool.data(claim);
        data.fill(0);
        if block_start < end {
            data[..(end - block_start) as usize].copy_from_slice(&remote[block_start as usize..end as usize]);
        }
    }

    // ---- backend -------------------------------------------------------

    /// Whole-object fetch shared by every concurrent caller for `path`.
    ///
    /// Returns the bytes (`None` if the object does not exist) and whether
    /// this caller issued the backend request.
    async fn fetch(&self, path: &FsPath) -> FsResult<(Option<Bytes>, bool)> {
        loop {
            match self.inflight.try_attach(path) {
                AttachResult::Leader(guard) => {
                    PoolStats::bump(&self.stats.fetches);
                    let result = match self.backend.read(path, None).await {
                        Ok(bytes) => Ok(Some(bytes)),
                        Err(FsError::NotFound(_)) => Ok(None),
                        Err(e) => Err(e),
                    };
                    let waiters = guard.complete(result.clone());
                    trace!(path = %path, waiters, "Fetch completed");
                    return result.map(|bytes| (bytes, true));
                }
                AttachResult::Waiter(mut rx) => {
                    PoolStats::bump(&self.stats.coalesced);
                    match rx.recv().await {
                        Ok(result) => return result.map(|bytes| (bytes, false)),
                        // Leader was cancelled or its flight retired; try again.
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    /// Backend length of `path`; 0 when the object does not exist.
    async fn probe_size(&self, path: &FsPath) -> FsResult<u64> {
        match self.backend.probe(path).await? {
            Some(entry) if entry.is_dir() => Err(FsError::is_a_directory(path.as_str())),
            Some(entry) => Ok(entry.size),
            None => Ok(0),
        }
    }

    /// Adopts a length just read from the backend.
    fn apply_size(&self, state: &mut FileState, size: u64, now: u64) {
        if state.size != Some(size) {
            // Another writer changed the object; cached clean blocks are stale.
            self.release_where(state, |_, _, dirty| !dirty);
            state.bump();
        }
        state.size = Some(size);
        state.size_valid_until = now.saturating_add(self.config.ttl.as_millis() as u64);
    }

    /// Makes `state.size` trustworthy, asking the backend if needed.
    async fn ensure_size(&self, path: &FsPath, state: &mut FileState, now: u64) -> FsResult<u64> {
        if let Some(size) = state.trusted_size(now) {
            return Ok(size);
        }
        let size = self.probe_size(path).await?;
        self.apply_size(state, size, now);
        Ok(size)
    }

    /// Locks `path` exclusively with a trusted length.
    ///
    /// An untrusted length is probed before the lock is taken; if the key
    /// changed meanwhile the probe is redone. Only after repeated changes
    /// does the probe run under the lock.
    async fn lock_sized(&self, path: &FsPath) -> FsResult<(Arc<FileEntry>, OwnedRwLockWriteGuard<FileState>)> {
        for _ in 0..CONTENDED_ROUNDS {
            let entry = self.entry(path);
            let (version, trusted) = {
                let state = entry.state.read().await;
                if state.detached {
                    continue;
                }
                (state.version, state.trusted_size(self.now()))
            };
            let probed = match trusted {
                Some(_) => None,
                None => Some(self.probe_size(path).await?),
            };
            let mut state = Arc::clone(&entry.state).write_owned().await;
            if state.detached || state.version != version {
                continue;
            }
            if let Some(size) = probed {
                self.apply_size(&mut state, size, self.now());
            }
            return Ok((entry, state));
        }
        debug!(path = %path, "Key keeps changing; sizing it under the lock");
        let (entry, mut state) = self.lock(path).await;
        self.ensure_size(path, &mut state, self.now()).await?;
        Ok((entry, state))
    }

    /// The whole local copy of a key, with backend bytes for uncached ranges.
    async fn assemble(&self, path: &FsPath, state: &FileState, size: u64) -> FsResult<Vec<u8>> {
        let now = self.now();
        if let Some(content) = self.render(state, size, 0..size, None, now) {
            return Ok(content);
        }
        let remote = self.fetch(path).await?.0.unwrap_or_default();
        Ok(self
            .render(state, size, 0..size, Some(&remote), now)
            .unwrap_or_default())
    }

    /// Puts the whole object if anything is dirty, holding `state` exclusively.
    ///
    /// On failure the data stays dirty and the background sweep retries
    /// with backoff; the error is also returned to the caller.
    async fn flush_locked(&self, path: &FsPath, state: &mut FileState, cause: FlushCause) -> FsResult<()> {
        if !state.is_dirty() {
            return Ok(());
        }
        let size = state.size.unwrap_or(0);
        let content = match self.assemble(path, state, size).await {
            Ok(content) => content,
            Err(e) => return Err(self.flush_failed(path, state, e, cause)),
        };
        if let Err(e) = self.backend.write(path, Bytes::from(content)).await {
            return Err(self.flush_failed(path, state, e, cause));
        }
        self.inflight.retire(path);
        self.flushed(path, state, size);
        Ok(())
    }

    /// Puts the whole object while holding the key's lock shared, so cached
    /// reads of the key go on during the backend round trip.
    ///
    /// Returns whether anything was dirty. If the key changed between the
    /// snapshot and the `put`'s completion it stays dirty; what was put is
    /// still on the backend.
    async fn flush_shared(&self, entry: &FileEntry) -> FsResult<bool> {
        let path = &entry.path;
        let state = entry.state.read().await;
        if state.detached || !state.is_dirty() {
            return Ok(false);
        }
        let version = state.version;
        let size = state.size.unwrap_or(0);
        let result = match self.assemble(path, &state, size).await {
            Ok(content) => self.backend.write(path, Bytes::from(content)).await,
            Err(e) => Err(e),
        };
        if result.is_ok() {
            self.inflight.retire(path);
        }
        drop(state);

        let mut state = entry.state.write().await;
        if state.detached {
            return result.map(|()| true);
        }
        match result {
            Ok(()) if state.version == version => {
                self.flushed(path, &mut state, size);
                Ok(true)
            }
            Ok(()) => {
                trace!(path = %path, "Key changed during flush; still dirty");
                Ok(true)
            }
            Err(e) => Err(self.flush_failed(path, &mut state, e, FlushCause::Explicit)),
        }
    }

    /// Marks `state` clean after a `put` of its first `size` bytes.
    fn flushed(&self, path: &FsPath, state: &mut FileState, size: u64) {
        let deadline = self.deadline();
        if let Some(class) = state.class {
            let pool = &self.classes[class];
            for (index, block) in &mut state.blocks {
                block.expires_at = deadline;
                if state.dirty.contains(index) {
                    pool.set_dirty(block.claim, false);
                }
            }
        }
        let blocks = state.dirty.len();
        state.mark_clean(size, deadline);
        PoolStats::bump(&self.stats.flushes);
        debug!(path = %path, size, blocks, "Flushed");
    }

    fn flush_failed(&self, path: &FsPath, state: &mut FileState, error: FsError, cause: FlushCause) -> FsError {
        if cause == FlushCause::Sweep {
            state.flush_attempts += 1;
        }
        let interval = self.config.flush_interval.as_millis() as u64;
        let backoff = interval
            .saturating_mul(1 << state.flush_attempts.clamp(1, 10))
            .min(MAX_FLUSH_BACKOFF_MS);
        state.next_retry_at = self.now().saturating_add(backoff);
        state.last_error = Some(error.clone());
        PoolStats::bump(&self.stats.flush_failures);
        if cause == FlushCause::Sweep && state.flush_attempts == self.config.max_flush_retries {
            warn!(
                path = %path,
                attempts = state.flush_attempts,
                error = %error,
                "Giving up background flush; data stays dirty until fsync succeeds"
            );
        } else {
            warn!(
                path = %path,
                attempts = state.flush_attempts,
                ?cause,
                error = %error,
                "Flush failed; data stays dirty"
            );
        }
        error
    }

    // ---- allocation and eviction --------------------------------------

    /// Claims a slot for block `index` of `path`, evicting if the class is full.
    ///
    /// Blocks of `path` inside `pinned` are never chosen as victims.
    async fn allocate(
        &self,
        class: usize,
        path: &FsPath,
        state: &mut FileState,
        index: u64,
        pinned: &Range<u64>,
    ) -> Option<Claim> {
        let pool = &self.classes[class];
        let owner = BlockOwner {
            path: path.clone(),
            index,
        };
        for _ in 0..EVICTION_ROUNDS {
            if let Some(claim) = pool.claim(owner.clone(), self.tick()) {
                return Some(claim);
            }
            if let Some(slot) = self.evict_one(class, path, state, pinned).await {
                return Some(pool.reassign(slot, owner, self.tick()));
            }
            tokio::task::yield_now().await;
        }
        debug!(path = %path, block_size = pool.block_size(), "No block could be reclaimed");
        None
    }

    /// One scan of the class for a victim.
    ///
    /// A key whose flush fails is skipped for the rest of the scan.
    async fn evict_one(&self, class: usize, path: &FsPath, state: &mut FileState, pinned: &Range<u64>) -> Option<u32> {
        let pool = &self.classes[class];
        let mut failed: Vec<FsPath> = Vec::new();
        for slot in pool.eviction_candidates() {
            let Some((owner, claim)) = pool.owner(slot) else {
                continue;
            };
            if failed.contains(&owner.path) {
                continue;
            }
            let outcome = if owner.path == *path {
                if pinned.contains(&owner.index) {
                    continue;
                }
                self.reclaim(path, state, owner.index, claim, class).await
            } else {
                let Some(entry) = self.existing(&owner.path) else {
                    continue;
                };
                let Ok(mut other) = entry.state.try_write() else {
                    continue;
                };
                if other.detached {
                    continue;
                }
                self.reclaim(&owner.path, &mut other, owner.index, claim, class)
                    .await
            };
            match outcome {
                Reclaim::Taken => return Some(slot),
                Reclaim::Skipped => {}
                Reclaim::FlushFailed => failed.push(owner.path),
            }
        }
        None
    }

    /// Takes block `index` away from `state`, flushing first if it is dirty.
    ///
    /// A dirty block whose key is backing off after a failed flush is left
    /// alone. The slot stays active so the caller can reassign it directly.
    async fn reclaim(&self, path: &FsPath, state: &mut FileState, index: u64, claim: Claim, class: usize) -> Reclaim {
        if state.class != Some(class) {
            return Reclaim::Skipped;
        }
        match state.blocks.get(&index) {
            Some(block) if block.claim == claim => {}
            _ => return Reclaim::Skipped,
        }
        let was_dirty = state.dirty.contains(&index);
        if was_dirty {
            if state.next_retry_at > self.now() {
                return Reclaim::Skipped;
            }
            if self.flush_locked(path, state, FlushCause::Eviction).await.is_err() {
                return Reclaim::FlushFailed;
            }
        }
        if !self.classes[class].is_current(claim) {
            return Reclaim::Skipped;
        }
        state.blocks.remove(&index);
        if was_dirty {
            PoolStats::bump(&self.stats.evictions_flushed);
        } else {
            PoolStats::bump(&self.stats.evictions_clean);
        }
        trace!(path = %path, index, flushed = was_dirty, "Evicted block");
        Reclaim::Taken
    }

    // ---- data path -----------------------------------------------------

    /// Reads up to `len` bytes at `offset`. Short at end of file.
    ///
    /// The backend fetch runs without the key's lock. If the key changed
    /// while it was in flight the bytes may predate that change, so they
    /// are not cached and the read starts over.
    #[instrument(level = "trace", skip_all, fields(path = %path, offset = offset, len = len))]
    pub async fn read(&self, path: &FsPath, offset: u64, len: u32) -> FsResult<Bytes> {
        let end = offset.saturating_add(u64::from(len));
        let mut missed = false;
        for _ in 0..CONTENDED_ROUNDS {
            let entry = self.entry(path);
            let version = {
                let state = entry.state.read().await;
                if state.detached {
                    continue;
                }
                if let Some(data) = self.hit(&state, offset..end) {
                    return Ok(data);
                }
                state.version
            };

            if !missed {
                PoolStats::bump(&self.stats.misses);
                missed = true;
            }
            let (fetched, leader) = self.fetch(path).await?;

            let mut state = entry.state.write().await;
            if state.detached || state.version != version {
                trace!(path = %path, "Key changed during fetch; reading again");
                continue;
            }
            return self
                .serve_fetched(&entry, &mut state, fetched, leader, offset..end)
                .await;
        }

        debug!(path = %path, "Key keeps changing; fetching under the lock");
        let (entry, mut state) = self.lock(path).await;
        if let Some(data) = self.hit(&state, offset..end) {
            return Ok(data);
        }
        if !missed {
            PoolStats::bump(&self.stats.misses);
        }
        let (fetched, leader) = self.fetch(path).await?;
        self.serve_fetched(&entry, &mut state, fetched, leader, offset..end)
            .await
    }

    /// Serves `range` from cached state alone, if it can.
    fn hit(&self, state: &FileState, range: Range<u64>) -> Option<Bytes> {
        let now = self.now();
        let size = state.trusted_size(now)?;
        let data = self.render(state, size, range.clone(), None, now)?;
        PoolStats::bump(&self.stats.hits);
        trace!(offset = range.start, len = data.len(), "Cache hit");
        Some(Bytes::from(data))
    }

    /// Answers a read from freshly fetched backend bytes and caches them.
    async fn serve_fetched(
        &self,
        entry: &Arc<FileEntry>,
        state: &mut FileState,
        fetched: Option<Bytes>,
        leader: bool,
        range: Range<u64>,
    ) -> FsResult<Bytes> {
        let path = &entry.path;
        let remote = match fetched {
            Some(bytes) => bytes,
            None if state.is_dirty() => Bytes::new(),
            None => {
                if state.is_idle() {
                    self.detach(entry, state);
                }
                return Err(FsError::NotFound(path.to_string()));
            }
        };
        let now = self.now();
        if !state.is_dirty() {
            state.size = Some(remote.len() as u64);
            state.size_valid_until = now.saturating_add(self.config.ttl.as_millis() as u64);
            state.remote_valid_len = NO_TRUNCATION;
        }
        if leader {
            self.populate(path, state, &remote, range.clone(), now).await;
        }
        let size = state.size.unwrap_or(remote.len() as u64);
        let data = self
            .render(state, size, range.clone(), Some(&remote), now)
            .unwrap_or_default();
        debug!(path = %path, offset = range.start, len = data.len(), leader, "Read from backend");
        Ok(Bytes::from(data))
    }

    /// Caches a freshly fetched object.
    ///
    /// Blocks covering `wanted` may evict; the rest of the object is only
    /// cached while free slots last. Dirty blocks are left alone.
    async fn populate(&self, path: &FsPath, state: &mut FileState, remote: &[u8], wanted: Range<u64>, now: u64) {
        let size = state.size.unwrap_or(remote.len() as u64);
        let class = *state.class.get_or_insert_with(|| self.class_for(size));
        let pool = &self.classes[class];
        let block_size = pool.block_size();
        let expires_at = now.saturating_add(self.config.ttl.as_millis() as u64);
        let limit = size.min(state.remote_valid_len);
        let wanted = block_span(wanted.start.min(size), wanted.end.min(size), block_size);

        for index in block_span(0, size, block_size) {
            if state.dirty.contains(&index) {
                continue;
            }
            let claim = if let Some(block) = state.blocks.get_mut(&index) {
                block.expires_at = expires_at;
                block.claim
            } else {
                let claim = if wanted.contains(&index) {
                    self.allocate(class, path, state, index, &wanted).await
                } else {
                    pool.claim(
                        BlockOwner {
                            path: path.clone(),
                            index,
                        },
                        self.tick(),
                    )
                };
                let Some(claim) = claim else {
                    continue;
                };
                state.blocks.insert(index, BlockRef { claim, expires_at });
                claim
            };
            Self::fill_from_remote(pool, claim, index, remote, limit);
        }
        state.class = Some(class);
    }

    /// Whether a write has to merge with backend bytes: some block it only
    /// partly covers is uncached and holds data below the truncation point.
    fn write_needs_remote(&self, state: &FileState, offset: u64, len: u64, append: bool, now: u64) -> FsResult<bool> {
        let size = state.size.unwrap_or(0);
        let offset = if append { size } else { offset };
        let end = write_end(offset, len)?;
        let class = state.class.unwrap_or_else(|| self.class_for(size.max(end)));
        let block_size = self.classes[class].block_size() as u64;
        let limit = size.min(state.remote_valid_len);
        Ok(block_span(offset, end, block_size as usize).any(|index| {
            let cached = state
                .blocks
                .get(&index)
                .is_some_and(|b| state.dirty.contains(&index) || b.expires_at > now);
            !cached && needs_backend_bytes(offset, end, index * block_size, block_size, limit)
        }))
    }

    /// Writes `data` at `offset`, or at end of file with `append`.
    ///
    /// Returns the offset the data landed at. Backend round trips (length
    /// probe, read-modify-write fetch, write-through `put`) happen without
    /// the key's exclusive lock; it is held only to place the data.
    #[instrument(level = "trace", skip_all, fields(path = %path, offset = offset, len = data.len()))]
    pub async fn write(&self, path: &FsPath, offset: u64, data: &[u8], append: bool) -> FsResult<u64> {
        let len = data.len() as u64;
        for _ in 0..CONTENDED_ROUNDS {
            let (entry, mut state) = self.lock_sized(path).await?;
            let remote = if self.write_needs_remote(&state, offset, len, append, self.now())? {
                let version = state.version;
                drop(state);
                let remote = self.fetch(path).await?.0.unwrap_or_default();
                state = Arc::clone(&entry.state).write_owned().await;
                if state.detached || state.version != version {
                    continue;
                }
                Some(remote)
            } else {
                None
            };
            let at = self.write_locked(path, &mut state, offset, data, append, remote).await?;
            drop(state);
            if !self.config.write_back {
                self.flush_shared(&entry).await?;
            }
            return Ok(at);
        }

        debug!(path = %path, "Key keeps changing; writing under the lock");
        let (entry, mut state) = self.lock(path).await;
        self.ensure_size(path, &mut state, self.now()).await?;
        let at = self.write_locked(path, &mut state, offset, data, append, None).await?;
        drop(state);
        if !self.config.write_back {
            self.flush_shared(&entry).await?;
        }
        Ok(at)
    }

    /// Places `data` into blocks of a key whose length is trusted.
    ///
    /// `remote` is the backend copy when the caller already fetched it;
    /// otherwise it is fetched here if a partly covered block needs it.
    async fn write_locked(
        &self,
        path: &FsPath,
        state: &mut FileState,
        offset: u64,
        data: &[u8],
        append: bool,
        mut remote: Option<Bytes>,
    ) -> FsResult<u64> {
        let now = self.now();
        let size = state.size.unwrap_or(0);
        let offset = if append { size } else { offset };
        let end = write_end(offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(offset);
        }
        let class = *state.class.get_or_insert_with(|| self.class_for(size.max(end)));
        let pool = &self.classes[class];
        let block_size = pool.block_size() as u64;
        let span = block_span(offset, end, block_size as usize);
        let limit = size.min(state.remote_valid_len);

        // Phase 1: make sure every block of the span is cached and holds
        // its current content, without changing anything visible yet.
        let mut fresh: Vec<(u64, Claim)> = Vec::new();
        for index in span.clone() {
            let block_start = index * block_size;
            if let Some(block) = state.blocks.get(&index).copied() {
                if state.dirty.contains(&index) || block.expires_at > now {
                    continue;
                }
                state.blocks.remove(&index);
                pool.release(block.claim);
            }
            if remote.is_none() && needs_backend_bytes(offset, end, block_start, block_size, limit) {
                match self.fetch(path).await {
                    Ok((bytes, _)) => remote = Some(bytes.unwrap_or_default()),
                    Err(e) => {
                        fresh.into_iter().for_each(|(_, claim)| pool.release(claim));
                        return Err(e);
                    }
                }
            }
            match self.allocate(class, path, state, index, &span).await {
                Some(claim) => {
                    if let Some(remote) = &remote {
                        Self::fill_from_remote(pool, claim, index, remote, limit);
                    }
                    fresh.push((index, claim));
                }
                None => {
                    fresh.into_iter().for_each(|(_, claim)| pool.release(claim));
                    self.write_through(path, state, offset, data, remote).await?;
                    return Ok(offset);
                }
            }
        }

        // Phase 2: copy in and mark dirty.
        state.class = Some(class);
        for (index, claim) in fresh {
            state.blocks.insert(index, BlockRef { claim, expires_at: 0 });
        }
        let tick = self.tick();
        for index in span {
            let Some(block) = state.blocks.get(&index).copied() else {
                continue;
            };
            let block_start = index * block_size;
            let seg_start = offset.max(block_start);
            let seg_end = end.min(block_start + block_size);
            pool.data(block.claim)[(seg_start - block_start) as usize..(seg_end - block_start) as usize]
                .copy_from_slice(&data[(seg_start - offset) as usize..(seg_end - offset) as usize]);
            pool.set_dirty(block.claim, true);
            pool.touch(block.claim, tick);
            state.dirty.insert(index);
        }
        if end > size {
            // The gap between the old end and `offset` reads as zeros.
            state.remote_valid_len = state.remote_valid_len.min(size);
            state.size = Some(end);
            state.size_dirty = true;
        }
        state.mark_dirty(now);
        trace!(path = %path, offset, len = data.len(), "Buffered write");
        Ok(offset)
    }

    /// Applies a write directly to the backend when no block can be freed.
    async fn write_through(
        &self,
        path: &FsPath,
        state: &mut FileState,
        offset: u64,
        data: &[u8],
        remote: Option<Bytes>,
    ) -> FsResult<()> {
        let now = self.now();
        let size = state.size.unwrap_or(0);
        let mut content = match self.render(state, size, 0..size, remote.as_deref(), now) {
            Some(content) => content,
            None => self.assemble(path, state, size).await?,
        };
        let start = offset as usize;
        let end = start + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        let len = content.len() as u64;

        self.backend.write(path, Bytes::from(content)).await?;
        self.inflight.retire(path);
        self.release_where(state, |_, _, _| true);
        state.mark_clean(len, self.deadline());
        PoolStats::bump(&self.stats.write_through);
        debug!(path = %path, offset, len = data.len(), "Cache exhausted; wrote through");
        Ok(())
    }

    /// Sets the logical length. Bytes past a shrink read as zero afterwards.
    #[instrument(level = "debug", skip_all, fields(path = %path, size = new_size))]
    pub async fn truncate(&self, path: &FsPath, new_size: u64) -> FsResult<()> {
        if new_size > MAX_FILE_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "length {new_size} exceeds the largest file size"
            )));
        }
        let (entry, mut state) = self.lock_sized(path).await?;
        let now = self.now();
        let size = state.size.unwrap_or(0);
        if new_size == size {
            return Ok(());
        }
        if new_size < size
            && let Some(class) = state.class
        {
            let pool = &self.classes[class];
            let block_size = pool.block_size() as u64;
            self.release_where(&mut state, |index, _, _| index * block_size >= new_size);

            let index = new_size / block_size;
            let cut = (new_size % block_size) as usize;
            if cut > 0
                && let Some(block) = state.blocks.get(&index).copied()
            {
                if state.dirty.contains(&index) || block.expires_at > now {
                    pool.data(block.claim)[cut..].fill(0);
                    pool.set_dirty(block.claim, true);
                    state.dirty.insert(index);
                } else {
                    state.blocks.remove(&index);
                    pool.release(block.claim);
                    if state.blocks.is_empty() {
                        state.class = None;
                    }
                }
            }
        }
        state.remote_valid_len = state.remote_valid_len.min(new_size).min(size);
        state.size = Some(new_size);
        state.size_dirty = true;
        state.mark_dirty(now);
        debug!(path = %path, from = size, to = new_size, "Truncated");
        drop(state);

        if !self.config.write_back {
            self.flush_shared(&entry).await?;
        }
        Ok(())
    }

    /// Records that `path` was just created empty on the backend.
    pub async fn mark_created(&self, path: &FsPath) {
        let (_entry, mut state) = self.lock(path).await;
        self.inflight.retire(path);
        self.release_where(&mut state, |_, _, _| true);
        state.mark_clean(0, self.deadline());
    }

    // ---- flushing and invalidation ------------------------------------

    /// Flushes `path`, returning the backend error if the flush fails.
    #[instrument(level = "debug", skip_all, fields(path = %path))]
    pub async fn fsync(&self, path: &FsPath) -> FsResult<()> {
        let Some(entry) = self.existing(path) else {
            return Ok(());
        };
        self.flush_shared(&entry).await.map(|_| ())
    }

    /// Flushes every dirty key at or below `prefix`. Stops at the first error.
    pub async fn flush_prefix(&self, prefix: &FsPath) -> FsResult<usize> {
        let entries: Vec<Arc<FileEntry>> = self
            .files
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut flushed = 0;
        for entry in entries {
            if self.flush_shared(&entry).await? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Flushes every dirty key. Keeps going past failures and returns the first.
    pub async fn flush_all(&self) -> FsResult<usize> {
        let entries: Vec<Arc<FileEntry>> = self.files.iter().map(|e| Arc::clone(e.value())).collect();
        let mut flushed = 0;
        let mut first_error = None;
        for entry in entries {
            match self.flush_shared(&entry).await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Drops all state for `path`, dirty or not.
    pub async fn discard(&self, path: &FsPath) {
        if let Some(entry) = self.existing(path) {
            let mut state = entry.state.write().await;
            if !state.detached {
                self.detach(&entry, &mut state);
            }
        }
    }

    /// Drops all state for every key at or below `prefix`.
    pub async fn discard_prefix(&self, prefix: &FsPath) {
        let paths: Vec<FsPath> = self
            .files
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        for path in paths {
            self.discard(&path).await;
        }
    }

    /// Drops every clean key. Returns how many dirty keys were kept.
    pub async fn invalidate_all(&self) -> usize {
        let entries: Vec<Arc<FileEntry>> = self.files.iter().map(|e| Arc::clone(e.value())).collect();
        let mut kept = 0;
        for entry in entries {
            let mut state = entry.state.write().await;
            if state.detached {
                continue;
            }
            if state.is_dirty() {
                kept += 1;
            } else {
                self.detach(&entry, &mut state);
            }
        }
        debug!(kept, "Invalidated clean cache state");
        kept
    }

    /// Locally written length not yet on the backend.
    pub async fn known_size(&self, path: &FsPath) -> Option<u64> {
        let entry = self.existing(path)?;
        let state = entry.state.read().await;
        if !state.detached && state.is_dirty() {
            state.size
        } else {
            None
        }
    }

    /// The error of the last failed flush of `path`, if it is still dirty.
    pub async fn pending_error(&self, path: &FsPath) -> Option<FsError> {
        let entry = self.existing(path)?;
        let state = entry.state.read().await;
        state.last_error.clone()
    }

    // ---- background sweep ---------------------------------------------

    /// One pass of the background sweep.
    ///
    /// Flushes keys dirty for longer than `flush_interval` (respecting
    /// retry backoff and `max_flush_retries`), drops clean blocks past
    /// their TTL and forgets idle keys. At most `sweep_batch` keys do work.
    pub async fn sweep_once(&self) -> SweepReport {
        let flush_after = self.config.flush_interval.as_millis() as u64;
        let entries: Vec<Arc<FileEntry>> = self.files.iter().map(|e| Arc::clone(e.value())).collect();
        let mut report = SweepReport::default();
        let mut budget = self.config.sweep_batch;

        for entry in entries {
            if budget == 0 {
                break;
            }
            let Ok(mut state) = entry.state.try_write() else {
                continue;
            };
            if state.detached {
                continue;
            }
            let now = self.now();
            let mut worked = false;

            if state.is_dirty()
                && state.flush_attempts < self.config.max_flush_retries
                && state.next_retry_at <= now
                && state
                    .dirty_since
                    .is_some_and(|since| now.saturating_sub(since) >= flush_after)
            {
                worked = true;
                match self.flush_locked(&entry.path, &mut state, FlushCause::Sweep).await {
                    Ok(()) => report.flushed += 1,
                    Err(_) => report.flush_failures += 1,
                }
            }

            let now = self.now();
            let expired = self.release_where(&mut state, |_, block, dirty| !dirty && block.expires_at <= now);
            if expired > 0 {
                PoolStats::add(&self.stats.expired, expired as u64);
                report.expired_blocks += expired;
                worked = true;
            }

            if state.is_idle() && state.size_valid_until <= now {
                self.detach(&entry, &mut state);
                report.dropped_files += 1;
            }
            if worked {
                budget -= 1;
            }
        }
        report
    }

    // ---- stats ---------------------------------------------------------

    pub fn stats(&self) -> PoolStatsSnapshot {
        let mut snapshot = self.stats.counters();
        snapshot.files = self.files.len();
        snapshot.dirty_files = self
            .files
            .iter()
            .filter(|e| e.value().state.try_read().is_ok_and(|s| s.is_dirty()))
            .count();
        snapshot.classes = self
            .classes
            .iter()
            .map(|c| ClassUsage {
                block_size: c.block_size(),
                blocks: c.capacity(),
                free: c.free_count(),
            })
            .collect();
        snapshot
    }

    pub fn in_flight_fetches(&self) -> usize {
        self.inflight.in_flight_count()
    }
}
