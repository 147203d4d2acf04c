//! Cache pool counters.
//!
//! All counters are relaxed atomics; a [`PoolStatsSnapshot`] is a
//! point-in-time copy that can be serialized for the CLI or a status
//! endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters for one cache pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Reads answered entirely from cached blocks.
    pub hits: AtomicU64,
    /// Reads that needed backend data.
    pub misses: AtomicU64,
    /// Backend `get` calls issued by the cache.
    pub fetches: AtomicU64,
    /// Fetch requests that joined an in-flight fetch instead of issuing one.
    pub coalesced: AtomicU64,
    /// Clean blocks reclaimed by eviction.
    pub evictions_clean: AtomicU64,
    /// Dirty blocks reclaimed after a flush forced by eviction.
    pub evictions_flushed: AtomicU64,
    /// Successful whole-object flushes.
    pub flushes: AtomicU64,
    /// Failed flushes (data stays dirty).
    pub flush_failures: AtomicU64,
    /// Clean blocks dropped by the sweep after their TTL.
    pub expired: AtomicU64,
    /// Writes sent straight to the backend because no block could be freed.
    pub write_through: AtomicU64,
}

impl PoolStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy of the counters, without the occupancy figures.
    pub fn counters(&self) -> PoolStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolStatsSnapshot {
            hits: load(&self.hits),
            misses: load(&self.misses),
            fetches: load(&self.fetches),
            coalesced: load(&self.coalesced),
            evictions_clean: load(&self.evictions_clean),
            evictions_flushed: load(&self.evictions_flushed),
            flushes: load(&self.flushes),
            flush_failures: load(&self.flush_failures),
            expired: load(&self.expired),
            write_through: load(&self.write_through),
            files: 0,
            dirty_files: 0,
            classes: Vec::new(),
        }
    }
}

/// Occupancy of one size class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassUsage {
    pub block_size: usize,
    pub blocks: usize,
    pub free: usize,
}

/// A serializable snapshot of cache pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub coalesced: u64,
    pub evictions_clean: u64,
    pub evictions_flushed: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub expired: u64,
    pub write_through: u64,
    /// Keys with cache state.
    pub files: usize,
    /// Keys holding unflushed data.
    pub dirty_files: usize,
    pub classes: Vec<ClassUsage>,
}

impl PoolStatsSnapshot {
    /// Fraction of reads served from cache (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Bytes of block storage currently holding data.
    pub fn bytes_in_use(&self) -> u64 {
        self.classes
            .iter()
            .map(|c| ((c.blocks - c.free) * c.block_size) as u64)
            .sum()
    }
}

/// Human-readable byte count (`1.50 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
