//! Thread-safe handle table mapping numeric handles to paths.
//!
//! Handles are process-local and never persisted. A path has at most one
//! live handle: looking it up again returns the same handle with its
//! reference count bumped, the way FUSE counts `nlookup`.
//!
//! # Handle Lifecycle
//!
//! 1. **Allocate**: lookup/create/mkdir call [`HandleTable::allocate`]
//! 2. **Retain**: open/opendir add a reference
//! 3. **Release**: release/forget drop references; at zero the entry is
//!    removed immediately and the id becomes stale
//!
//! # Stale detection
//!
//! Every [`HandleId`] carries the generation it was issued under. The
//! starting generation comes from the wall clock, and each wrap of the id
//! counter bumps it, so neither a recycled id nor a handle held over from
//! a previous process resolves to the wrong path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bucketfs_core::{EntryKind, FsError, FsPath, FsResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Id of the pinned root handle.
pub const ROOT_ID: u64 = 1;

/// Opaque handle given to transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId {
    pub id: u64,
    pub generation: u64,
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.generation)
    }
}

/// Flags recorded by the latest open of a handle.
///
/// A path has one handle however often it is opened, so these flags are
/// shared by every opener and the most recent open replaces them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    /// Writes go to the current end of file regardless of offset.
    ///
    /// Applies to every writer of the handle, not just the one that opened
    /// with it, until a later open without `append` clears it.
    pub append: bool,
    /// Truncate to zero length on open.
    pub truncate: bool,
}

impl OpenMode {
    pub const READ_ONLY: OpenMode = OpenMode {
        read: true,
        write: false,
        append: false,
        truncate: false,
    };

    pub const READ_WRITE: OpenMode = OpenMode {
        read: true,
        write: true,
        append: false,
        truncate: false,
    };

    #[must_use]
    pub fn append(mut self) -> Self {
        self.write = true;
        self.append = true;
        self
    }

    #[must_use]
    pub fn truncate(mut self) -> Self {
        self.write = true;
        self.truncate = true;
        self
    }
}

#[derive(Debug, Clone)]
struct HandleEntry {
    path: FsPath,
    kind: EntryKind,
    generation: u64,
    open_mode: OpenMode,
    ref_count: u64,
}

/// What a handle currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHandle {
    pub handle: HandleId,
    pub path: FsPath,
    pub kind: EntryKind,
    pub open_mode: OpenMode,
    pub ref_count: u64,
}

/// Concurrent handle table.
///
/// Lock order is `by_path` before `handles`; no code path takes them the
/// other way round.
#[derive(Debug)]
pub struct HandleTable {
    handles: DashMap<u64, HandleEntry>,
    by_path: DashMap<FsPath, u64>,
    next_id: AtomicU64,
    generation: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Creates a table holding only the root handle.
    pub fn new() -> Self {
        let base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_start(base, ROOT_ID + 1)
    }

    /// Creates a table with an explicit generation and first id.
    pub fn with_start(generation: u64, next_id: u64) -> Self {
        let table = Self {
            handles: DashMap::new(),
            by_path: DashMap::new(),
            next_id: AtomicU64::new(next_id.max(ROOT_ID + 1)),
            generation: AtomicU64::new(generation),
        };
        table.handles.insert(
            ROOT_ID,
            HandleEntry {
                path: FsPath::root(),
                kind: EntryKind::Directory,
                generation,
                open_mode: OpenMode::READ_ONLY,
                ref_count: 1,
            },
        );
        table.by_path.insert(FsPath::root(), ROOT_ID);
        table
    }

    /// The pinned root handle.
    pub fn root(&self) -> HandleId {
        let generation = self
            .handles
            .get(&ROOT_ID)
            .map_or_else(|| self.generation.load(Ordering::Relaxed), |e| e.generation);
        HandleId {
            id: ROOT_ID,
            generation,
        }
    }

    /// Returns the live handle for `path` with one more reference, or a new one.
    pub fn allocate(&self, path: &FsPath, kind: EntryKind) -> HandleId {
        match self.by_path.entry(path.clone()) {
            Entry::Occupied(mut occupied) => {
                let id = *occupied.get();
                if let Some(mut entry) = self.handles.get_mut(&id) {
                    entry.ref_count += 1;
                    entry.kind = kind;
                    return HandleId {
                        id,
                        generation: entry.generation,
                    };
                }
                // Entry released between the two maps; replace the mapping.
                let handle = self.insert_new(path, kind);
                occupied.insert(handle.id);
                handle
            }
            Entry::Vacant(vacant) => {
                let handle = self.insert_new(path, kind);
                vacant.insert(handle.id);
                handle
            }
        }
    }

    fn insert_new(&self, path: &FsPath, kind: EntryKind) -> HandleId {
        loop {
            let id = self
                .next_id
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some(current.checked_add(1).unwrap_or(ROOT_ID + 1))
                })
                .unwrap_or(ROOT_ID + 1);
            if id <= ROOT_ID {
                continue;
            }
            // The last id before the counter wraps closes the generation.
            let generation = if id == u64::MAX {
                self.generation.fetch_add(1, Ordering::Relaxed)
            } else {
                self.generation.load(Ordering::Relaxed)
            };
            if let Entry::Vacant(slot) = self.handles.entry(id) {
                slot.insert(HandleEntry {
                    path: path.clone(),
                    kind,
                    generation,
                    open_mode: OpenMode::default(),
                    ref_count: 1,
                });
                trace!(id, generation, path = %path, "Allocated handle");
                return HandleId { id, generation };
            }
        }
    }

    /// Looks up a handle, rejecting unknown ids and older generations.
    pub fn resolve(&self, handle: HandleId) -> FsResult<ResolvedHandle> {
        match self.handles.get(&handle.id) {
            Some(entry) if entry.generation == handle.generation => Ok(ResolvedHandle {
                handle,
                path: entry.path.clone(),
                kind: entry.kind,
                open_mode: entry.open_mode,
                ref_count: entry.ref_count,
            }),
            _ => Err(stale(handle)),
        }
    }

    /// Adds one reference.
    pub fn retain(&self, handle: HandleId) -> FsResult<()> {
        match self.handles.get_mut(&handle.id) {
            Some(mut entry) if entry.generation == handle.generation => {
                entry.ref_count += 1;
                Ok(())
            }
            _ => Err(stale(handle)),
        }
    }

    /// Drops `count` references, removing the handle when none remain.
    ///
    /// The root handle is never removed.
    pub fn release(&self, handle: HandleId, count: u64) -> FsResult<()> {
        let removed_path = {
            let Some(mut entry) = self.handles.get_mut(&handle.id) else {
                return Err(stale(handle));
            };
            if entry.generation != handle.generation {
                return Err(stale(handle));
            }
            if handle.id == ROOT_ID {
                return Ok(());
            }
            entry.ref_count = entry.ref_count.saturating_sub(count);
            if entry.ref_count > 0 {
                return Ok(());
            }
            entry.path.clone()
        };
        let removed = self
            .handles
            .remove_if(&handle.id, |_, e| e.generation == handle.generation && e.ref_count == 0);
        if removed.is_some() {
            self.by_path.remove_if(&removed_path, |_, id| *id == handle.id);
        }
        trace!(handle = %handle, path = %removed_path, "Released handle");
        Ok(())
    }

    /// Replaces the handle's flags. The latest open wins.
    pub fn set_open_mode(&self, handle: HandleId, mode: OpenMode) -> FsResult<()> {
        match self.handles.get_mut(&handle.id) {
            Some(mut entry) if entry.generation == handle.generation => {
                entry.open_mode = mode;
                Ok(())
            }
            _ => Err(stale(handle)),
        }
    }

    /// Re-points every live handle at or below `from` to the same place under `to`.
    ///
    /// A live handle already at a destination path is detached from the
    /// path index; it still resolves but is no longer returned by lookups.
    pub fn rename_path(&self, from: &FsPath, to: &FsPath) -> usize {
        let moved: Vec<(u64, FsPath, FsPath)> = self
            .handles
            .iter()
            .filter_map(|e| {
                let new_path = e.path.rebase(from, to)?;
                Some((*e.key(), e.path.clone(), new_path))
            })
            .collect();
        for (id, old, new) in &moved {
            if let Some(mut entry) = self.handles.get_mut(id) {
                entry.path = new.clone();
            }
            self.by_path.remove_if(old, |_, mapped| mapped == id);
        }
        for (id, _, new) in &moved {
            self.by_path.insert(new.clone(), *id);
        }
        moved.len()
    }

    /// Number of live handles including root.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

fn stale(handle: HandleId) -> FsError {
    FsError::InvalidHandle {
        id: handle.id,
        generation: handle.generation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn p(s: &str) -> FsPath {
        FsPath::parse(s).unwrap()
    }

    #[test]
    fn test_root_is_pinned() {
        let table = HandleTable::new();
        let root = table.root();
        assert_eq!(root.id, ROOT_ID);
        table.release(root, 100).unwrap();
        assert_eq!(table.resolve(root).unwrap().path, FsPath::root());
    }

    #[test]
    fn test_lookup_same_path_dedupes() {
        let table = HandleTable::new();
        let a = table.allocate(&p("/a"), EntryKind::File);
        let again = table.allocate(&p("/a"), EntryKind::File);
        assert_eq!(a, again);
        assert_eq!(table.resolve(a).unwrap().ref_count, 2);

        table.release(a, 1).unwrap();
        assert!(table.resolve(a).is_ok());
        table.release(a, 1).unwrap();
        assert!(matches!(table.resolve(a), Err(FsError::InvalidHandle { .. })));
    }

    #[test]
    fn test_ids_increase_and_skip_root() {
        let table = HandleTable::with_start(7, 0);
        let a = table.allocate(&p("/a"), EntryKind::File);
        let b = table.allocate(&p("/b"), EntryKind::File);
        assert_eq!(a.id, 2);
        assert_eq!(b.id, 3);
        assert_eq!(a.generation, 7);
    }

    #[test]
    fn test_wraparound_bumps_generation() {
        let table = HandleTable::with_start(1, u64::MAX);
        let last = table.allocate(&p("/last"), EntryKind::File);
        assert_eq!(last.id, u64::MAX);
        let wrapped = table.allocate(&p("/wrapped"), EntryKind::File);
        assert_eq!(wrapped.id, 2);
        assert_eq!(wrapped.generation, 2);

        // An id from before the wrap does not resolve under the new generation.
        let forged = HandleId {
            id: wrapped.id,
            generation: 1,
        };
        assert!(table.resolve(forged).is_err());
    }

    #[test]
    fn test_handles_from_another_table_are_stale() {
        let first = HandleTable::with_start(100, 2);
        let second = HandleTable::with_start(200, 2);
        let old = first.allocate(&p("/x"), EntryKind::File);
        second.allocate(&p("/x"), EntryKind::File);
        assert!(second.resolve(old).is_err());
    }

    #[test]
    fn test_forget_many() {
        let table = HandleTable::new();
        let h = table.allocate(&p("/f"), EntryKind::File);
        table.allocate(&p("/f"), EntryKind::File);
        table.retain(h).unwrap();
        table.release(h, 3).unwrap();
        assert!(table.resolve(h).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rename_path_moves_subtree() {
        let table = HandleTable::new();
        let dir = table.allocate(&p("/d"), EntryKind::Directory);
        let file = table.allocate(&p("/d/f"), EntryKind::File);
        let other = table.allocate(&p("/dx"), EntryKind::File);

        assert_eq!(table.rename_path(&p("/d"), &p("/e")), 2);

        assert_eq!(table.resolve(dir).unwrap().path, p("/e"));
        assert_eq!(table.resolve(file).unwrap().path, p("/e/f"));
        assert_eq!(table.resolve(other).unwrap().path, p("/dx"));
        assert_eq!(table.allocate(&p("/e/f"), EntryKind::File), file);
    }

    #[test]
    fn test_open_mode() {
        let table = HandleTable::new();
        let h = table.allocate(&p("/f"), EntryKind::File);
        table.set_open_mode(h, OpenMode::READ_WRITE.append()).unwrap();
        let mode = table.resolve(h).unwrap().open_mode;
        assert!(mode.append && mode.write);
    }

    #[test]
    fn test_concurrent_allocate_same_path() {
        let table = Arc::new(HandleTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| table.allocate(&FsPath::parse("/shared").unwrap(), EntryKind::File))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<HandleId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(table.resolve(ids[0]).unwrap().ref_count, 800);
    }
}
