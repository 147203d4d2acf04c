//! Single-flight deduplication of whole-object fetches.
//!
//! When several operations need the backend copy of the same key, only
//! the first (the "leader") issues the `get`; the others ("waiters")
//! receive a clone of its result. A leader that is dropped before it
//! completes (its task was cancelled) removes the entry, and its waiters
//! see a closed channel and retry.
//!
//! A flight that started before the key was last written to the backend
//! may carry old bytes. [`InFlightFetches::retire`] takes it out of the
//! map so later callers start a fresh one.

use std::sync::atomic::{AtomicU64, Ordering};

use bucketfs_core::{FsPath, FsResult};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

/// Outcome of a fetch: the object bytes, or `None` when the key does not exist.
pub(crate) type FetchResult = FsResult<Option<Bytes>>;

pub(crate) enum AttachResult<'a> {
    /// This caller performs the fetch and must complete the guard.
    Leader(FlightGuard<'a>),
    /// Another fetch is in flight; wait on the receiver.
    Waiter(broadcast::Receiver<FetchResult>),
}

struct InFlightEntry {
    id: u64,
    sender: broadcast::Sender<FetchResult>,
    waiter_count: AtomicU64,
}

#[derive(Default)]
pub(crate) struct InFlightFetches {
    in_flight: DashMap<FsPath, InFlightEntry>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for InFlightFetches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightFetches")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl InFlightFetches {
    pub(crate) fn try_attach(&self, path: &FsPath) -> AttachResult<'_> {
        match self.in_flight.entry(path.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get();
                entry.waiter_count.fetch_add(1, Ordering::Relaxed);
                AttachResult::Waiter(entry.sender.subscribe())
            }
            Entry::Vacant(vacant) => {
                let (sender, _) = broadcast::channel(1);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                vacant.insert(InFlightEntry {
                    id,
                    sender,
                    waiter_count: AtomicU64::new(0),
                });
                AttachResult::Leader(FlightGuard {
                    fetches: self,
                    path: path.clone(),
                    id,
                    done: false,
                })
            }
        }
    }

    /// Detaches the flight for `path`, if any.
    ///
    /// Its waiters see a closed channel and fetch again; its leader still
    /// gets its own result but no longer shares it.
    pub(crate) fn retire(&self, path: &FsPath) -> bool {
        self.in_flight.remove(path).is_some()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// Held by the leader; completing it wakes every waiter.
pub(crate) struct FlightGuard<'a> {
    fetches: &'a InFlightFetches,
    path: FsPath,
    id: u64,
    done: bool,
}

impl FlightGuard<'_> {
    /// Broadcasts `result` and returns how many waiters were attached.
    pub(crate) fn complete(mut self, result: FetchResult) -> u64 {
        self.done = true;
        match self.fetches.in_flight.remove_if(&self.path, |_, e| e.id == self.id) {
            Some((_, entry)) => {
                let waiters = entry.waiter_count.load(Ordering::Relaxed);
                // No receivers is fine: every waiter may have been cancelled.
                let _ = entry.sender.send(result);
                waiters
            }
            None => 0,
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.fetches.in_flight.remove_if(&self.path, |_, e| e.id == self.id);
        }
    }
}
