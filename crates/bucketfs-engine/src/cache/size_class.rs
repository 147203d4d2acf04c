//! One size class: a fixed array of equally sized block slots.
//!
//! Slot bookkeeping (state, owner, access ticks) is atomic or behind a
//! short `parking_lot` mutex so eviction can scan a class without taking
//! any file lock. Payload bytes sit behind their own per-slot mutex.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bucketfs_core::FsPath;
use parking_lot::{Mutex, MutexGuard};

use super::free_list::{FreeList, NIL};

const FREE: u8 = 0;
const ACTIVE: u8 = 1;

/// The file block a slot currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockOwner {
    pub path: FsPath,
    pub index: u64,
}

#[derive(Debug)]
struct Slot {
    state: AtomicU8,
    generation: AtomicU64,
    dirty: AtomicBool,
    last_access: AtomicU64,
    inserted: AtomicU64,
    owner: Mutex<Option<BlockOwner>>,
    data: Mutex<Vec<u8>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            generation: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            last_access: AtomicU64::new(0),
            inserted: AtomicU64::new(0),
            owner: Mutex::new(None),
            data: Mutex::new(Vec::new()),
        }
    }
}

/// A claimed slot: index plus the generation it was claimed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Claim {
    pub slot: u32,
    pub generation: u64,
}

#[derive(Debug)]
pub(crate) struct SizeClassPool {
    block_size: usize,
    slots: Box<[Slot]>,
    links: Box<[AtomicU32]>,
    free: FreeList,
    free_count: AtomicUsize,
}

impl SizeClassPool {
    pub(crate) fn new(block_size: usize, count: usize) -> Self {
        let slots: Box<[Slot]> = (0..count).map(|_| Slot::new()).collect();
        let links: Box<[AtomicU32]> = (0..count).map(|_| AtomicU32::new(NIL)).collect();
        let free = FreeList::full(&links);
        Self {
            block_size,
            slots,
            links,
            free,
            free_count: AtomicUsize::new(count),
        }
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Pops a free slot and hands it to `owner` with zeroed payload.
    pub(crate) fn claim(&self, owner: BlockOwner, tick: u64) -> Option<Claim> {
        let index = self.free.pop(&self.links)?;
        self.free_count.fetch_sub(1, Ordering::Relaxed);
        Some(self.activate(index, owner, tick))
    }

    /// Hands an already active slot to a new owner without passing through
    /// the free list, so no other allocator can grab it in between.
    pub(crate) fn reassign(&self, index: u32, owner: BlockOwner, tick: u64) -> Claim {
        self.activate(index, owner, tick)
    }

    fn activate(&self, index: u32, owner: BlockOwner, tick: u64) -> Claim {
        let slot = &self.slots[index as usize];
        {
            let mut data = slot.data.lock();
            data.clear();
            data.resize(self.block_size, 0);
        }
        *slot.owner.lock() = Some(owner);
        slot.dirty.store(false, Ordering::Relaxed);
        slot.inserted.store(tick, Ordering::Relaxed);
        slot.last_access.store(tick, Ordering::Relaxed);
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        slot.state.store(ACTIVE, Ordering::Release);
        Claim {
            slot: index,
            generation,
        }
    }

    /// Returns a slot to the free list. The caller has already flushed it.
    pub(crate) fn release(&self, claim: Claim) {
        let slot = &self.slots[claim.slot as usize];
        if slot.generation.load(Ordering::Acquire) != claim.generation {
            return;
        }
        if slot
            .state
            .compare_exchange(ACTIVE, FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *slot.owner.lock() = None;
        slot.dirty.store(false, Ordering::Relaxed);
        self.free.push(&self.links, claim.slot);
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn is_current(&self, claim: Claim) -> bool {
        let slot = &self.slots[claim.slot as usize];
        slot.state.load(Ordering::Acquire) == ACTIVE && slot.generation.load(Ordering::Acquire) == claim.generation
    }

    pub(crate) fn owner(&self, index: u32) -> Option<(BlockOwner, Claim)> {
        let slot = &self.slots[index as usize];
        if slot.state.load(Ordering::Acquire) != ACTIVE {
            return None;
        }
        let owner = slot.owner.lock().clone()?;
        Some((
            owner,
            Claim {
                slot: index,
                generation: slot.generation.load(Ordering::Acquire),
            },
        ))
    }

    pub(crate) fn touch(&self, claim: Claim, tick: u64) {
        self.slots[claim.slot as usize]
            .last_access
            .store(tick, Ordering::Relaxed);
    }

    pub(crate) fn set_dirty(&self, claim: Claim, dirty: bool) {
        self.slots[claim.slot as usize]
            .dirty
            .store(dirty, Ordering::Relaxed);
    }

    /// Payload of a slot, locked for a copy in or out.
    pub(crate) fn data(&self, claim: Claim) -> MutexGuard<'_, Vec<u8>> {
        self.slots[claim.slot as usize].data.lock()
    }

    /// Active slots in eviction order: clean before dirty, then least
    /// recently accessed, then oldest insertion.
    pub(crate) fn eviction_candidates(&self) -> Vec<u32> {
        let mut active: Vec<(bool, u64, u64, u32)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state.load(Ordering::Acquire) == ACTIVE)
            .map(|(i, s)| {
                (
                    s.dirty.load(Ordering::Relaxed),
                    s.last_access.load(Ordering::Relaxed),
                    s.inserted.load(Ordering::Relaxed),
                    i as u32,
                )
            })
            .collect();
        active.sort_unstable();
        active.into_iter().map(|(_, _, _, i)| i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(path: &str, index: u64) -> BlockOwner {
        BlockOwner {
            path: FsPath::parse(path).unwrap(),
            index,
        }
    }

    #[test]
    fn test_claim_until_exhausted() {
        let pool = SizeClassPool::new(16, 2);
        let a = pool.claim(owner("/a", 0), 1).unwrap();
        let b = pool.claim(owner("/a", 1), 2).unwrap();
        assert_ne!(a.slot, b.slot);
        assert!(pool.claim(owner("/a", 2), 3).is_none());
        assert_eq!(pool.free_count(), 0);

        pool.release(a);
        assert_eq!(pool.free_count(), 1);
        let c = pool.claim(owner("/b", 0), 4).unwrap();
        assert_eq!(c.slot, a.slot);
        assert_ne!(c.generation, a.generation);
    }

    #[test]
    fn test_release_of_stale_claim_is_ignored() {
        let pool = SizeClassPool::new(16, 1);
        let first = pool.claim(owner("/a", 0), 1).unwrap();
        let second = pool.reassign(first.slot, owner("/b", 0), 2);
        pool.release(first);
        assert!(pool.is_current(second));
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_payload_is_zeroed_on_claim() {
        let pool = SizeClassPool::new(8, 1);
        let a = pool.claim(owner("/a", 0), 1).unwrap();
        pool.data(a).copy_from_slice(&[7; 8]);
        pool.release(a);
        let b = pool.claim(owner("/b", 0), 2).unwrap();
        assert_eq!(&pool.data(b)[..], &[0; 8]);
    }

    #[test]
    fn test_eviction_order_clean_then_lru_then_fifo() {
        let pool = SizeClassPool::new(8, 4);
        let dirty_old = pool.claim(owner("/a", 0), 1).unwrap();
        let clean_recent = pool.claim(owner("/a", 1), 2).unwrap();
        let clean_old = pool.claim(owner("/a", 2), 3).unwrap();
        let clean_tie = pool.claim(owner("/a", 3), 4).unwrap();
        pool.set_dirty(dirty_old, true);
        pool.touch(clean_recent, 10);
        pool.touch(clean_old, 5);
        pool.touch(clean_tie, 5);

        assert_eq!(
            pool.eviction_candidates(),
            vec![clean_old.slot, clean_tie.slot, clean_recent.slot, dirty_old.slot]
        );
    }
}
