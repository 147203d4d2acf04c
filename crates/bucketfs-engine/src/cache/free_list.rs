//! Lock-free free list of block slots.
//!
//! A Treiber stack over slot indices. The head packs a 32-bit ABA tag and
//! a 32-bit index into one `AtomicU64`; every successful CAS bumps the tag,
//! so a head that was popped and pushed back between a load and a CAS is
//! never mistaken for the unchanged head. Links live in a side array owned
//! by the size class.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// End-of-list marker.
pub(crate) const NIL: u32 = u32::MAX;

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[inline]
fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

#[derive(Debug)]
pub(crate) struct FreeList {
    head: AtomicU64,
}

impl FreeList {
    /// Builds a list holding every index of `links`, lowest index on top.
    pub(crate) fn full(links: &[AtomicU32]) -> Self {
        let len = links.len() as u32;
        for (i, link) in links.iter().enumerate() {
            let next = i as u32 + 1;
            link.store(if next < len { next } else { NIL }, Ordering::Relaxed);
        }
        let first = if len == 0 { NIL } else { 0 };
        Self {
            head: AtomicU64::new(pack(0, first)),
        }
    }

    pub(crate) fn pop(&self, links: &[AtomicU32]) -> Option<u32> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack(current);
            if index == NIL {
                return None;
            }
            let next = links[index as usize].load(Ordering::Acquire);
            match self.head.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn push(&self, links: &[AtomicU32], index: u32) {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(current);
            links[index as usize].store(top, Ordering::Release);
            match self.head.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
