//! Slot storage for the handle table
//!
//! Slots live in geometrically growing buckets that are allocated once and
//! never move, so a slot reference stays valid while other threads grow the
//! table. Bucket `b` holds `64 << b` slots.

use super::{Handle, RawHandle, ResourceKind};
use crate::error::{BridgeError, Result};
use crate::logging::{trace, warn};
use crossbeam::queue::SegQueue;
use once_cell::sync::OnceCell;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};

const FIRST_BUCKET_SHIFT: u32 = 6;
const BUCKETS: usize = 27;

const LIVE: u64 = 1;
const KIND_SHIFT: u32 = 1;
const KIND_MASK: u64 = 0xFF << KIND_SHIFT;

/// Slot state word: `generation << 32 | kind << 1 | live`
#[inline]
const fn pack(generation: u32, kind: u8, live: bool) -> u64 {
    ((generation as u64) << 32) | ((kind as u64) << KIND_SHIFT) | live as u64
}

#[inline]
const fn generation_of(state: u64) -> u32 {
    (state >> 32) as u32
}

#[inline]
const fn kind_bits(state: u64) -> u8 {
    ((state & KIND_MASK) >> KIND_SHIFT) as u8
}

#[inline]
fn locate(index: u32) -> (usize, usize) {
    let adjusted = index as u64 + (1u64 << FIRST_BUCKET_SHIFT);
    let bucket = (63 - adjusted.leading_zeros()) - FIRST_BUCKET_SHIFT;
    let offset = adjusted - (1u64 << (bucket + FIRST_BUCKET_SHIFT));
    (bucket as usize, offset as usize)
}

#[inline]
const fn bucket_len(bucket: usize) -> usize {
    1usize << (bucket as u32 + FIRST_BUCKET_SHIFT)
}

struct Slot {
    state: AtomicU64,
    words: [AtomicU64; 3],
}

impl Slot {
    fn vacant() -> Self {
        Self {
            state: AtomicU64::new(0),
            words: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    #[inline]
    fn load_words(&self) -> RawHandle {
        RawHandle::from_words([
            self.words[0].load(Ordering::Relaxed),
            self.words[1].load(Ordering::Relaxed),
            self.words[2].load(Ordering::Relaxed),
        ])
    }
}

/// Snapshot of a live slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub raw: RawHandle,
    pub kind: ResourceKind,
}

/// Table counters for audits and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStats {
    pub live: usize,
    pub registered: u64,
    pub retired: u64,
    pub slots: usize,
}

/// Generational arena mapping [`Handle`]s to raw foreign tokens.
pub struct HandleTable {
    buckets: [OnceCell<Box<[Slot]>>; BUCKETS],
    free: SegQueue<u32>,
    next_fresh: AtomicU32,
    live: AtomicUsize,
    registered: AtomicU64,
    retired: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| OnceCell::new()),
            free: SegQueue::new(),
            next_fresh: AtomicU32::new(0),
            live: AtomicUsize::new(0),
            registered: AtomicU64::new(0),
            retired: AtomicU64::new(0),
        }
    }

    /// Create a table with the buckets covering `slots` allocated up front
    pub fn with_prewarm(slots: usize) -> Self {
        let table = Self::new();
        let mut covered = 0;
        let mut bucket = 0;
        while covered < slots && bucket < BUCKETS {
            table.bucket(bucket);
            covered += bucket_len(bucket);
            bucket += 1;
        }
        table
    }

    fn bucket(&self, bucket: usize) -> &[Slot] {
        self.buckets[bucket].get_or_init(|| {
            trace!(target: "handles", bucket, slots = bucket_len(bucket), "allocating slot bucket");
            (0..bucket_len(bucket)).map(|_| Slot::vacant()).collect()
        })
    }

    #[inline]
    fn slot(&self, index: u32) -> Option<&Slot> {
        let (bucket, offset) = locate(index);
        self.buckets[bucket].get().map(|slots| &slots[offset])
    }

    fn claim_index(&self) -> u32 {
        if let Some(index) = self.free.pop() {
            return index;
        }
        let index = self.next_fresh.fetch_add(1, Ordering::Relaxed);
        assert!(index != u32::MAX, "handle table exhausted");
        index
    }

    /// Wrap a raw foreign token in a fresh handle.
    ///
    /// Never fails; reuses retired slots first.
    ///
    /// # Panics
    /// Only when all `u32::MAX` slot indices are live at once.
    pub fn register(&self, raw: RawHandle, kind: ResourceKind) -> Handle {
        let index = self.claim_index();
        let (bucket, offset) = locate(index);
        let slot = &self.bucket(bucket)[offset];

        // Orders the retirement that freed this slot before the new words, so
        // a racing validate that reads them also sees the bumped generation.
        fence(Ordering::Release);

        let words = raw.words();
        for (cell, word) in slot.words.iter().zip(words) {
            cell.store(word, Ordering::Relaxed);
        }

        let generation = generation_of(slot.state.load(Ordering::Relaxed));
        slot.state
            .store(pack(generation, kind as u8, true), Ordering::Release);

        self.live.fetch_add(1, Ordering::Relaxed);
        self.registered.fetch_add(1, Ordering::Relaxed);

        let handle = Handle::new(index, generation);
        trace!(target: "handles", ?handle, ?kind, "registered");
        handle
    }

    fn stale(&self, handle: Handle, state: Option<u64>) -> BridgeError {
        BridgeError::StaleHandle {
            index: handle.index(),
            expected: handle.generation(),
            found: state.map(generation_of).unwrap_or(0),
        }
    }

    #[inline]
    fn check(&self, handle: Handle, state: u64) -> Result<ResourceKind> {
        if state & LIVE == 0 || generation_of(state) != handle.generation() {
            return Err(self.stale(handle, Some(state)));
        }
        ResourceKind::from_u8(kind_bits(state)).ok_or_else(|| self.stale(handle, Some(state)))
    }

    /// Raw token and kind for a live handle.
    pub fn entry(&self, handle: Handle) -> Result<Entry> {
        let slot = self
            .slot(handle.index())
            .ok_or_else(|| self.stale(handle, None))?;

        let before = slot.state.load(Ordering::Acquire);
        let kind = self.check(handle, before)?;
        let raw = slot.load_words();
        fence(Ordering::Acquire);
        let after = slot.state.load(Ordering::Relaxed);

        if after != before {
            return Err(self.stale(handle, Some(after)));
        }
        Ok(Entry { raw, kind })
    }

    /// Check the handle's generation and return its raw token.
    pub fn validate(&self, handle: Handle) -> Result<RawHandle> {
        self.entry(handle).map(|entry| entry.raw)
    }

    /// Invalidate every copy of `handle` and free its slot for reuse.
    ///
    /// Does not touch the foreign resource. Of two racing retirements of the
    /// same handle exactly one succeeds; the other sees a stale generation.
    pub fn retire(&self, handle: Handle) -> Result<Entry> {
        let slot = self
            .slot(handle.index())
            .ok_or_else(|| self.stale(handle, None))?;

        let current = slot.state.load(Ordering::Acquire);
        let kind = self.check(handle, current)?;
        let next_generation = handle.generation().wrapping_add(1);
        let next = pack(next_generation, kind as u8, false);

        slot.state
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|found| self.stale(handle, Some(found)))?;

        let raw = slot.load_words();

        if next_generation == u32::MAX {
            // Reusing the slot would eventually wrap back onto live handles.
            warn!(target: "handles", index = handle.index(), "slot generation exhausted, slot retired permanently");
        } else {
            self.free.push(handle.index());
        }

        self.live.fetch_sub(1, Ordering::Relaxed);
        self.retired.fetch_add(1, Ordering::Relaxed);
        trace!(target: "handles", ?handle, "retired");

        Ok(Entry { raw, kind })
    }

    /// Whether `handle` still refers to a live slot
    #[inline]
    pub fn is_live(&self, handle: Handle) -> bool {
        self.entry(handle).is_ok()
    }

    /// Number of live (registered, not yet retired) slots
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TableStats {
        let slots = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| bucket.get().is_some())
            .map(|(i, _)| bucket_len(i))
            .sum();

        TableStats {
            live: self.live_count(),
            registered: self.registered.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            slots,
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandleTable")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
pub(super) fn locate_for_tests(index: u32) -> (usize, usize) {
    locate(index)
}

#[cfg(test)]
pub(super) fn force_generation(table: &HandleTable, index: u32, generation: u32) {
    if let Some(slot) = table.slot(index) {
        let state = slot.state.load(Ordering::Relaxed);
        let live = state & LIVE;
        let kind = kind_bits(state);
        slot.state
            .store(pack(generation, kind, live == 1), Ordering::Relaxed);
    }
}
