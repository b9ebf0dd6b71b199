//! Direct and range tables plus the lock-free lookup path.

use std::sync::atomic::{AtomicU32, Ordering};

use super::format::*;
use crate::NextHop;

/// The two published tables.
///
/// Readers only ever load from these arrays. The single writer stores new
/// breakpoint words with `Relaxed` ordering and then publishes the direct
/// entry that makes them reachable with `Release`; lookups load the direct
/// entry with `Acquire`, so a reachable chunk is always fully written.
pub struct Tables {
    direct_bits: u8,
    direct: Box<[AtomicU32]>,
    range: Box<[AtomicU32]>,
}

impl Tables {
    /// Allocate tables with every slot resolved to "no route".
    pub fn new(direct_bits: u8, range_capacity: usize) -> Self {
        let empty = DirectEntry::resolved(NextHop::NONE).raw();
        let direct = (0..1usize << direct_bits)
            .map(|_| AtomicU32::new(empty))
            .collect();
        let range = (0..range_capacity).map(|_| AtomicU32::new(0)).collect();
        Self {
            direct_bits,
            direct,
            range,
        }
    }

    pub fn direct_bits(&self) -> u8 {
        self.direct_bits
    }

    pub fn slot_count(&self) -> usize {
        self.direct.len()
    }

    pub fn range_capacity(&self) -> usize {
        self.range.len()
    }

    /// Bits of an address below the direct index.
    #[inline]
    fn slot_shift(&self) -> u32 {
        32 - self.direct_bits as u32
    }

    /// Resolve `addr` to a next-hop.
    ///
    /// Resolved slots cost one load. Chunked slots add a binary search whose
    /// steps are fixed by the chunk's size class.
    #[inline]
    pub fn lookup(&self, addr: u32) -> NextHop {
        let slot = (addr >> self.slot_shift()) as usize;
        self.resolve(DirectEntry::from_raw(self.direct[slot].load(Ordering::Acquire)), addr)
    }

    /// Resolve `addr` through an already loaded direct entry.
    #[inline]
    pub(crate) fn resolve(&self, entry: DirectEntry, addr: u32) -> NextHop {
        if entry.is_resolved() {
            return entry.nexthop();
        }

        let key = addr & ((1u32 << self.slot_shift()) - 1);
        let (base, count) = if entry.is_xl() {
            let header = entry.base() as usize;
            (header + 1, self.word(header) as usize + 1)
        } else {
            (entry.base() as usize, entry.fragments() as usize + 1)
        };

        if entry.is_long() {
            let i = locate(count, key, |i| long_start(self.word(base + i)));
            long_nexthop(self.word(base + i))
        } else {
            let key = key >> 8;
            let i = locate(count, key, |i| short_start(short_half(self.word(base + i / 2), i)));
            short_nexthop(short_half(self.word(base + i / 2), i))
        }
    }

    #[inline]
    pub(crate) fn word(&self, index: usize) -> u32 {
        self.range[index].load(Ordering::Relaxed)
    }

    pub(crate) fn words_equal(&self, base: usize, words: &[u32]) -> bool {
        words
            .iter()
            .enumerate()
            .all(|(i, w)| self.word(base + i) == *w)
    }

    /// Copy `words` into unpublished range storage.
    pub(crate) fn store_words(&self, base: usize, words: &[u32]) {
        for (slot, w) in self.range[base..base + words.len()].iter().zip(words) {
            slot.store(*w, Ordering::Relaxed);
        }
    }

    /// Move `len` words between two tables (compaction).
    pub(crate) fn copy_words_from(&self, src: &Tables, from: usize, to: usize, len: usize) {
        for i in 0..len {
            self.range[to + i].store(src.word(from + i), Ordering::Relaxed);
        }
    }

    pub(crate) fn direct_entry(&self, slot: usize) -> DirectEntry {
        DirectEntry::from_raw(self.direct[slot].load(Ordering::Relaxed))
    }

    /// Make `entry` visible to readers. Every word it references must
    /// already be stored.
    pub(crate) fn publish(&self, slot: usize, entry: DirectEntry) {
        self.direct[slot].store(entry.raw(), Ordering::Release);
    }
}

/// Index of the last of `count` ascending breakpoints starting at or
/// before `key`. Breakpoint 0 starts at 0.
///
/// Small chunks get a constant first step, so their search is a fixed
/// sequence of probes with no loop left after inlining.
#[inline(always)]
fn locate(count: usize, key: u32, start: impl Fn(usize) -> u32) -> usize {
    match count {
        0 | 1 => 0,
        2 => descend(count, 1, key, start),
        3..=4 => descend(count, 2, key, start),
        5..=8 => descend(count, 4, key, start),
        9..=16 => descend(count, 8, key, start),
        17..=32 => descend(count, 16, key, start),
        33..=64 => descend(count, 32, key, start),
        65..=128 => descend(count, 64, key, start),
        _ => descend(count, 1 << (usize::BITS - 1 - (count - 1).leading_zeros()), key, start),
    }
}

/// Power-of-two descent. `top` is the largest power of two below `count`;
/// the steps sum to at least `count - 1`, so every index is reachable.
#[inline(always)]
fn descend(count: usize, top: usize, key: u32, start: impl Fn(usize) -> u32) -> usize {
    let mut lo = 0;
    let mut step = top;
    while step > 0 {
        if lo + step < count && start(lo + step) <= key {
            lo += step;
        }
        step >>= 1;
    }
    lo
}
