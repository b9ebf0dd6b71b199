//! Chunk building: flatten a slot, encode it, share or store it, publish it.
//!
//! A rebuild never writes over storage a published entry can reach. New
//! words go to freshly allocated space, the direct entry is published after
//! them, and only then is the slot's previous chunk released. Released space
//! is reused only once every reader that could have loaded the old entry has
//! moved on to a later table generation.

mod alloc;
mod dedup;


pub use alloc::{ChunkDescriptor, DescId, DescState, Relocation, NIL};

use alloc::ChunkAllocator;
use dedup::{content_hash, DedupIndex};

use crate::error::FormatOverflow;
use crate::flatten::{Breakpoint, Flattener};
use crate::rib::RouteSource;
use crate::table::format::*;
use crate::table::{DirectEntry, Tables};
use crate::Result;

/// Encode breakpoints in short format.
///
/// Fails on the first breakpoint that is not 256-aligned or whose next-hop
/// needs more than 8 bits.
pub fn encode_short(bps: &[Breakpoint], words: &mut Vec<u32>) -> std::result::Result<(), FormatOverflow> {
    words.clear();
    if needs_header(bps.len()) {
        words.push((bps.len() - 1) as u32);
    }
    for pair in bps.chunks(2) {
        let mut halves = [0u16; 2];
        for (half, bp) in halves.iter_mut().zip(pair) {
            if bp.offset % SHORT_GRANULE != 0 || !bp.nexthop.fits_short() {
                return Err(FormatOverflow);
            }
            *half = short_entry((bp.offset / SHORT_GRANULE) as u8, bp.nexthop.id() as u8);
        }
        words.push(short_pair(halves[0], halves[1]));
    }
    Ok(())
}

/// Encode breakpoints in long format; always succeeds.
pub fn encode_long(bps: &[Breakpoint], words: &mut Vec<u32>) {
    words.clear();
    if needs_header(bps.len()) {
        words.push((bps.len() - 1) as u32);
    }
    words.extend(bps.iter().map(|bp| long_entry(bp.offset as u16, bp.nexthop)));
}

/// Encode in the narrowest format the breakpoints allow. Returns whether
/// the long format was used.
pub fn encode(bps: &[Breakpoint], words: &mut Vec<u32>) -> bool {
    match encode_short(bps, words) {
        Ok(()) => false,
        Err(FormatOverflow) => {
            encode_long(bps, words);
            true
        }
    }
}

/// What a slot rebuild did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// Published entry already matched the new content
    Unchanged,
    /// Collapsed to a single next-hop
    Resolved,
    /// Reused an identical chunk of another slot
    Shared,
    /// Stored a new chunk
    Allocated,
}

/// Lifetime counters of the builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildCounters {
    pub rebuilds: u64,
    pub unchanged: u64,
    pub resolved: u64,
    pub shared: u64,
    pub allocated: u64,
    pub released: u64,
}

/// Occupancy of the range table and descriptor arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub chunks: usize,
    pub chunk_refs: usize,
    pub fragments: usize,
    pub used_words: usize,
    pub free_words: usize,
    pub quarantined_words: usize,
    pub top: usize,
}

/// Result of a compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Chunks whose base changed
    pub moved_chunks: usize,
    /// Words the bump pointer moved down by
    pub reclaimed_words: usize,
    /// Bump pointer after the pass
    pub top: usize,
}

pub struct ChunkBuilder {
    direct_bits: u8,
    flattener: Flattener,
    alloc: ChunkAllocator,
    dedup: DedupIndex,
    /// Descriptor of each chunked slot, `NIL` for resolved slots
    slot_desc: Vec<DescId>,
    words: Vec<u32>,
    /// Table generation readers currently load
    generation: u64,
    counters: BuildCounters,
}

impl ChunkBuilder {
    pub fn new(direct_bits: u8, range_capacity: usize) -> Self {
        Self {
            direct_bits,
            flattener: Flattener::new(),
            alloc: ChunkAllocator::new(range_capacity),
            dedup: DedupIndex::new(),
            slot_desc: vec![NIL; 1 << direct_bits],
            words: Vec::new(),
            generation: 0,
            counters: BuildCounters::default(),
        }
    }

    pub fn counters(&self) -> BuildCounters {
        self.counters
    }

    /// Descriptor backing `slot`, if it is chunked.
    pub fn descriptor(&self, slot: usize) -> Option<&ChunkDescriptor> {
        match self.slot_desc[slot] {
            NIL => None,
            id => Some(self.alloc.get(id)),
        }
    }

    /// Batch boundary: space released while a generation older than
    /// `oldest_in_use` was published becomes reusable.
    pub fn begin_batch(&mut self, oldest_in_use: u64) -> usize {
        self.alloc.recycle(oldest_in_use)
    }

    /// Readers now load generation `generation`; later releases are tagged
    /// with it.
    pub fn enter_generation(&mut self, generation: u64) {
        debug_assert!(generation >= self.generation);
        self.generation = generation;
    }

    /// Whether chunks were released since the current generation was
    /// published. Their space needs a new generation before it can be reused.
    pub fn released_this_generation(&self) -> bool {
        self.alloc.released_in(self.generation)
    }

    /// Recompute `slot` from the route source and publish the result.
    ///
    /// On error the slot's published entry and its chunk are untouched.
    pub fn rebuild_slot<S: RouteSource + ?Sized>(
        &mut self,
        tables: &Tables,
        source: &S,
        slot: usize,
    ) -> Result<SlotOutcome> {
        self.counters.rebuilds += 1;
        let first = (slot as u32) << (32 - self.direct_bits as u32);
        let bps = self.flattener.flatten(source, first, self.direct_bits)?;

        if bps.len() == 1 {
            let entry = DirectEntry::resolved(bps[0].nexthop);
            if self.slot_desc[slot] == NIL && tables.direct_entry(slot) == entry {
                self.counters.unchanged += 1;
                return Ok(SlotOutcome::Unchanged);
            }
            tables.publish(slot, entry);
            self.unref(slot);
            self.counters.resolved += 1;
            log::trace!("slot {:#x} resolved to {}", slot, entry.nexthop());
            return Ok(SlotOutcome::Resolved);
        }

        let count = bps.len();
        let long = encode(bps, &mut self.words);
        let hash = content_hash(long, count as u32, &self.words);
        let words = &self.words;
        let same = |d: &ChunkDescriptor| {
            d.long == long
                && d.count as usize == count
                && d.cur_size as usize == words.len()
                && tables.words_equal(d.base as usize, words)
        };

        let current = self.slot_desc[slot];
        if current != NIL {
            let d = self.alloc.get(current);
            if d.hash == hash && same(d) {
                self.counters.unchanged += 1;
                return Ok(SlotOutcome::Unchanged);
            }
        }

        let (id, outcome) = match self.dedup.find(self.alloc.arena(), hash, same) {
            Some(id) => (id, SlotOutcome::Shared),
            None => {
                let id = self.alloc.alloc(self.words.len() as u32)?;
                let d = self.alloc.get_mut(id);
                d.hash = hash;
                d.long = long;
                d.count = count as u32;
                tables.store_words(d.base as usize, &self.words);
                self.dedup.insert(self.alloc.arena_mut(), id);
                (id, SlotOutcome::Allocated)
            }
        };

        let d = self.alloc.get_mut(id);
        d.refcount += 1;
        d.slots.push(slot as u32);
        tables.publish(slot, DirectEntry::chunk(d.base, count, long));
        log::trace!(
            "slot {:#x}: {} {} breakpoints at {} ({:?})",
            slot,
            count,
            if long { "long" } else { "short" },
            d.base,
            outcome
        );

        self.unref(slot);
        self.slot_desc[slot] = id;
        match outcome {
            SlotOutcome::Shared => self.counters.shared += 1,
            _ => self.counters.allocated += 1,
        }
        Ok(outcome)
    }

    /// Drop the slot's reference to its chunk, releasing it when unused.
    fn unref(&mut self, slot: usize) {
        let id = std::mem::replace(&mut self.slot_desc[slot], NIL);
        if id == NIL {
            return;
        }
        let d = self.alloc.get_mut(id);
        debug_assert!(d.refcount > 0);
        d.refcount -= 1;
        if let Some(pos) = d.slots.iter().position(|&s| s as usize == slot) {
            d.slots.swap_remove(pos);
        }
        if d.refcount == 0 {
            self.dedup.remove(self.alloc.arena_mut(), id);
            self.alloc.release(id, self.generation);
            self.counters.released += 1;
        }
    }

    /// Rewrite `old` into `new` without holes.
    ///
    /// `new` must be unpublished; readers keep using `old` until the caller
    /// swaps the tables.
    pub fn compact_into(&mut self, old: &Tables, new: &Tables) -> CompactionReport {
        let before = self.alloc.top();
        for slot in 0..old.slot_count() {
            new.publish(slot, old.direct_entry(slot));
        }

        let moves = self.alloc.compact();
        let mut moved_chunks = 0;
        for m in &moves {
            new.copy_words_from(old, m.from as usize, m.to as usize, m.size as usize);
            if m.from != m.to {
                moved_chunks += 1;
            }
            for &slot in &self.alloc.get(m.id).slots {
                let entry = old.direct_entry(slot as usize).with_base(m.to);
                new.publish(slot as usize, entry);
            }
        }

        CompactionReport {
            moved_chunks,
            reclaimed_words: (before - self.alloc.top()) as usize,
            top: self.alloc.top() as usize,
        }
    }

    pub fn occupancy(&self) -> Occupancy {
        let mut occ = Occupancy {
            top: self.alloc.top() as usize,
            ..Occupancy::default()
        };
        for d in self.alloc.iter_state(DescState::Used) {
            occ.chunks += 1;
            occ.chunk_refs += d.refcount as usize;
            occ.fragments += d.count as usize;
            occ.used_words += d.cur_size as usize;
        }
        occ.free_words = self
            .alloc
            .iter_state(DescState::Free)
            .map(|d| d.max_size as usize)
            .sum();
        occ.quarantined_words = self
            .alloc
            .iter_state(DescState::Quarantined)
            .map(|d| d.max_size as usize)
            .sum();
        occ
    }

    /// Descriptors reachable through the dedup index.
    pub fn indexed_chunks(&self) -> usize {
        self.dedup.len(self.alloc.arena())
    }
}
