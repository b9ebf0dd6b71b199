//! Table statistics.

use serde::Serialize;
use std::fmt;

use crate::chunk::{BuildCounters, Occupancy};
use crate::table::Tables;

/// Snapshot of the lookup structure's shape and history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub direct_bits: u8,
    pub slots: usize,
    /// Slots answered by the direct table alone
    pub resolved_slots: usize,
    pub short_slots: usize,
    pub long_slots: usize,
    /// Distinct stored chunks
    pub chunks: usize,
    /// Slot references to chunks
    pub chunk_refs: usize,
    /// References served by sharing instead of a chunk of their own
    pub aggregated: usize,
    /// Breakpoints stored across all chunks
    pub fragments: usize,
    pub range_capacity: usize,
    pub range_top: usize,
    pub range_used: usize,
    pub range_free: usize,
    pub range_quarantined: usize,
    pub rebuilds: u64,
    pub compactions: u64,
    pub batches: u64,
    pub pending_slots: usize,
}

impl Stats {
    pub(crate) fn collect(
        tables: &Tables,
        occupancy: Occupancy,
        counters: BuildCounters,
        batches: u64,
        compactions: u64,
        pending_slots: usize,
    ) -> Self {
        let mut stats = Stats {
            direct_bits: tables.direct_bits(),
            slots: tables.slot_count(),
            chunks: occupancy.chunks,
            chunk_refs: occupancy.chunk_refs,
            aggregated: occupancy.chunk_refs - occupancy.chunks,
            fragments: occupancy.fragments,
            range_capacity: tables.range_capacity(),
            range_top: occupancy.top,
            range_used: occupancy.used_words,
            range_free: occupancy.free_words,
            range_quarantined: occupancy.quarantined_words,
            rebuilds: counters.rebuilds,
            compactions,
            batches,
            pending_slots,
            ..Stats::default()
        };
        for slot in 0..tables.slot_count() {
            let entry = tables.direct_entry(slot);
            if entry.is_resolved() {
                stats.resolved_slots += 1;
            } else if entry.is_long() {
                stats.long_slots += 1;
            } else {
                stats.short_slots += 1;
            }
        }
        stats
    }

    /// Bytes held by both tables.
    pub fn memory_bytes(&self) -> usize {
        (self.slots + self.range_capacity) * std::mem::size_of::<u32>()
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Direct table: {} slots ({} bits)", self.slots, self.direct_bits)?;
        writeln!(
            f,
            "  resolved: {}, short: {}, long: {}",
            self.resolved_slots, self.short_slots, self.long_slots
        )?;
        writeln!(
            f,
            "Chunks: {} ({} refs, {} aggregated, {} fragments)",
            self.chunks, self.chunk_refs, self.aggregated, self.fragments
        )?;
        writeln!(
            f,
            "Range table: top {} of {} words (used {}, free {}, quarantined {})",
            self.range_top, self.range_capacity, self.range_used, self.range_free, self.range_quarantined
        )?;
        writeln!(
            f,
            "Rebuilds: {}, batches: {}, compactions: {}, pending: {}",
            self.rebuilds, self.batches, self.compactions, self.pending_slots
        )?;
        write!(f, "Memory: {} bytes", self.memory_bytes())
    }
}
