//! The lookup structure: one writer, any number of lock-free readers.

use arc_swap::ArcSwap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use crate::chunk::{ChunkBuilder, CompactionReport, SlotOutcome};
use crate::config::Config;
use crate::rib::RouteSource;
use crate::scheduler::{SchedulerState, UpdateScheduler};
use crate::stats::Stats;
use crate::table::Tables;
use crate::{Error, NextHop, Result};

/// What one batch of slot rebuilds did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Dirty slots visited
    pub visited: usize,
    pub unchanged: usize,
    pub resolved: usize,
    pub shared: usize,
    pub allocated: usize,
    /// Slots left dirty after an error
    pub failed: usize,
    /// Quarantined chunks returned to the free list at the batch start
    pub recycled: usize,
    /// Whether the batch compacted the range table to make room
    pub compacted: bool,
}

impl BatchReport {
    fn record(&mut self, outcome: SlotOutcome) {
        match outcome {
            SlotOutcome::Unchanged => self.unchanged += 1,
            SlotOutcome::Resolved => self.resolved += 1,
            SlotOutcome::Shared => self.shared += 1,
            SlotOutcome::Allocated => self.allocated += 1,
        }
    }
}

/// Tables as handed to readers, numbered in publication order.
///
/// Every batch that releases chunks publishes a new generation over the same
/// tables. A chunk released under generation `n` is reused only after no
/// reader holds generation `n` or older.
struct Generation {
    number: u64,
    tables: Arc<Tables>,
}

/// Two-level compressed IPv4 longest-prefix-match table.
///
/// The writer side owns the rebuild machinery and takes `&mut self`; share
/// it behind your own lock. Lookups go through `&self` or a [`DxrReader`]
/// and never block.
///
/// # Example
///
/// ```
/// use dxr_fib::{Config, Dxr, NextHop, Rib};
///
/// let rib = Rib::new();
/// let mut dxr = Dxr::new(Config::compact()).unwrap();
///
/// rib.insert("10.0.0.0/8".parse().unwrap(), NextHop::new(1));
/// dxr.notify_route_added(&rib, 0x0A00_0000, 8, NextHop::new(1)).unwrap();
///
/// assert_eq!(dxr.lookup(0x0A01_0203), NextHop::new(1));
/// assert_eq!(dxr.lookup(0x0B00_0000), NextHop::NONE);
/// ```
pub struct Dxr {
    config: Config,
    /// Tables the writer updates; always those of the published generation
    tables: Arc<Tables>,
    published: Arc<ArcSwap<Generation>>,
    /// Replaced generations some reader may still hold
    retired: Vec<Arc<Generation>>,
    generation: u64,
    builder: ChunkBuilder,
    scheduler: UpdateScheduler,
    batches: u64,
    compactions: u64,
}

impl Dxr {
    /// Create an empty table: every address resolves to [`NextHop::NONE`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let tables = Arc::new(Tables::new(config.direct_bits, config.range_capacity));
        log::info!(
            "DXR table created: {} direct bits, {} range words, {} mode",
            config.direct_bits,
            config.range_capacity,
            if config.async_mode { "async" } else { "sync" }
        );
        Ok(Self {
            builder: ChunkBuilder::new(config.direct_bits, config.range_capacity),
            scheduler: UpdateScheduler::new(&config),
            published: Arc::new(ArcSwap::from_pointee(Generation {
                number: 0,
                tables: Arc::clone(&tables),
            })),
            tables,
            retired: Vec::new(),
            generation: 0,
            config,
            batches: 0,
            compactions: 0,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve an address given as a host-order integer.
    #[inline]
    pub fn lookup(&self, addr: u32) -> NextHop {
        self.tables.lookup(addr)
    }

    pub fn lookup_addr(&self, addr: Ipv4Addr) -> NextHop {
        self.lookup(u32::from(addr))
    }

    /// A lookup handle for other threads.
    pub fn reader(&self) -> DxrReader {
        DxrReader {
            published: Arc::clone(&self.published),
        }
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Slots waiting for a rebuild.
    pub fn pending_slots(&self) -> usize {
        self.scheduler.pending().len()
    }

    /// A route was added to (or changed in) `source`.
    ///
    /// In synchronous mode the affected slots are rebuilt before returning
    /// and the batch report is returned.
    pub fn notify_route_added<S: RouteSource + ?Sized>(
        &mut self,
        source: &S,
        prefix: u32,
        mask_len: u8,
        nexthop: NextHop,
    ) -> Result<Option<BatchReport>> {
        check_mask_len(mask_len)?;
        let slots = self.scheduler.mark_prefix(prefix, mask_len);
        log::trace!(
            "route added: {}/{} via {} ({} slots)",
            Ipv4Addr::from(prefix),
            mask_len,
            nexthop,
            slots
        );
        if self.scheduler.is_async() {
            return Ok(None);
        }
        self.apply_pending(source).map(Some)
    }

    /// A route was removed from `source`.
    ///
    /// `remaining_refs` is how many routes still use the removed route's
    /// next-hop. When it reaches zero the next-hop is gone and the slots are
    /// rebuilt immediately, even in asynchronous mode.
    pub fn notify_route_removed<S: RouteSource + ?Sized>(
        &mut self,
        source: &S,
        prefix: u32,
        mask_len: u8,
        remaining_refs: usize,
    ) -> Result<Option<BatchReport>> {
        check_mask_len(mask_len)?;
        let slots = self.scheduler.mark_prefix(prefix, mask_len);
        log::trace!(
            "route removed: {}/{} ({} slots, {} refs left)",
            Ipv4Addr::from(prefix),
            mask_len,
            slots,
            remaining_refs
        );
        if self.scheduler.is_async() && remaining_refs > 0 {
            return Ok(None);
        }
        self.apply_pending(source).map(Some)
    }

    /// Rebuild every dirty slot from `source`.
    ///
    /// Slots that fail stay dirty for the next batch; the first error is
    /// returned after every other dirty slot has been attempted.
    pub fn apply_pending<S: RouteSource + ?Sized>(&mut self, source: &S) -> Result<BatchReport> {
        let start = Instant::now();
        self.scheduler.begin_apply();
        let oldest = self.oldest_generation_in_use();
        let mut report = BatchReport {
            recycled: self.builder.begin_batch(oldest),
            ..BatchReport::default()
        };

        let mut first_err = None;
        let mut cursor = 0;
        while let Some(slot) = self.scheduler.pending().next_dirty(cursor) {
            cursor = slot + 1;
            report.visited += 1;
            match self.rebuild_slot(source, slot, &mut report.compacted) {
                Ok(outcome) => {
                    report.record(outcome);
                    self.scheduler.clear(slot);
                }
                Err(e) => {
                    report.failed += 1;
                    first_err.get_or_insert(e);
                }
            }
        }

        if self.builder.released_this_generation() {
            self.publish_generation();
        }
        self.scheduler.finish_apply(Instant::now());
        self.batches += 1;
        log::debug!(
            "batch {}: {} slots in {:?} ({} unchanged, {} resolved, {} shared, {} allocated, {} failed, {} recycled)",
            self.batches,
            report.visited,
            start.elapsed(),
            report.unchanged,
            report.resolved,
            report.shared,
            report.allocated,
            report.failed,
            report.recycled
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Periodic driver: run a batch if one is due.
    pub fn poll<S: RouteSource + ?Sized>(&mut self, source: &S) -> Result<Option<BatchReport>> {
        if !self.scheduler.is_due(Instant::now()) {
            return Ok(None);
        }
        self.apply_pending(source).map(Some)
    }

    /// Mark every slot and rebuild the whole table from `source`.
    pub fn rebuild_all<S: RouteSource + ?Sized>(&mut self, source: &S) -> Result<BatchReport> {
        self.scheduler.mark_all();
        self.apply_pending(source)
    }

    fn rebuild_slot<S: RouteSource + ?Sized>(
        &mut self,
        source: &S,
        slot: usize,
        compacted: &mut bool,
    ) -> Result<SlotOutcome> {
        match self.builder.rebuild_slot(&self.tables, source, slot) {
            Err(Error::ResourceExhausted {
                requested,
                available,
            }) if self.config.compact_on_exhaustion && !*compacted => {
                log::warn!(
                    "range table exhausted at slot {:#x} ({} words requested, {} available), compacting",
                    slot,
                    requested,
                    available
                );
                self.compact();
                *compacted = true;
                self.builder.rebuild_slot(&self.tables, source, slot)
            }
            Err(e @ Error::ResourceExhausted { .. }) => {
                log::warn!("slot {:#x} left dirty: {}", slot, e);
                Err(e)
            }
            other => other,
        }
    }

    /// Rewrite the range table without holes and swap it in.
    ///
    /// Readers still holding the previous tables finish their lookups on
    /// them; the old tables are freed when the last of them lets go.
    pub fn compact(&mut self) -> CompactionReport {
        let new = Arc::new(Tables::new(self.config.direct_bits, self.config.range_capacity));
        let report = self.builder.compact_into(&self.tables, &new);
        self.tables = new;
        self.publish_generation();
        self.compactions += 1;
        log::info!(
            "compacted range table: {} chunks moved, {} words reclaimed, top now {}",
            report.moved_chunks,
            report.reclaimed_words,
            report.top
        );
        report
    }

    /// Hand readers a new generation over the writer's current tables.
    fn publish_generation(&mut self) {
        self.generation += 1;
        let next = Generation {
            number: self.generation,
            tables: Arc::clone(&self.tables),
        };
        let previous = self.published.swap(Arc::new(next));
        self.retired.retain(|g| Arc::strong_count(g) > 1);
        self.retired.push(previous);
        self.builder.enter_generation(self.generation);
        log::trace!("published generation {}", self.generation);
    }

    /// Oldest generation a reader may still be using.
    ///
    /// `ArcSwap` turns every outstanding load guard into a strong count when
    /// a value is swapped out, so a retired generation nobody else counts is
    /// unreachable.
    fn oldest_generation_in_use(&mut self) -> u64 {
        self.retired.retain(|g| Arc::strong_count(g) > 1);
        self.retired
            .first()
            .map_or(self.generation, |g| g.number)
    }

    pub fn stats(&self) -> Stats {
        Stats::collect(
            &self.tables,
            self.builder.occupancy(),
            self.builder.counters(),
            self.batches,
            self.compactions,
            self.scheduler.pending().len(),
        )
    }
}

fn check_mask_len(mask_len: u8) -> Result<()> {
    if mask_len > 32 {
        return Err(Error::InvalidPrefix(format!(
            "prefix length {} exceeds 32",
            mask_len
        )));
    }
    Ok(())
}

/// Cloneable, lock-free lookup handle.
///
/// Each lookup uses the generation published at that moment and answers
/// from either the old or the new state of any slot being rebuilt. Chunk
/// storage it may still read is not reused until the lookup returns.
#[derive(Clone)]
pub struct DxrReader {
    published: Arc<ArcSwap<Generation>>,
}

impl DxrReader {
    #[inline]
    pub fn lookup(&self, addr: u32) -> NextHop {
        self.published.load().tables.lookup(addr)
    }

    pub fn lookup_addr(&self, addr: Ipv4Addr) -> NextHop {
        self.lookup(u32::from(addr))
    }
}
