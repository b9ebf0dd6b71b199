//! Update scheduling: which slots need a rebuild, and when.
//!
//! Route notifications only mark the direct-table slots a prefix covers.
//! Rebuilding happens later in a batch, either right after the notification
//! (synchronous mode) or once the batch interval has elapsed (asynchronous
//! mode).

use std::time::{Duration, Instant};

use crate::config::Config;

/// One dirty bit per slot, plus a bound on where the set bits are.
#[derive(Debug, Clone)]
pub struct PendingBitmap {
    words: Vec<u64>,
    /// Inclusive `[low, high]` range holding every set bit
    bounds: Option<(usize, usize)>,
    count: usize,
}

impl PendingBitmap {
    pub fn new(slots: usize) -> Self {
        Self {
            words: vec![0; slots.div_ceil(64)],
            bounds: None,
            count: 0,
        }
    }

    /// Number of dirty slots.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Inclusive range containing every dirty slot.
    pub fn bounds(&self) -> Option<(usize, usize)> {
        self.bounds
    }

    pub fn is_dirty(&self, slot: usize) -> bool {
        self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Mark the slots `first..=last`.
    pub fn mark_range(&mut self, first: usize, last: usize) {
        debug_assert!(first <= last);
        for slot in first..=last {
            let bit = 1u64 << (slot % 64);
            let word = &mut self.words[slot / 64];
            if *word & bit == 0 {
                *word |= bit;
                self.count += 1;
            }
        }
        self.bounds = Some(match self.bounds {
            Some((low, high)) => (low.min(first), high.max(last)),
            None => (first, last),
        });
    }

    /// Clear one slot. Returns whether it was dirty.
    pub fn clear(&mut self, slot: usize) -> bool {
        let bit = 1u64 << (slot % 64);
        let word = &mut self.words[slot / 64];
        if *word & bit == 0 {
            return false;
        }
        *word &= !bit;
        self.count -= 1;
        if self.count == 0 {
            self.bounds = None;
        }
        true
    }

    /// First dirty slot at or after `from`, within the pending bound.
    pub fn next_dirty(&self, from: usize) -> Option<usize> {
        let (low, high) = self.bounds?;
        let from = from.max(low);
        if from > high {
            return None;
        }

        let mut index = from / 64;
        let mut word = self.words[index] & (!0u64 << (from % 64));
        loop {
            if word != 0 {
                let slot = index * 64 + word.trailing_zeros() as usize;
                return (slot <= high).then_some(slot);
            }
            index += 1;
            if index * 64 > high {
                return None;
            }
            word = self.words[index];
        }
    }

    /// Shrink the bound to the dirty slots actually left.
    pub fn tighten(&mut self) {
        let Some((low, high)) = self.bounds else {
            return;
        };
        let Some(first) = self.next_dirty(low) else {
            self.bounds = None;
            return;
        };
        let mut last = first;
        let mut slot = first;
        while let Some(next) = self.next_dirty(slot + 1) {
            last = next;
            slot = next;
            if slot >= high {
                break;
            }
        }
        self.bounds = Some((first, last));
    }
}

/// Slots of a `direct_bits` table covered by `prefix/mask_len`, inclusive.
pub fn slot_range(prefix: u32, mask_len: u8, direct_bits: u8) -> (usize, usize) {
    let shift = 32 - direct_bits as u32;
    let first = (prefix & crate::rib::prefix_mask(mask_len)) >> shift;
    if mask_len >= direct_bits {
        return (first as usize, first as usize);
    }
    let span = 1usize << (direct_bits - mask_len);
    (first as usize, first as usize + span - 1)
}

/// Where the scheduler is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Nothing pending
    Idle,
    /// Slots marked, waiting for a batch
    Dirty,
    /// A batch is running
    Applying,
}

/// Dirty-slot tracking and batch timing.
#[derive(Debug)]
pub struct UpdateScheduler {
    direct_bits: u8,
    async_mode: bool,
    interval: Duration,
    last_batch: Instant,
    state: SchedulerState,
    pending: PendingBitmap,
}

impl UpdateScheduler {
    pub fn new(config: &Config) -> Self {
        Self {
            direct_bits: config.direct_bits,
            async_mode: config.async_mode,
            interval: config.batch_interval,
            last_batch: Instant::now(),
            state: SchedulerState::Idle,
            pending: PendingBitmap::new(config.slot_count()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_async(&self) -> bool {
        self.async_mode
    }

    pub fn pending(&self) -> &PendingBitmap {
        &self.pending
    }

    /// Mark every slot covered by the prefix. Returns the number of slots.
    pub fn mark_prefix(&mut self, prefix: u32, mask_len: u8) -> usize {
        let (first, last) = slot_range(prefix, mask_len, self.direct_bits);
        self.pending.mark_range(first, last);
        if self.state == SchedulerState::Idle {
            self.state = SchedulerState::Dirty;
        }
        last - first + 1
    }

    /// Mark the whole direct table.
    pub fn mark_all(&mut self) {
        self.mark_prefix(0, 0);
    }

    /// Whether a batch should run at `now`.
    ///
    /// Synchronous schedulers are due whenever something is pending, which
    /// only happens when an earlier apply left slots behind.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        !self.async_mode || now.saturating_duration_since(self.last_batch) >= self.interval
    }

    pub(crate) fn begin_apply(&mut self) {
        self.state = SchedulerState::Applying;
    }

    pub(crate) fn clear(&mut self, slot: usize) {
        self.pending.clear(slot);
    }

    pub(crate) fn finish_apply(&mut self, now: Instant) {
        self.pending.tighten();
        self.last_batch = now;
        self.state = if self.pending.is_empty() {
            SchedulerState::Idle
        } else {
            SchedulerState::Dirty
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_range() {
        assert_eq!(slot_range(0x0A01_0000, 16, 16), (0x0A01, 0x0A01));
        assert_eq!(slot_range(0x0A01_0480, 25, 16), (0x0A01, 0x0A01));
        assert_eq!(slot_range(0x0A00_0000, 8, 16), (0x0A00, 0x0AFF));
        assert_eq!(slot_range(0, 0, 20), (0, (1 << 20) - 1));
        // Host bits beyond the mask are ignored.
        assert_eq!(slot_range(0x0AFF_FFFF, 8, 16), (0x0A00, 0x0AFF));
    }

    #[test]
    fn test_mark_and_clear_tracks_bounds() {
        let mut bits = PendingBitmap::new(1 << 16);
        assert!(bits.is_empty());
        assert_eq!(bits.next_dirty(0), None);

        bits.mark_range(100, 103);
        bits.mark_range(70, 70);
        bits.mark_range(101, 101);
        assert_eq!(bits.len(), 5);
        assert_eq!(bits.bounds(), Some((70, 103)));
        assert!(bits.is_dirty(102));
        assert!(!bits.is_dirty(99));

        assert_eq!(bits.next_dirty(0), Some(70));
        assert_eq!(bits.next_dirty(71), Some(100));
        assert_eq!(bits.next_dirty(104), None);

        assert!(bits.clear(70));
        assert!(!bits.clear(70));
        bits.tighten();
        assert_eq!(bits.bounds(), Some((100, 103)));

        for slot in 100..=103 {
            bits.clear(slot);
        }
        assert!(bits.is_empty());
        assert_eq!(bits.bounds(), None);
    }

    #[test]
    fn test_next_dirty_crosses_words() {
        let mut bits = PendingBitmap::new(1 << 16);
        bits.mark_range(5, 5);
        bits.mark_range(64 * 40 + 3, 64 * 40 + 3);
        assert_eq!(bits.next_dirty(6), Some(64 * 40 + 3));
        assert_eq!(bits.next_dirty(64 * 40 + 4), None);
    }

    #[test]
    fn test_sync_scheduler_states() {
        let config = Config::compact();
        let mut s = UpdateScheduler::new(&config);
        let now = Instant::now();
        assert_eq!(s.state(), SchedulerState::Idle);
        assert!(!s.is_due(now));

        assert_eq!(s.mark_prefix(0x0A00_0000, 8), 256);
        assert_eq!(s.state(), SchedulerState::Dirty);
        assert!(s.is_due(now));

        s.begin_apply();
        assert_eq!(s.state(), SchedulerState::Applying);
        for slot in 0x0A00..=0x0AFF {
            s.clear(slot);
        }
        s.finish_apply(now);
        assert_eq!(s.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_async_scheduler_waits_for_interval() {
        let config = Config::compact().with_async(Duration::from_secs(3600));
        let mut s = UpdateScheduler::new(&config);
        s.mark_prefix(0x0A01_0000, 24);
        let now = Instant::now();
        assert!(!s.is_due(now));
        assert!(!s.is_due(now + Duration::from_secs(3599)));
        assert!(s.is_due(now + Duration::from_secs(3601)));
    }

    #[test]
    fn test_unfinished_batch_stays_dirty() {
        let mut s = UpdateScheduler::new(&Config::compact());
        s.mark_prefix(0x0A00_0000, 15);
        s.begin_apply();
        s.clear(0x0A00);
        s.finish_apply(Instant::now());
        assert_eq!(s.state(), SchedulerState::Dirty);
        assert_eq!(s.pending().bounds(), Some((0x0A01, 0x0A01)));
    }
}
