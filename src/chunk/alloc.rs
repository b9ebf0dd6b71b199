//! Range table allocator.
//!
//! Chunks are carved from the range table by a bump pointer. Released chunks
//! first wait in quarantine, tagged with the table generation readers could
//! reach them through. Once no reader holds that generation they join a
//! best-fit free list and merge with physically adjacent free neighbors.
//!
//! Descriptors live in an arena and link to each other by index:
//! `all_prev`/`all_next` keep every descriptor in base-address order,
//! `free_prev`/`free_next` thread the free list.

use crate::{Error, Result};

/// Index of a descriptor in the arena.
pub type DescId = u32;

/// Sentinel for "no descriptor".
pub const NIL: DescId = DescId::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescState {
    /// Arena slot available for a new descriptor
    Vacant,
    /// Referenced by at least one slot
    Used,
    /// Unreferenced, not yet reusable
    Quarantined,
    /// On the free list
    Free,
}

/// One physically stored chunk.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub state: DescState,
    pub refcount: u32,
    pub base: u32,
    /// Words holding breakpoints; 0 once released
    pub cur_size: u32,
    /// Words reserved
    pub max_size: u32,
    pub hash: u64,
    pub long: bool,
    /// Breakpoint count
    pub count: u32,
    /// Direct-table slots sharing this chunk
    pub slots: Vec<u32>,
    pub bucket_next: DescId,
    pub all_prev: DescId,
    pub all_next: DescId,
    pub free_prev: DescId,
    pub free_next: DescId,
}

impl ChunkDescriptor {
    fn vacant() -> Self {
        Self {
            state: DescState::Vacant,
            refcount: 0,
            base: 0,
            cur_size: 0,
            max_size: 0,
            hash: 0,
            long: false,
            count: 0,
            slots: Vec::new(),
            bucket_next: NIL,
            all_prev: NIL,
            all_next: NIL,
            free_prev: NIL,
            free_next: NIL,
        }
    }
}

/// A live chunk's move during compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub id: DescId,
    pub from: u32,
    pub to: u32,
    pub size: u32,
}

pub struct ChunkAllocator {
    arena: Vec<ChunkDescriptor>,
    vacant: Vec<DescId>,
    all_head: DescId,
    all_tail: DescId,
    free_head: DescId,
    /// Released chunks and the generation published when they were released
    quarantine: Vec<(DescId, u64)>,
    top: u32,
    capacity: u32,
}

impl ChunkAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Vec::new(),
            vacant: Vec::new(),
            all_head: NIL,
            all_tail: NIL,
            free_head: NIL,
            quarantine: Vec::new(),
            top: 0,
            capacity: capacity as u32,
        }
    }

    pub fn get(&self, id: DescId) -> &ChunkDescriptor {
        &self.arena[id as usize]
    }

    pub fn get_mut(&mut self, id: DescId) -> &mut ChunkDescriptor {
        &mut self.arena[id as usize]
    }

    pub(crate) fn arena(&self) -> &[ChunkDescriptor] {
        &self.arena
    }

    pub(crate) fn arena_mut(&mut self) -> &mut [ChunkDescriptor] {
        &mut self.arena
    }

    /// Bump pointer: first word never handed out.
    pub fn top(&self) -> u32 {
        self.top
    }

    /// Descriptors in `state`.
    pub fn iter_state(&self, state: DescState) -> impl Iterator<Item = &ChunkDescriptor> {
        self.arena.iter().filter(move |d| d.state == state)
    }

    /// Reserve `size` words: best fit from the free list, else bump.
    ///
    /// On failure nothing is modified.
    pub fn alloc(&mut self, size: u32) -> Result<DescId> {
        debug_assert!(size > 0);
        match self.best_fit(size) {
            Some(id) => {
                self.free_unlink(id);
                let excess = self.get(id).max_size - size;
                if excess > 0 {
                    self.split(id, size);
                }
                let d = self.get_mut(id);
                d.state = DescState::Used;
                d.cur_size = size;
                d.refcount = 0;
                Ok(id)
            }
            None => {
                let available = self.capacity - self.top;
                if size > available {
                    return Err(Error::ResourceExhausted {
                        requested: size as usize,
                        available: available as usize,
                    });
                }
                let id = self.new_desc();
                let base = self.top;
                self.top += size;
                let tail = self.all_tail;
                let d = self.get_mut(id);
                d.state = DescState::Used;
                d.base = base;
                d.cur_size = size;
                d.max_size = size;
                d.all_prev = tail;
                d.all_next = NIL;
                if tail == NIL {
                    self.all_head = id;
                } else {
                    self.get_mut(tail).all_next = id;
                }
                self.all_tail = id;
                Ok(id)
            }
        }
    }

    /// Release a chunk nobody references any more while `generation` is
    /// the published one. Its space stays untouched until a
    /// [`recycle`](Self::recycle) past that generation.
    pub fn release(&mut self, id: DescId, generation: u64) {
        let d = self.get_mut(id);
        debug_assert_eq!(d.state, DescState::Used);
        debug_assert_eq!(d.refcount, 0);
        d.state = DescState::Quarantined;
        d.cur_size = 0;
        d.slots.clear();
        self.quarantine.push((id, generation));
    }

    /// Whether a chunk was released while `generation` was published.
    pub fn released_in(&self, generation: u64) -> bool {
        self.quarantine.iter().any(|&(_, g)| g == generation)
    }

    /// Move chunks released before generation `before` to the free list,
    /// merging free neighbors.
    pub fn recycle(&mut self, before: u64) -> usize {
        let (ready, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.quarantine)
            .into_iter()
            .partition(|&(_, g)| g < before);
        self.quarantine = held;
        let n = ready.len();
        for (id, _) in ready {
            self.get_mut(id).state = DescState::Free;
            self.free_push(id);
            let merged = self.merge_next(id);
            let prev = self.get(merged).all_prev;
            if prev != NIL && self.get(prev).state == DescState::Free {
                self.merge_next(prev);
            }
        }
        n
    }

    /// Squeeze out every hole. Live chunks keep their address order and
    /// shrink to their current size; the returned moves must be applied to
    /// a fresh range table.
    pub fn compact(&mut self) -> Vec<Relocation> {
        let mut moves = Vec::new();
        let mut cursor = 0u32;
        let mut id = self.all_head;
        let mut prev_live = NIL;
        self.all_head = NIL;

        while id != NIL {
            let next = self.get(id).all_next;
            if self.get(id).state == DescState::Used {
                let d = self.get_mut(id);
                moves.push(Relocation {
                    id,
                    from: d.base,
                    to: cursor,
                    size: d.cur_size,
                });
                d.base = cursor;
                d.max_size = d.cur_size;
                d.all_prev = prev_live;
                d.all_next = NIL;
                cursor += d.cur_size;
                if prev_live == NIL {
                    self.all_head = id;
                } else {
                    self.get_mut(prev_live).all_next = id;
                }
                prev_live = id;
            } else {
                self.vacate(id);
            }
            id = next;
        }

        self.all_tail = prev_live;
        self.free_head = NIL;
        self.quarantine.clear();
        self.top = cursor;
        moves
    }

    fn best_fit(&self, size: u32) -> Option<DescId> {
        let mut best: Option<DescId> = None;
        let mut id = self.free_head;
        while id != NIL {
            let d = self.get(id);
            if d.max_size == size {
                return Some(id);
            }
            if d.max_size > size && best.map_or(true, |b| d.max_size < self.get(b).max_size) {
                best = Some(id);
            }
            id = d.free_next;
        }
        best
    }

    /// Cut `id` down to `size` words; the tail becomes a free descriptor.
    fn split(&mut self, id: DescId, size: u32) {
        let tail = self.new_desc();
        let (base, max_size, next) = {
            let d = self.get(id);
            (d.base, d.max_size, d.all_next)
        };
        {
            let t = self.get_mut(tail);
            t.state = DescState::Free;
            t.base = base + size;
            t.max_size = max_size - size;
            t.all_prev = id;
            t.all_next = next;
        }
        if next == NIL {
            self.all_tail = tail;
        } else {
            self.get_mut(next).all_prev = tail;
        }
        let d = self.get_mut(id);
        d.all_next = tail;
        d.max_size = size;
        self.free_push(tail);
    }

    /// Absorb the physically following descriptor if it is free.
    fn merge_next(&mut self, id: DescId) -> DescId {
        let next = self.get(id).all_next;
        if next == NIL || self.get(next).state != DescState::Free {
            return id;
        }
        debug_assert_eq!(self.get(id).base + self.get(id).max_size, self.get(next).base);
        let (size, after) = {
            let n = self.get(next);
            (n.max_size, n.all_next)
        };
        self.free_unlink(next);
        let d = self.get_mut(id);
        d.max_size += size;
        d.all_next = after;
        if after == NIL {
            self.all_tail = id;
        } else {
            self.get_mut(after).all_prev = id;
        }
        self.vacate(next);
        id
    }

    fn new_desc(&mut self) -> DescId {
        match self.vacant.pop() {
            Some(id) => id,
            None => {
                self.arena.push(ChunkDescriptor::vacant());
                (self.arena.len() - 1) as DescId
            }
        }
    }

    fn vacate(&mut self, id: DescId) {
        self.arena[id as usize] = ChunkDescriptor::vacant();
        self.vacant.push(id);
    }

    fn free_push(&mut self, id: DescId) {
        let head = self.free_head;
        {
            let d = self.get_mut(id);
            d.free_prev = NIL;
            d.free_next = head;
        }
        if head != NIL {
            self.get_mut(head).free_prev = id;
        }
        self.free_head = id;
    }

    fn free_unlink(&mut self, id: DescId) {
        let (prev, next) = {
            let d = self.get(id);
            (d.free_prev, d.free_next)
        };
        if prev == NIL {
            self.free_head = next;
        } else {
            self.get_mut(prev).free_next = next;
        }
        if next != NIL {
            self.get_mut(next).free_prev = prev;
        }
        let d = self.get_mut(id);
        d.free_prev = NIL;
        d.free_next = NIL;
    }
}
