//! Content index for sharing identical chunks between slots.

use std::hash::{BuildHasher, Hash, Hasher};

use super::alloc::{ChunkDescriptor, DescId, NIL};

/// Number of hash buckets (power of two).
const BUCKET_BITS: u32 = 16;

/// Fixed seeds: a chunk hashes the same in every process.
const SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// Hash of a chunk's format, breakpoint count and encoded words.
pub fn content_hash(long: bool, count: u32, words: &[u32]) -> u64 {
    let state = ahash::RandomState::with_seeds(SEEDS.0, SEEDS.1, SEEDS.2, SEEDS.3);
    let mut hasher = state.build_hasher();
    long.hash(&mut hasher);
    count.hash(&mut hasher);
    words.hash(&mut hasher);
    hasher.finish()
}

/// Hash buckets chaining descriptors through `bucket_next`.
pub struct DedupIndex {
    heads: Vec<DescId>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self {
            heads: vec![NIL; 1 << BUCKET_BITS],
        }
    }

    fn bucket(hash: u64) -> usize {
        (hash & ((1 << BUCKET_BITS) - 1)) as usize
    }

    /// First descriptor with `hash` for which `same_content` holds.
    pub fn find(
        &self,
        arena: &[ChunkDescriptor],
        hash: u64,
        mut same_content: impl FnMut(&ChunkDescriptor) -> bool,
    ) -> Option<DescId> {
        let mut id = self.heads[Self::bucket(hash)];
        while id != NIL {
            let d = &arena[id as usize];
            if d.hash == hash && same_content(d) {
                return Some(id);
            }
            id = d.bucket_next;
        }
        None
    }

    pub fn insert(&mut self, arena: &mut [ChunkDescriptor], id: DescId) {
        let b = Self::bucket(arena[id as usize].hash);
        arena[id as usize].bucket_next = self.heads[b];
        self.heads[b] = id;
    }

    pub fn remove(&mut self, arena: &mut [ChunkDescriptor], id: DescId) {
        let b = Self::bucket(arena[id as usize].hash);
        let next = arena[id as usize].bucket_next;
        arena[id as usize].bucket_next = NIL;

        if self.heads[b] == id {
            self.heads[b] = next;
            return;
        }
        let mut cur = self.heads[b];
        while cur != NIL {
            let after = arena[cur as usize].bucket_next;
            if after == id {
                arena[cur as usize].bucket_next = next;
                return;
            }
            cur = after;
        }
        debug_assert!(false, "descriptor {} missing from its bucket", id);
    }

    /// Descriptors currently indexed.
    pub fn len(&self, arena: &[ChunkDescriptor]) -> usize {
        self.heads
            .iter()
            .map(|&head| {
                let mut n = 0;
                let mut id = head;
                while id != NIL {
                    n += 1;
                    id = arena[id as usize].bucket_next;
                }
                n
            })
            .sum()
    }
}

impl Default for DedupIndex {
    fn default() -> Self {
        Self::new()
    }
}
