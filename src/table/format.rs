//! Packed direct and range entry layouts.
//!
//! All layouts are plain `u32` words with explicit shift/mask accessors so the
//! bit positions never depend on the compiler.
//!
//! ```text
//! DirectEntry (32 bits)
//!  31                    14 13 12           0
//! +------------------------+--+--------------+
//! |          base          |L |  fragments   |
//! +------------------------+--+--------------+
//!   fragments == 0x1FFF : resolved, base holds the next-hop id
//!   fragments == 0x1FFE : extra-large chunk, count-1 stored in word `base`
//!   otherwise           : chunk of fragments+1 breakpoints at `base`
//!   L                   : long breakpoint format
//!
//! Long breakpoint (one per word)      Short breakpoint (two per word)
//!  31          16 15           0       15       8 7        0
//! +--------------+--------------+     +----------+----------+
//! |    start     |   next-hop   |     | start>>8 | next-hop |
//! +--------------+--------------+     +----------+----------+
//! ```

use crate::NextHop;

/// Smallest supported direct-table width.
///
/// Slots must stay within 16 address bits for long breakpoints.
pub const MIN_DIRECT_BITS: u8 = 16;

/// Largest supported direct-table width.
pub const MAX_DIRECT_BITS: u8 = 24;

/// Width of the fragment count field.
pub const FRAGMENTS_BITS: u32 = 13;

const FRAGMENTS_MASK: u32 = (1 << FRAGMENTS_BITS) - 1;

const LONG_FLAG: u32 = 1 << FRAGMENTS_BITS;

const BASE_SHIFT: u32 = FRAGMENTS_BITS + 1;

/// Width of the base field.
pub const BASE_BITS: u32 = 32 - BASE_SHIFT;

/// Largest range table offset a direct entry can address.
pub const MAX_BASE: u32 = (1 << BASE_BITS) - 1;

/// Fragment marker for a resolved slot.
pub const FRAGS_MARK_HIT: u32 = FRAGMENTS_MASK;

/// Fragment marker for a chunk whose count lives in a header word.
pub const FRAGS_MARK_XL: u32 = FRAGMENTS_MASK - 1;

/// Breakpoint granularity of the short format, in addresses.
pub const SHORT_GRANULE: u32 = 1 << 8;

/// One direct-table word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectEntry(u32);

impl DirectEntry {
    /// Entry that answers every address of the slot with `nexthop`.
    pub const fn resolved(nexthop: NextHop) -> Self {
        DirectEntry(((nexthop.id() as u32) << BASE_SHIFT) | FRAGS_MARK_HIT)
    }

    /// Entry pointing at a chunk of `count` breakpoints stored at `base`.
    ///
    /// Counts too large for the fragment field get the extra-large marker;
    /// the chunk then starts with a header word holding `count - 1`.
    pub fn chunk(base: u32, count: usize, long: bool) -> Self {
        debug_assert!(base <= MAX_BASE);
        debug_assert!(count >= 2);
        let frags = match count - 1 {
            n if n < FRAGS_MARK_XL as usize => n as u32,
            _ => FRAGS_MARK_XL,
        };
        let flag = if long { LONG_FLAG } else { 0 };
        DirectEntry((base << BASE_SHIFT) | flag | frags)
    }

    pub const fn from_raw(raw: u32) -> Self {
        DirectEntry(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_resolved(self) -> bool {
        self.0 & FRAGMENTS_MASK == FRAGS_MARK_HIT
    }

    /// Whether the chunk count is stored in a header word.
    pub const fn is_xl(self) -> bool {
        self.0 & FRAGMENTS_MASK == FRAGS_MARK_XL
    }

    pub const fn is_long(self) -> bool {
        self.0 & LONG_FLAG != 0
    }

    /// Raw fragment field (breakpoint count minus one, or a marker).
    pub const fn fragments(self) -> u32 {
        self.0 & FRAGMENTS_MASK
    }

    pub const fn base(self) -> u32 {
        self.0 >> BASE_SHIFT
    }

    /// Next-hop of a resolved entry.
    pub const fn nexthop(self) -> NextHop {
        NextHop::new((self.0 >> BASE_SHIFT) as u16)
    }

    /// Same entry, relocated to `base`.
    pub fn with_base(self, base: u32) -> Self {
        debug_assert!(!self.is_resolved());
        debug_assert!(base <= MAX_BASE);
        DirectEntry((self.0 & ((1 << BASE_SHIFT) - 1)) | (base << BASE_SHIFT))
    }
}

/// Whether a chunk of `count` breakpoints needs a header word.
pub const fn needs_header(count: usize) -> bool {
    count > FRAGS_MARK_XL as usize
}

/// Words occupied by a chunk of `count` breakpoints in the given format.
pub const fn chunk_words(count: usize, long: bool) -> usize {
    let body = if long { count } else { count.div_ceil(2) };
    if needs_header(count) {
        body + 1
    } else {
        body
    }
}

/// Pack a long breakpoint.
pub const fn long_entry(start: u16, nexthop: NextHop) -> u32 {
    ((start as u32) << 16) | nexthop.id() as u32
}

pub const fn long_start(word: u32) -> u32 {
    word >> 16
}

pub const fn long_nexthop(word: u32) -> NextHop {
    NextHop::new(word as u16)
}

/// Pack a short breakpoint (start in 256-address units).
pub const fn short_entry(start: u8, nexthop: u8) -> u16 {
    ((start as u16) << 8) | nexthop as u16
}

/// Extract short breakpoint `index` of a chunk from its containing word.
pub const fn short_half(word: u32, index: usize) -> u16 {
    (word >> ((index & 1) * 16)) as u16
}

pub const fn short_start(entry: u16) -> u32 {
    (entry >> 8) as u32
}

pub const fn short_nexthop(entry: u16) -> NextHop {
    NextHop::new(entry & 0xFF)
}

/// Combine two short breakpoints into one range table word.
pub const fn short_pair(even: u16, odd: u16) -> u32 {
    (even as u32) | ((odd as u32) << 16)
}
