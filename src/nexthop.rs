//! Next-hop identifiers.

use std::fmt;

/// Opaque next-hop identifier.
///
/// The mapping from an id to an egress target is owned by the caller.
/// Id 0 is reserved and means "no route".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NextHop(u16);

impl NextHop {
    /// Reserved id returned by lookups that match no route.
    pub const NONE: NextHop = NextHop(0);

    /// Largest id that fits a short-format breakpoint.
    pub const SHORT_MAX: u16 = u8::MAX as u16;

    /// Create a next-hop from its raw id.
    pub const fn new(id: u16) -> Self {
        NextHop(id)
    }

    /// Raw id.
    pub const fn id(self) -> u16 {
        self.0
    }

    /// Whether this is the reserved "no route" id.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Whether the id fits the 8-bit short breakpoint format.
    pub const fn fits_short(self) -> bool {
        self.0 <= Self::SHORT_MAX
    }
}

impl From<u16> for NextHop {
    fn from(id: u16) -> Self {
        NextHop(id)
    }
}

impl From<NextHop> for u16 {
    fn from(nh: NextHop) -> Self {
        nh.0
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "nh{}", self.0)
        }
    }
}

impl std::str::FromStr for NextHop {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s.strip_prefix("nh").unwrap_or(s);
        digits.parse::<u16>().map(NextHop)
    }
}
