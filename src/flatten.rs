//! Interval flattening: overlapping prefixes to ascending breakpoints.
//!
//! The flattener keeps a stack of the prefixes active at the current
//! address, least specific at the bottom. Prefixes nest, so the stack never
//! holds two entries of the same length. Whenever the top of the stack
//! changes, the new effective next-hop is emitted at the address where it
//! takes effect; consecutive identical next-hops collapse into one breakpoint.

use std::fmt;
use std::ops::ControlFlow;

use crate::rib::{RouteMatch, RouteSource};
use crate::{Error, NextHop, Result};

/// Where the effective LPM result changes inside a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Breakpoint {
    /// Offset from the slot's first address
    pub offset: u32,
    pub nexthop: NextHop,
}

impl Breakpoint {
    pub fn new(offset: u32, nexthop: NextHop) -> Self {
        Self { offset, nexthop }
    }
}

#[derive(Debug, Clone, Copy)]
struct StackEntry {
    start: u32,
    end: u32,
    /// `None` marks the "no route" entry below every real prefix.
    mask_len: Option<u8>,
    nexthop: NextHop,
}

impl StackEntry {
    const NO_ROUTE: StackEntry = StackEntry {
        start: 0,
        end: u32::MAX,
        mask_len: None,
        nexthop: NextHop::NONE,
    };
}

impl fmt::Display for StackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mask_len {
            Some(len) => write!(
                f,
                "{}/{} via {}",
                std::net::Ipv4Addr::from(self.start),
                len,
                self.nexthop
            ),
            None => write!(f, "no route"),
        }
    }
}

impl From<RouteMatch> for StackEntry {
    fn from(route: RouteMatch) -> Self {
        Self {
            start: route.prefix,
            end: route.last(),
            mask_len: Some(route.mask_len),
            nexthop: route.nexthop,
        }
    }
}

/// Reusable flattening state; one instance serves every slot rebuild.
#[derive(Debug, Default)]
pub struct Flattener {
    stack: Vec<StackEntry>,
    out: Vec<Breakpoint>,
    first: u32,
    last: u32,
}

impl Flattener {
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(34),
            out: Vec::new(),
            first: 0,
            last: 0,
        }
    }

    /// Compute the breakpoints of the slot `first/mask_len`.
    ///
    /// The result always starts at offset 0 and is strictly increasing.
    pub fn flatten<S: RouteSource + ?Sized>(
        &mut self,
        source: &S,
        first: u32,
        mask_len: u8,
    ) -> Result<&[Breakpoint]> {
        self.first = first;
        self.last = first | !crate::rib::prefix_mask(mask_len);
        self.stack.clear();
        self.out.clear();

        self.stack.push(StackEntry::NO_ROUTE);
        if let Some(seed) = source.lpm_lookup(first) {
            self.stack.push(seed.into());
        }
        self.emit(first, self.top().nexthop);

        let mut failure = None;
        source.range_walk(first, mask_len, &mut |route| match self.push(route) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                failure = Some(e);
                ControlFlow::Break(())
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }

        // Entries reaching past the slot never change the result inside it.
        let last = self.last;
        self.flush_before(last);

        debug_assert_eq!(self.out.first().map(|b| b.offset), Some(0));
        debug_assert!(self.out.windows(2).all(|w| w[0].offset < w[1].offset));
        debug_assert!(self.out.windows(2).all(|w| w[0].nexthop != w[1].nexthop));
        Ok(&self.out)
    }

    fn top(&self) -> &StackEntry {
        // The no-route entry is never popped.
        &self.stack[self.stack.len() - 1]
    }

    fn push(&mut self, route: RouteMatch) -> Result<()> {
        let entry = StackEntry::from(route);
        self.flush_before(entry.start);

        let pos = self
            .stack
            .iter()
            .position(|e| e.mask_len >= entry.mask_len)
            .unwrap_or(self.stack.len());

        if let Some(existing) = self.stack.get(pos) {
            if existing.mask_len == entry.mask_len {
                // The seed comes back from the walk; anything else at the same
                // length is a second route for one prefix or a broken nesting.
                if existing.start == entry.start && existing.nexthop == entry.nexthop {
                    return Ok(());
                }
                return Err(Error::InvariantViolation(format!(
                    "{} collides with {}",
                    entry, existing
                )));
            }
        }

        self.stack.insert(pos, entry);
        if pos == self.stack.len() - 1 {
            self.emit(entry.start.max(self.first), entry.nexthop);
        }
        Ok(())
    }

    /// Pop every entry ending before `addr`, emitting the next-hop that
    /// takes over after each one.
    fn flush_before(&mut self, addr: u32) {
        while self.top().end < addr {
            let ended = self.stack.pop().map(|e| e.end).unwrap_or(u32::MAX);
            let nexthop = self.top().nexthop;
            self.emit(ended + 1, nexthop);
        }
    }

    /// Write cursor: append a breakpoint at `addr` unless the effective
    /// next-hop is unchanged. A second breakpoint at the same address
    /// replaces the first.
    fn emit(&mut self, addr: u32, nexthop: NextHop) {
        let offset = addr - self.first;
        let len = self.out.len();
        if let Some(last) = self.out.last_mut() {
            if last.offset == offset {
                last.nexthop = nexthop;
                if len >= 2 && self.out[len - 2].nexthop == nexthop {
                    self.out.pop();
                }
                return;
            }
            if last.nexthop == nexthop {
                return;
            }
        }
        self.out.push(Breakpoint::new(offset, nexthop));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::Rib;
    use ipnet::Ipv4Net;

    fn rib(routes: &[(&str, u16)]) -> Rib {
        let rib = Rib::new();
        for (net, nh) in routes {
            rib.insert(net.parse::<Ipv4Net>().unwrap(), NextHop::new(*nh));
        }
        rib
    }

    fn bps(list: &[(u32, u16)]) -> Vec<Breakpoint> {
        list.iter()
            .map(|&(o, nh)| Breakpoint::new(o, NextHop::new(nh)))
            .collect()
    }

    fn flatten(rib: &Rib, first: u32) -> Vec<Breakpoint> {
        Flattener::new().flatten(rib, first, 16).unwrap().to_vec()
    }

    #[test]
    fn test_empty_source_is_no_route() {
        let rib = Rib::new();
        assert_eq!(flatten(&rib, 0x0A00_0000), bps(&[(0, 0)]));
    }

    #[test]
    fn test_covering_prefix_only() {
        let rib = rib(&[("0.0.0.0/0", 1), ("10.0.0.0/8", 2)]);
        assert_eq!(flatten(&rib, 0x0A01_0000), bps(&[(0, 2)]));
        assert_eq!(flatten(&rib, 0x0B01_0000), bps(&[(0, 1)]));
    }

    #[test]
    fn test_nested_prefixes() {
        let rib = rib(&[
            ("10.0.0.0/8", 2),
            ("10.1.0.0/24", 4),
            ("10.1.0.128/25", 5),
            ("10.1.8.0/21", 6),
        ]);
        assert_eq!(
            flatten(&rib, 0x0A01_0000),
            bps(&[(0, 4), (0x80, 5), (0x100, 2), (0x800, 6), (0x1000, 2)])
        );
    }

    #[test]
    fn test_adjacent_same_nexthop_merges() {
        let rib = rib(&[
            ("10.0.0.0/8", 2),
            ("10.1.0.0/24", 4),
            ("10.1.1.0/24", 4),
            ("10.1.2.0/24", 2),
        ]);
        assert_eq!(flatten(&rib, 0x0A01_0000), bps(&[(0, 4), (0x200, 2)]));
    }

    #[test]
    fn test_adjacent_different_nexthops_replace_at_boundary() {
        let rib = rib(&[("10.1.0.0/24", 4), ("10.1.1.0/24", 5)]);
        assert_eq!(
            flatten(&rib, 0x0A01_0000),
            bps(&[(0, 4), (0x100, 5), (0x200, 0)])
        );
    }

    #[test]
    fn test_prefix_reaching_slot_end() {
        let rib = rib(&[("10.1.255.0/24", 7)]);
        assert_eq!(flatten(&rib, 0x0A01_0000), bps(&[(0, 0), (0xFF00, 7)]));
    }

    #[test]
    fn test_host_route_at_last_address() {
        let rib = rib(&[("10.0.0.0/8", 2), ("10.1.255.255/32", 9)]);
        assert_eq!(flatten(&rib, 0x0A01_0000), bps(&[(0, 2), (0xFFFF, 9)]));
    }

    #[test]
    fn test_seed_more_specific_than_slot() {
        // The LPM seed is a /24; the /8 arrives later from the walk and must
        // slide in underneath it.
        let rib = rib(&[("10.0.0.0/8", 2), ("10.1.0.0/24", 5)]);
        assert_eq!(flatten(&rib, 0x0A01_0000), bps(&[(0, 5), (0x100, 2)]));
    }

    #[test]
    fn test_route_equal_to_slot() {
        let rib = rib(&[("10.0.0.0/8", 2), ("10.1.0.0/16", 3)]);
        assert_eq!(flatten(&rib, 0x0A01_0000), bps(&[(0, 3)]));
    }

    #[test]
    fn test_state_resets_between_slots() {
        let rib = rib(&[("10.1.0.0/24", 4), ("10.2.0.0/16", 6)]);
        let mut f = Flattener::new();
        assert_eq!(f.flatten(&rib, 0x0A01_0000, 16).unwrap().len(), 2);
        assert_eq!(f.flatten(&rib, 0x0A02_0000, 16).unwrap(), &bps(&[(0, 6)])[..]);
    }

    /// A broken store that reports two next-hops for one prefix.
    struct Conflicting;

    impl RouteSource for Conflicting {
        fn lpm_lookup(&self, _addr: u32) -> Option<RouteMatch> {
            None
        }

        fn range_walk(
            &self,
            _start: u32,
            _mask_len: u8,
            visit: &mut dyn FnMut(RouteMatch) -> ControlFlow<()>,
        ) {
            let _ = visit(RouteMatch::new(0x0A01_0100, 24, NextHop::new(1)));
            let _ = visit(RouteMatch::new(0x0A01_0100, 24, NextHop::new(2)));
        }
    }

    #[test]
    fn test_equal_specificity_collision_is_rejected() {
        let err = Flattener::new()
            .flatten(&Conflicting, 0x0A01_0000, 16)
            .unwrap_err();
        match err {
            Error::InvariantViolation(msg) => {
                assert_eq!(msg, "10.1.1.0/24 via nh2 collides with 10.1.1.0/24 via nh1")
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
