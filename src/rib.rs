//! Authoritative route store interface and a reference implementation.

use ahash::AHashMap;
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::ops::ControlFlow;

use crate::{Error, NextHop, Result};

/// A stored prefix and its next-hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteMatch {
    /// Network address with host bits cleared
    pub prefix: u32,
    /// Prefix length, 0..=32
    pub mask_len: u8,
    pub nexthop: NextHop,
}

impl RouteMatch {
    pub fn new(prefix: u32, mask_len: u8, nexthop: NextHop) -> Self {
        Self {
            prefix: prefix & prefix_mask(mask_len),
            mask_len,
            nexthop,
        }
    }

    /// Last address covered by the prefix.
    pub fn last(&self) -> u32 {
        self.prefix | !prefix_mask(self.mask_len)
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr & prefix_mask(self.mask_len) == self.prefix
    }
}

/// Netmask for a prefix length.
pub const fn prefix_mask(mask_len: u8) -> u32 {
    if mask_len == 0 {
        0
    } else {
        u32::MAX << (32 - mask_len as u32)
    }
}

/// Queries the lookup structure needs from the authoritative route store.
pub trait RouteSource {
    /// Longest-prefix match for a single address.
    fn lpm_lookup(&self, addr: u32) -> Option<RouteMatch>;

    /// Visit every stored prefix intersecting `start/mask_len`, both the
    /// prefixes covering the range and those inside it, in ascending
    /// `(prefix, mask_len)` order.
    fn range_walk(
        &self,
        start: u32,
        mask_len: u8,
        visit: &mut dyn FnMut(RouteMatch) -> ControlFlow<()>,
    );
}

/// Reference route store: an ordered map of `(prefix, mask_len)` to next-hop.
///
/// Tracks how many routes use each next-hop so removals can report when a
/// next-hop is retired.
#[derive(Default)]
pub struct Rib {
    routes: RwLock<BTreeMap<(u32, u8), NextHop>>,
    nexthop_refs: RwLock<AHashMap<NextHop, usize>>,
}

impl Rib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse routes from a reader, one `a.b.c.d/len nexthop` per line.
    ///
    /// `#` starts a comment; blank lines are skipped.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let rib = Self::new();
        for (lineno, line) in BufReader::new(reader).lines().enumerate() {
            let line = line?;
            let line = match line.find('#') {
                Some(idx) => &line[..idx],
                None => &line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (net, nh) = match (fields.next(), fields.next(), fields.next()) {
                (Some(net), Some(nh), None) => (net, nh),
                _ => {
                    return Err(Error::InvalidPrefix(format!(
                        "line {}: expected `prefix/len nexthop`",
                        lineno + 1
                    )))
                }
            };
            let net: Ipv4Net = net
                .parse()
                .map_err(|_| Error::InvalidPrefix(format!("line {}: {}", lineno + 1, net)))?;
            let nh: NextHop = nh.parse().map_err(|_| {
                Error::InvalidPrefix(format!("line {}: bad next-hop {}", lineno + 1, nh))
            })?;
            rib.insert(net, nh);
        }
        Ok(rib)
    }

    /// Insert or replace a route. Returns the next-hop it replaced.
    pub fn insert(&self, net: Ipv4Net, nexthop: NextHop) -> Option<NextHop> {
        let net = net.trunc();
        let key = (u32::from(net.network()), net.prefix_len());
        let old = self.routes.write().insert(key, nexthop);

        let mut refs = self.nexthop_refs.write();
        if let Some(old) = old {
            release_ref(&mut refs, old);
        }
        *refs.entry(nexthop).or_insert(0) += 1;
        old
    }

    /// Remove a route. Returns its next-hop and the number of routes still
    /// using that next-hop.
    pub fn remove(&self, net: Ipv4Net) -> Option<(NextHop, usize)> {
        let net = net.trunc();
        let key = (u32::from(net.network()), net.prefix_len());
        let nexthop = self.routes.write().remove(&key)?;
        let remaining = release_ref(&mut self.nexthop_refs.write(), nexthop);
        Some((nexthop, remaining))
    }

    /// Number of routes currently pointing at `nexthop`.
    pub fn nexthop_refs(&self, nexthop: NextHop) -> usize {
        self.nexthop_refs.read().get(&nexthop).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all routes in `(prefix, mask_len)` order.
    pub fn routes(&self) -> Vec<RouteMatch> {
        self.routes
            .read()
            .iter()
            .map(|(&(prefix, mask_len), &nexthop)| RouteMatch {
                prefix,
                mask_len,
                nexthop,
            })
            .collect()
    }
}

fn release_ref(refs: &mut AHashMap<NextHop, usize>, nexthop: NextHop) -> usize {
    match refs.get_mut(&nexthop) {
        Some(count) if *count > 1 => {
            *count -= 1;
            *count
        }
        _ => {
            refs.remove(&nexthop);
            0
        }
    }
}

impl RouteSource for Rib {
    fn lpm_lookup(&self, addr: u32) -> Option<RouteMatch> {
        let routes = self.routes.read();
        (0..=32u8).rev().find_map(|len| {
            let prefix = addr & prefix_mask(len);
            routes
                .get(&(prefix, len))
                .map(|&nexthop| RouteMatch {
                    prefix,
                    mask_len: len,
                    nexthop,
                })
        })
    }

    fn range_walk(
        &self,
        start: u32,
        mask_len: u8,
        visit: &mut dyn FnMut(RouteMatch) -> ControlFlow<()>,
    ) {
        let routes = self.routes.read();
        let first = start & prefix_mask(mask_len);
        let last = first | !prefix_mask(mask_len);

        // Covering prefixes, shortest first; their starts never decrease.
        for len in 0..mask_len {
            let prefix = first & prefix_mask(len);
            if let Some(&nexthop) = routes.get(&(prefix, len)) {
                let route = RouteMatch {
                    prefix,
                    mask_len: len,
                    nexthop,
                };
                if visit(route).is_break() {
                    return;
                }
            }
        }

        for (&(prefix, len), &nexthop) in routes.range((first, mask_len)..=(last, 32)) {
            if len < mask_len {
                continue;
            }
            let route = RouteMatch {
                prefix,
                mask_len: len,
                nexthop,
            };
            if visit(route).is_break() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn walk(rib: &Rib, start: u32, len: u8) -> Vec<(u32, u8)> {
        let mut seen = Vec::new();
        rib.range_walk(start, len, &mut |r| {
            seen.push((r.prefix, r.mask_len));
            ControlFlow::Continue(())
        });
        seen
    }

    #[test]
    fn test_lpm_lookup() {
        let rib = Rib::new();
        rib.insert(net("10.0.0.0/8"), NextHop::new(2));
        rib.insert(net("10.1.0.0/16"), NextHop::new(3));

        let m = rib.lpm_lookup(0x0A01_0505).unwrap();
        assert_eq!(m.mask_len, 16);
        assert_eq!(m.nexthop, NextHop::new(3));
        assert_eq!(rib.lpm_lookup(0x0A02_0505).unwrap().mask_len, 8);
        assert!(rib.lpm_lookup(0x0B00_0001).is_none());
    }

    #[test]
    fn test_insert_truncates_host_bits() {
        let rib = Rib::new();
        rib.insert(net("10.1.2.3/16"), NextHop::new(3));
        assert_eq!(rib.routes()[0].prefix, 0x0A01_0000);
    }

    #[test]
    fn test_range_walk_order_and_coverage() {
        let rib = Rib::new();
        rib.insert(net("0.0.0.0/0"), NextHop::new(1));
        rib.insert(net("10.0.0.0/8"), NextHop::new(2));
        rib.insert(net("10.1.0.0/16"), NextHop::new(3));
        rib.insert(net("10.1.0.0/24"), NextHop::new(4));
        rib.insert(net("10.1.200.0/22"), NextHop::new(5));
        rib.insert(net("10.2.0.0/24"), NextHop::new(6));

        let seen = walk(&rib, 0x0A01_0000, 16);
        assert_eq!(
            seen,
            vec![
                (0, 0),
                (0x0A00_0000, 8),
                (0x0A01_0000, 16),
                (0x0A01_0000, 24),
                (0x0A01_C800, 22),
            ]
        );
    }

    #[test]
    fn test_range_walk_stops_on_break() {
        let rib = Rib::new();
        rib.insert(net("10.0.0.0/8"), NextHop::new(2));
        rib.insert(net("10.1.0.0/24"), NextHop::new(4));
        let mut count = 0;
        rib.range_walk(0x0A01_0000, 16, &mut |_| {
            count += 1;
            ControlFlow::Break(())
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn test_nexthop_refcounts() {
        let rib = Rib::new();
        rib.insert(net("10.0.0.0/8"), NextHop::new(2));
        rib.insert(net("11.0.0.0/8"), NextHop::new(2));
        assert_eq!(rib.nexthop_refs(NextHop::new(2)), 2);

        assert_eq!(rib.remove(net("10.0.0.0/8")), Some((NextHop::new(2), 1)));
        assert_eq!(rib.remove(net("11.0.0.0/8")), Some((NextHop::new(2), 0)));
        assert_eq!(rib.remove(net("11.0.0.0/8")), None);
        assert!(rib.is_empty());
    }

    #[test]
    fn test_replace_moves_refcount() {
        let rib = Rib::new();
        rib.insert(net("10.0.0.0/8"), NextHop::new(2));
        assert_eq!(rib.insert(net("10.0.0.0/8"), NextHop::new(3)), Some(NextHop::new(2)));
        assert_eq!(rib.nexthop_refs(NextHop::new(2)), 0);
        assert_eq!(rib.nexthop_refs(NextHop::new(3)), 1);
    }

    #[test]
    fn test_from_reader() {
        let text = "# routes\n0.0.0.0/0 1\n10.0.0.0/8   nh2  # private\n\n10.1.0.0/16 3\n";
        let rib = Rib::from_reader(text.as_bytes()).unwrap();
        assert_eq!(rib.len(), 3);
        assert_eq!(rib.lpm_lookup(0x0A01_0101).unwrap().nexthop, NextHop::new(3));
    }

    #[test]
    fn test_from_reader_rejects_garbage() {
        assert!(Rib::from_reader("10.0.0.0/33 1\n".as_bytes()).is_err());
        assert!(Rib::from_reader("10.0.0.0/8\n".as_bytes()).is_err());
        assert!(Rib::from_reader("10.0.0.0/8 x\n".as_bytes()).is_err());
    }
}
