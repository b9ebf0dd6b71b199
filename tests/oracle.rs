//! Property tests: the table must agree with a naive longest-prefix match.

use dxr_fib::{Config, Dxr, NextHop, Rib};
use ipnet::Ipv4Net;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::Ipv4Addr;

/// Linear scan over every route, keeping the longest match.
fn naive_lookup(routes: &[(u32, u8, NextHop)], addr: u32) -> NextHop {
    let mut best: Option<(u8, NextHop)> = None;
    for &(prefix, len, nh) in routes {
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        if addr & mask == prefix && best.map_or(true, |(l, _)| len > l) {
            best = Some((len, nh));
        }
    }
    best.map_or(NextHop::NONE, |(_, nh)| nh)
}

fn net(prefix: u32, len: u8) -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::from(prefix), len).unwrap().trunc()
}

fn probes(routes: &[(u32, u8, NextHop)], extra: &[u32]) -> Vec<u32> {
    let mut out = extra.to_vec();
    for &(prefix, len, _) in routes {
        let last = prefix | !(if len == 0 { 0 } else { u32::MAX << (32 - len) });
        out.extend([prefix.wrapping_sub(1), prefix, last, last.wrapping_add(1)]);
    }
    out
}

fn routes_of(rib: &Rib) -> Vec<(u32, u8, NextHop)> {
    rib.routes()
        .iter()
        .map(|r| (r.prefix, r.mask_len, r.nexthop))
        .collect()
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u32, u8, u16),
    Remove(usize),
    Compact,
}

/// Prefixes clustered in 10.0.0.0/14 so slots see dense overlap.
fn prefix_strategy(min_len: u8) -> impl Strategy<Value = (u32, u8)> {
    (0x0A00_0000u32..0x0A04_0000, min_len..=32)
}

fn ops_strategy(min_len: u8, max_ops: usize, compact: u32) -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        6 => (prefix_strategy(min_len), 1u16..=300).prop_map(|((p, l), nh)| Op::Insert(p, l, nh)),
        2 => any::<usize>().prop_map(Op::Remove),
        compact => Just(Op::Compact),
    ];
    prop::collection::vec(op, 1..=max_ops)
}

/// Apply one operation to both the route store and the table.
fn apply(dxr: &mut Dxr, rib: &Rib, op: Op) {
    match op {
        Op::Insert(prefix, len, nh) => {
            let net = net(prefix, len);
            rib.insert(net, NextHop::new(nh));
            dxr.notify_route_added(rib, u32::from(net.network()), len, NextHop::new(nh))
                .unwrap();
        }
        Op::Remove(index) => {
            let routes = rib.routes();
            if routes.is_empty() {
                return;
            }
            let r = routes[index % routes.len()];
            let (_, remaining) = rib.remove(net(r.prefix, r.mask_len)).unwrap();
            dxr.notify_route_removed(rib, r.prefix, r.mask_len, remaining)
                .unwrap();
        }
        Op::Compact => {
            dxr.compact();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_sync_updates_match_oracle(
        ops in ops_strategy(8, 80, 1),
        extra in prop::collection::vec(0x0A00_0000u32..0x0A04_0000, 64),
    ) {
        let rib = Rib::new();
        let mut dxr = Dxr::new(Config::compact()).unwrap();
        for op in ops {
            apply(&mut dxr, &rib, op);
        }

        let routes = routes_of(&rib);
        for addr in probes(&routes, &extra) {
            prop_assert_eq!(dxr.lookup(addr), naive_lookup(&routes, addr), "addr {}", Ipv4Addr::from(addr));
        }
    }

    #[test]
    fn prop_async_batch_matches_oracle(
        ops in ops_strategy(8, 80, 1),
        extra in prop::collection::vec(0x0A00_0000u32..0x0A04_0000, 64),
    ) {
        let rib = Rib::new();
        let config = Config::compact().with_async(std::time::Duration::from_secs(3600));
        let mut dxr = Dxr::new(config).unwrap();
        for op in ops {
            apply(&mut dxr, &rib, op);
        }
        dxr.apply_pending(&rib).unwrap();
        prop_assert_eq!(dxr.pending_slots(), 0);

        let routes = routes_of(&rib);
        for addr in probes(&routes, &extra) {
            prop_assert_eq!(dxr.lookup(addr), naive_lookup(&routes, addr), "addr {}", Ipv4Addr::from(addr));
        }
    }
}

proptest! {
    // Wide direct tables are costly to allocate and compact.
    #![proptest_config(ProptestConfig {
        cases: 16,
        .. ProptestConfig::default()
    })]

    /// Every direct-table width, a range table small enough to run out, and
    /// compactions at arbitrary points.
    #[test]
    fn prop_direct_bits_and_compaction_match_oracle(
        bits in prop::sample::select(vec![16u8, 20, 24]),
        // Twice the most live chunk words 40 operations can leave behind.
        capacity in prop::sample::select(vec![384usize, 1 << 14]),
        async_mode in any::<bool>(),
        ops in ops_strategy(12, 40, 1),
        extra in prop::collection::vec(0x0A00_0000u32..0x0A04_0000, 64),
    ) {
        let rib = Rib::new();
        let mut config = Config::default()
            .with_direct_bits(bits)
            .with_range_capacity(capacity);
        if async_mode {
            config = config.with_async(std::time::Duration::from_secs(3600));
        }
        let mut dxr = Dxr::new(config).unwrap();
        for op in ops {
            apply(&mut dxr, &rib, op);
        }
        dxr.apply_pending(&rib).unwrap();

        let routes = routes_of(&rib);
        for addr in probes(&routes, &extra) {
            prop_assert_eq!(
                dxr.lookup(addr),
                naive_lookup(&routes, addr),
                "{} bits, addr {}",
                bits,
                Ipv4Addr::from(addr)
            );
        }

        dxr.compact();
        for addr in probes(&routes, &extra) {
            prop_assert_eq!(dxr.lookup(addr), naive_lookup(&routes, addr), "after compaction, addr {}", Ipv4Addr::from(addr));
        }
    }
}

#[test]
fn test_small_range_table_churn_compacts() {
    let mut rng = StdRng::seed_from_u64(0xC0DE);
    let rib = Rib::new();
    let config = Config::default()
        .with_direct_bits(20)
        .with_range_capacity(384);
    let mut dxr = Dxr::new(config).unwrap();

    for step in 0..3_000 {
        let live = rib.routes();
        if step % 500 == 499 {
            apply(&mut dxr, &rib, Op::Compact);
        } else if step % 3 == 2 && !live.is_empty() {
            apply(&mut dxr, &rib, Op::Remove(rng.gen()));
        } else if live.len() < 40 {
            let prefix = 0x0A00_0000 | rng.gen_range(0..0x4_0000u32);
            apply(&mut dxr, &rib, Op::Insert(prefix, rng.gen_range(21..=32), rng.gen_range(1..=300)));
        }
    }

    let routes = routes_of(&rib);
    let extra: Vec<u32> = (0..2_000).map(|_| 0x0A00_0000 | rng.gen_range(0..0x4_0000u32)).collect();
    for addr in probes(&routes, &extra) {
        assert_eq!(dxr.lookup(addr), naive_lookup(&routes, addr), "addr {}", Ipv4Addr::from(addr));
    }
    let stats = dxr.stats();
    assert!(stats.compactions >= 6);
    assert!(stats.range_top <= 384);
}

#[test]
fn test_random_table_full_rebuild() {
    let mut rng = StdRng::seed_from_u64(0xD1CE);
    let rib = Rib::new();
    rib.insert("0.0.0.0/0".parse().unwrap(), NextHop::new(1));
    for _ in 0..2_000 {
        let len = rng.gen_range(8..=32u8);
        let prefix = rng.gen::<u32>();
        let nh = NextHop::new(rng.gen_range(1..=400));
        rib.insert(net(prefix, len), nh);
    }

    let routes = routes_of(&rib);
    let extra: Vec<u32> = (0..1_000).map(|_| rng.gen()).collect();
    for bits in [16u8, 20] {
        let mut dxr = Dxr::new(Config::default().with_direct_bits(bits)).unwrap();
        dxr.rebuild_all(&rib).unwrap();

        for addr in probes(&routes, &extra) {
            assert_eq!(
                dxr.lookup(addr),
                naive_lookup(&routes, addr),
                "{} bits, addr {}",
                bits,
                Ipv4Addr::from(addr)
            );
        }

        let stats = dxr.stats();
        assert_eq!(stats.resolved_slots + stats.short_slots + stats.long_slots, stats.slots);
        assert!(stats.long_slots > 0);
    }
}
