//! dxr-fib - A compressed IPv4 longest-prefix-match forwarding table.
//!
//! This crate turns the routes held by an authoritative route store into a
//! two-level lookup structure that answers "which next-hop serves this
//! address" in a bounded number of memory accesses.
//!
//! # Features
//!
//! - **Direct table**: one 32-bit word per slot of the top `direct_bits`
//!   address bits; slots with a single next-hop resolve right there
//! - **Range table**: sorted breakpoints for the remaining slots, stored in
//!   a compact 16-bit format when alignment allows and 32-bit otherwise
//! - **Chunk sharing**: slots with identical breakpoints share one chunk
//! - **Incremental updates**: route changes mark slots dirty and only those
//!   slots are rebuilt, right away or in timed batches
//! - **Lock-free lookups**: readers never block on the writer
//!
//! # Quick Start
//!
//! ```
//! use dxr_fib::{Config, Dxr, NextHop, Rib};
//!
//! let rib = Rib::new();
//! rib.insert("0.0.0.0/0".parse().unwrap(), NextHop::new(1));
//! rib.insert("10.1.0.0/16".parse().unwrap(), NextHop::new(2));
//!
//! let mut dxr = Dxr::new(Config::compact()).unwrap();
//! dxr.rebuild_all(&rib).unwrap();
//!
//! assert_eq!(dxr.lookup_addr("10.1.2.3".parse().unwrap()), NextHop::new(2));
//! assert_eq!(dxr.lookup_addr("8.8.8.8".parse().unwrap()), NextHop::new(1));
//! ```
//!
//! # Concurrency
//!
//! [`Dxr`] is the single writer. Hand [`DxrReader`] clones to lookup
//! threads; they keep working through rebuilds and compactions.
//!
//! ```
//! use dxr_fib::{Config, Dxr, NextHop, Rib};
//! use std::thread;
//!
//! let rib = Rib::new();
//! let mut dxr = Dxr::new(Config::compact()).unwrap();
//! let reader = dxr.reader();
//!
//! let handle = thread::spawn(move || reader.lookup(0x0A00_0001));
//! rib.insert("10.0.0.0/8".parse().unwrap(), NextHop::new(7));
//! dxr.notify_route_added(&rib, 0x0A00_0000, 8, NextHop::new(7)).unwrap();
//!
//! let seen = handle.join().unwrap();
//! assert!(seen == NextHop::NONE || seen == NextHop::new(7));
//! ```

pub mod chunk;
pub mod config;
pub mod dxr;
pub mod error;
pub mod flatten;
pub mod nexthop;
pub mod rib;
pub mod scheduler;
pub mod stats;
pub mod table;

pub use chunk::CompactionReport;
pub use config::Config;
pub use dxr::{BatchReport, Dxr, DxrReader};
pub use error::{Error, Result};
pub use nexthop::NextHop;
pub use rib::{Rib, RouteMatch, RouteSource};
pub use scheduler::SchedulerState;
pub use stats::Stats;
