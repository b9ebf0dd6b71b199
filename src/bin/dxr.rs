//! dxr-fib: build a lookup table from a route file and inspect it.

use clap::{Parser, Subcommand};
use dxr_fib::{Config, Dxr, NextHop, Rib, RouteSource};
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "dxr-fib")]
#[command(version)]
#[command(about = "Build and inspect compressed IPv4 forwarding tables", long_about = None)]
struct Cli {
    /// Route file: one `a.b.c.d/len nexthop` per line
    #[arg(short, long, global = true)]
    routes: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the number of direct-table bits
    #[arg(short, long, global = true)]
    direct_bits: Option<u8>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print table statistics
    Stats {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Resolve addresses
    Lookup {
        /// IPv4 addresses to resolve
        #[arg(required = true)]
        addrs: Vec<Ipv4Addr>,
    },

    /// Check the table against the route file's own longest-prefix match
    Verify {
        /// Evenly spaced addresses to check besides every route boundary
        #[arg(short, long, default_value_t = 1 << 20)]
        samples: u32,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::from_yaml_file(path)?,
        None => Config::default(),
    };
    if let Some(bits) = cli.direct_bits {
        config = config.with_direct_bits(bits);
    }

    let rib = match &cli.routes {
        Some(path) => load_routes(path)?,
        None => Rib::new(),
    };

    let start = Instant::now();
    let mut dxr = Dxr::new(config)?;
    let report = dxr.rebuild_all(&rib)?;
    log::info!(
        "built {} routes into {} chunks in {:?} ({} direct bits, {} range words)",
        rib.len(),
        report.allocated,
        start.elapsed(),
        dxr.config().direct_bits,
        dxr.config().range_capacity
    );

    match cli.command {
        Commands::Stats { json } => {
            let stats = dxr.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Routes: {}", rib.len());
                println!("{}", stats);
            }
        }
        Commands::Lookup { addrs } => {
            for addr in addrs {
                println!("{} -> {}", addr, dxr.lookup_addr(addr));
            }
        }
        Commands::Verify { samples } => {
            let mismatches = verify(&dxr, &rib, samples);
            if mismatches > 0 {
                return Err(format!("{} mismatches", mismatches).into());
            }
            println!("OK");
        }
    }
    Ok(())
}

fn load_routes(path: &Path) -> dxr_fib::Result<Rib> {
    let rib = Rib::from_reader(File::open(path)?)?;
    log::info!("loaded {} routes from {:?}", rib.len(), path);
    Ok(rib)
}

fn verify(dxr: &Dxr, rib: &Rib, samples: u32) -> usize {
    let oracle = |addr: u32| rib.lpm_lookup(addr).map_or(NextHop::NONE, |r| r.nexthop);

    let mut probes = Vec::new();
    for route in rib.routes() {
        let last = route.last();
        probes.extend([
            route.prefix.wrapping_sub(1),
            route.prefix,
            last,
            last.wrapping_add(1),
        ]);
    }
    let stride = (u32::MAX / samples.max(1)).max(1);
    probes.extend((0..samples).map(|i| i.wrapping_mul(stride)));

    let total = probes.len();
    let mut mismatches = 0;
    for addr in probes {
        let want = oracle(addr);
        let got = dxr.lookup(addr);
        if got != want {
            mismatches += 1;
            if mismatches <= 10 {
                eprintln!("{}: table says {}, routes say {}", Ipv4Addr::from(addr), got, want);
            }
        }
    }
    log::info!("checked {} addresses, {} mismatches", total, mismatches);
    mismatches
}
