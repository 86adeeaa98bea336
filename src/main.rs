//! Command-line driver: discover the machine, generate the input
//! relations, run the join, print the reduced result.

use std::time::Instant;

use clap::Parser;
use log::info;

use polyjoin::{engine, generate, JoinConfig, JoinContext, Result, Topology};

#[derive(Debug, Parser)]
#[command(name = "polyjoin", version, about = "Adaptive parallel radix hash join")]
struct Args {
    /// Worker thread count (default: all hardware threads)
    #[arg(long)]
    threads: Option<usize>,

    /// Build-relation size in tuples
    #[arg(long, default_value_t = 12_800_000)]
    r: usize,

    /// Probe-relation size in tuples
    #[arg(long, default_value_t = 12_800_000)]
    s: usize,

    /// Zipf exponent for the probe side (0 = uniform)
    #[arg(long, default_value_t = 0.0)]
    skew: f64,

    /// Force both radices to this many bits, disabling skew rewrites
    #[arg(long)]
    radix: Option<u32>,

    /// Force the build-side radix
    #[arg(long)]
    radix_r: Option<u32>,

    /// Force the probe-side radix
    #[arg(long)]
    radix_s: Option<u32>,

    /// Pack threads onto sibling hardware threads on fewer LLCs instead of
    /// spreading them across physical cores
    #[arg(long)]
    favor_hyperthreading: bool,

    /// Store keys in place of payloads and count only verified probe hits
    #[arg(long)]
    verify_keys: bool,

    /// Build-side generator seed
    #[arg(long, default_value_t = 12345)]
    seed_r: u64,

    /// Probe-side generator seed
    #[arg(long, default_value_t = 54321)]
    seed_s: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let topo = Topology::discover()?;

    let mut config = JoinConfig::new(args.threads.unwrap_or_else(|| topo.num_cpus()));
    config.favor_physical_cores = !args.favor_hyperthreading;
    config.verify_keys = args.verify_keys;
    if let Some(bits) = args.radix {
        config.radix_r = Some(bits);
        config.radix_s = Some(bits);
    }
    if let Some(bits) = args.radix_r {
        config.radix_r = Some(bits);
    }
    if let Some(bits) = args.radix_s {
        config.radix_s = Some(bits);
    }

    let ctx = JoinContext::new(topo, config, args.r, args.s)?;

    println!(
        "join: |R| = {}, |S| = {} (z = {:.2}), R fanout 2^{}, S fanout 2^{}",
        args.r,
        args.s,
        args.skew,
        ctx.plan.r_bits(),
        ctx.plan.s_bits(),
    );
    println!(
        "{} threads, {} hw-thread(s)/core on {} LLC(s) [{:.2} MiB each]",
        ctx.num_threads(),
        ctx.placement.utilized_cpus_per_core,
        ctx.num_groups(),
        ctx.topology.llc_size as f64 / (1024.0 * 1024.0),
    );

    let started = Instant::now();
    let rel_r = generate::primary_keys(args.r, args.seed_r);
    let rel_s = if args.skew > 0.0 {
        generate::zipf_keys(args.r, args.s, args.skew, args.seed_s)?
    } else {
        generate::foreign_keys(args.r, args.s, args.seed_s)
    };
    info!("generated {} + {} tuples in {:?}", args.r, args.s, started.elapsed());

    let started = Instant::now();
    let stats = engine::execute(&ctx, &rel_r, &rel_s);
    info!("model {} finished in {:?}", stats.model, started.elapsed());

    println!("checksum: {}", stats.checksum);
    println!("total matches: {}", stats.matches);

    Ok(())
}
