//! pmem-mmio workload driver
//!
//! Opens one file through the engine, runs a mixed random read/write workload
//! from several threads, verifies every byte against per-thread shadow copies
//! and prints a report.

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use pmem_mmio::system::metrics::{Metrics, MetricsSnapshot};
use pmem_mmio::{Config, Engine, OpenOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

/// Workload shape taken from the command line
#[derive(Debug, Clone, Serialize)]
struct Workload {
    file: PathBuf,
    threads: usize,
    ops: usize,
    io_size: usize,
    write_ratio: f64,
    file_size: u64,
    sync_every: usize,
    seed: u64,
}

/// Per-thread outcome
#[derive(Debug, Default)]
struct ThreadResult {
    reads: u64,
    writes: u64,
    syncs: u64,
    mismatches: u64,
    shadow: Vec<u8>,
}

/// Occupancy of one pool at the end of the run
#[derive(Debug, Serialize)]
struct PoolReport {
    class: String,
    capacity: usize,
    available: usize,
}

/// Final report
#[derive(Debug, Serialize)]
struct Report {
    workload: Workload,
    elapsed_ms: u128,
    ops_per_sec: f64,
    reads: u64,
    writes: u64,
    syncs: u64,
    mismatches: u64,
    verified_bytes: u64,
    final_policy: String,
    final_epoch: u64,
    metrics: MetricsSnapshot,
    pools: Vec<PoolReport>,
}

fn main() -> anyhow::Result<()> {
    let matches = Command::new("pmem-mmio")
        .version(pmem_mmio::VERSION)
        .about("Mixed read/write workload against the persistent-memory I/O engine.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
        )
        .arg(
            Arg::new("pmem-path")
                .long("pmem-path")
                .value_name("DIR")
                .help("Directory holding the pool backing files")
        )
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_name("PATH")
                .help("Target file (default: <pmem-path>/pmem-mmio.dat)")
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_name("N")
                .help("Worker threads (default: CPU count)")
        )
        .arg(
            Arg::new("ops")
                .long("ops")
                .value_name("N")
                .default_value("10000")
                .help("Operations per thread")
        )
        .arg(
            Arg::new("io-size")
                .long("io-size")
                .value_name("BYTES")
                .default_value("4096")
                .help("Largest transfer per operation")
        )
        .arg(
            Arg::new("write-ratio")
                .long("write-ratio")
                .value_name("RATIO")
                .default_value("0.5")
                .help("Fraction of operations that write (0.0-1.0)")
        )
        .arg(
            Arg::new("file-size")
                .long("file-size")
                .value_name("BYTES")
                .default_value("16777216")
                .help("Bytes of file the workload spreads over")
        )
        .arg(
            Arg::new("sync-every")
                .long("sync-every")
                .value_name("N")
                .default_value("1000")
                .help("Commit after every N operations of a thread (0 disables)")
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_name("N")
                .help("Random seed (default: random)")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the report as JSON")
        )
        .get_matches();

    // Load configuration
    let mut config = if let Some(config_path) = matches.get_one::<String>("config") {
        Config::from_file(config_path)?
    } else {
        Config::load()?
    };

    // Apply CLI overrides
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;
    pmem_mmio::init(&config)?;

    let workload = parse_workload(&config, &matches)?;
    info!(?workload, "starting workload");

    let report = run(config, workload)?;
    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.mismatches > 0 {
        bail!("{} mismatching reads", report.mismatches);
    }
    Ok(())
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &clap::ArgMatches) -> pmem_mmio::Result<()> {
    if let Some(path) = matches.get_one::<String>("pmem-path") {
        config.storage.pmem_path = path.into();
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    Ok(())
}

fn parse<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    matches
        .get_one::<String>(name)
        .map(|v| v.parse::<T>().map_err(|e| anyhow::anyhow!("Invalid --{} {}: {}", name, v, e)))
        .transpose()
}

fn parse_workload(config: &Config, matches: &clap::ArgMatches) -> anyhow::Result<Workload> {
    let threads = parse(matches, "threads")?.unwrap_or_else(num_cpus::get).max(1);
    let io_size: usize = parse(matches, "io-size")?.unwrap_or(4096);
    let file_size: u64 = parse(matches, "file-size")?.unwrap_or(16 << 20);
    let write_ratio: f64 = parse(matches, "write-ratio")?.unwrap_or(0.5);

    if !(0.0..=1.0).contains(&write_ratio) {
        bail!("--write-ratio must lie in 0.0..=1.0");
    }
    if io_size == 0 {
        bail!("--io-size must be positive");
    }
    if file_size > config.engine.max_region_size {
        bail!("--file-size exceeds engine.max_region_size ({})", config.engine.max_region_size);
    }
    if file_size / (threads as u64) < io_size as u64 {
        bail!("--file-size leaves less than one --io-size per thread");
    }

    Ok(Workload {
        file: matches
            .get_one::<String>("file")
            .map(PathBuf::from)
            .unwrap_or_else(|| config.storage.pmem_path.join("pmem-mmio.dat")),
        threads,
        ops: parse(matches, "ops")?.unwrap_or(10_000),
        io_size,
        write_ratio,
        file_size,
        sync_every: parse(matches, "sync-every")?.unwrap_or(1000),
        seed: parse(matches, "seed")?.unwrap_or_else(|| rand::rng().random()),
    })
}

fn run(config: Config, workload: Workload) -> anyhow::Result<Report> {
    match std::fs::remove_file(&workload.file) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err(e).with_context(|| format!("removing {}", workload.file.display()));
        }
        _ => {}
    }

    let engine = Engine::new(config)?;
    let stripe = (workload.file_size / workload.threads as u64) as usize;
    let started = Instant::now();

    let results = std::thread::scope(|s| {
        let workers: Vec<_> = (0..workload.threads)
            .map(|t| {
                let engine = &engine;
                let workload = &workload;
                s.spawn(move || worker(engine, workload, t, stripe))
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().map_err(|_| anyhow::anyhow!("worker panicked"))?)
            .collect::<anyhow::Result<Vec<_>>>()
    })?;
    let elapsed = started.elapsed();

    let mut file = engine.open(&workload.file, OpenOptions::new().write(true))?;
    file.sync()?;
    let region = file.mapped_region()?;
    let (final_policy, final_epoch) = (region.policy().to_string(), region.epoch());
    region.checkpoint()?;

    // live view first, then the bytes that reached the file
    let mut mismatches: u64 = results.iter().map(|r| r.mismatches).sum();
    for (t, r) in results.iter().enumerate() {
        let mut live = vec![0u8; r.shadow.len()];
        let n = file.read_at((t * stripe) as u64, &mut live)?;
        mismatches += count_diff(&live[..n], &r.shadow[..n]);
    }
    file.close()?;
    engine.shutdown()?;

    let on_disk = std::fs::read(&workload.file)
        .with_context(|| format!("reading back {}", workload.file.display()))?;
    let mut verified = 0u64;
    for (t, r) in results.iter().enumerate() {
        let start = (t * stripe).min(on_disk.len());
        let end = (t * stripe + r.shadow.len()).min(on_disk.len());
        mismatches += count_diff(&on_disk[start..end], &r.shadow[..end - start]);
        verified += (end - start) as u64;
    }
    if mismatches > 0 {
        warn!(mismatches, "verification failed");
    }

    let total_ops = (workload.threads * workload.ops) as f64;
    Ok(Report {
        elapsed_ms: elapsed.as_millis(),
        ops_per_sec: total_ops / elapsed.as_secs_f64().max(f64::EPSILON),
        reads: results.iter().map(|r| r.reads).sum(),
        writes: results.iter().map(|r| r.writes).sum(),
        syncs: results.iter().map(|r| r.syncs).sum(),
        mismatches,
        verified_bytes: verified,
        final_policy,
        final_epoch,
        metrics: Metrics::global().snapshot(),
        pools: engine
            .stats()
            .into_iter()
            .map(|s| PoolReport {
                class: s.class.to_string(),
                capacity: s.capacity,
                available: s.available,
            })
            .collect(),
        workload,
    })
}

/// One thread's share: random I/O inside its own stripe, checked against a shadow.
fn worker(engine: &Engine, workload: &Workload, t: usize, stripe: usize) -> anyhow::Result<ThreadResult> {
    let mut file = engine.open(&workload.file, OpenOptions::new().write(true).create(true))?;
    let mut rng = StdRng::seed_from_u64(workload.seed.wrapping_add(t as u64));
    let base = (t * stripe) as u64;
    let mut out = ThreadResult::default();
    let mut buf = vec![0u8; workload.io_size];

    for op in 1..=workload.ops {
        let len = rng.random_range(1..=workload.io_size);
        let off = rng.random_range(0..=stripe - len);
        if rng.random_bool(workload.write_ratio) {
            rng.fill(&mut buf[..len]);
            file.write_at(base + off as u64, &buf[..len])?;
            if out.shadow.len() < off + len {
                out.shadow.resize(off + len, 0);
            }
            out.shadow[off..off + len].copy_from_slice(&buf[..len]);
            out.writes += 1;
        } else {
            let n = file.read_at(base + off as u64, &mut buf[..len])?;
            // bytes past this thread's last write are zero or not yet in the file
            let known = out.shadow.len().saturating_sub(off).min(n);
            if known > 0 {
                out.mismatches += count_diff(&buf[..known], &out.shadow[off..off + known]);
            }
            out.reads += 1;
        }
        if workload.sync_every > 0 && op % workload.sync_every == 0 {
            file.sync()?;
            out.syncs += 1;
        }
    }
    file.close()?;
    Ok(out)
}

fn count_diff(a: &[u8], b: &[u8]) -> u64 {
    a.iter().zip(b).filter(|(x, y)| x != y).count() as u64
}

fn print_report(r: &Report) {
    println!("pmem-mmio v{}", pmem_mmio::VERSION);
    println!(
        "  {} threads x {} ops, io <= {} B, write ratio {:.2}, seed {}",
        r.workload.threads, r.workload.ops, r.workload.io_size, r.workload.write_ratio, r.workload.seed
    );
    println!("  elapsed        {} ms ({:.0} ops/s)", r.elapsed_ms, r.ops_per_sec);
    println!("  reads/writes   {} / {} ({} syncs)", r.reads, r.writes, r.syncs);
    println!("  final state    epoch {}, policy {}", r.final_epoch, r.final_policy);
    println!(
        "  checkpoints    {} ({} records reclaimed, {} policy switches)",
        r.metrics.checkpoints, r.metrics.records_reclaimed, r.metrics.policy_switches
    );
    println!("  verified       {} bytes, {} mismatches", r.verified_bytes, r.mismatches);
    for p in &r.pools {
        if p.available != p.capacity {
            println!("  pool {:<10} {} of {} free", p.class, p.available, p.capacity);
        }
    }
}
