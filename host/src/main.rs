//! Batch driver for the multi-lane RandomX VM
//!
//! Usage: randomx-simt [options]
//!
//! Builds a batch of VM instances from a seed, compiles every program for
//! the chosen lanes per hash and runs all instances in parallel. Entropy,
//! scratchpads and the dataset are synthetic, derived from the seed.
//!
//! Examples:
//!   randomx-simt --hashes 64 --workers 8
//!   randomx-simt --hashes 4 --iterations 16 --verify --json
//!   randomx-simt --full-dataset --hashes 256

use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use sysinfo::System;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use randomx_simt::randomx::config::{RANDOMX_PROGRAM_ITERATIONS, RANDOMX_SCRATCHPAD_L3};
use randomx_simt::{
    Dataset, Error, ExecutionConfig, ScheduleStats, VmBatch, VmOutput, WorkersPerHash,
};

const MIB: usize = 1 << 20;

#[derive(Debug, Parser)]
#[command(name = "randomx-simt", version, about = "Run batches of RandomX VMs on simulated lanes")]
struct Args {
    /// Number of hash instances
    #[arg(long, default_value_t = 16)]
    hashes: usize,

    /// Lanes cooperating on each instance (1, 2, 4 or 8)
    #[arg(long, default_value_t = 8)]
    workers: u32,

    /// Rounds per instance
    #[arg(long, default_value_t = RANDOMX_PROGRAM_ITERATIONS)]
    iterations: usize,

    /// Rounds per launch; 0 runs all rounds in one launch
    #[arg(long, default_value_t = 0)]
    batch_iterations: usize,

    /// Hex seed for entropy, scratchpads and the dataset
    #[arg(long, default_value = "72616e646f6d782d73696d74")]
    seed: String,

    /// Synthetic dataset size in MiB
    #[arg(long, default_value_t = 64)]
    dataset_mib: usize,

    /// Allocate a full-size dataset (2 GiB plus the extra lines)
    #[arg(long)]
    full_dataset: bool,

    /// Cross-check every instance against the reference interpreter
    #[arg(long)]
    verify: bool,

    /// Print the outputs as JSON
    #[arg(long)]
    json: bool,

    /// Worker threads (defaults to one per core)
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Report {
    config: ExecutionConfig,
    seed: String,
    dataset_bytes: usize,
    stats: ScheduleStats,
    ipc: f64,
    elapsed_ms: u64,
    verified: Option<bool>,
    outputs: Vec<OutputRecord>,
}

#[derive(Debug, Serialize)]
struct OutputRecord {
    index: usize,
    /// 192-byte output layout: r, F xor E, E
    hex: String,
    registers: VmOutput,
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.insert(0, ',');
        }
        result.insert(0, c);
    }
    result
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1u64 << 30) as f64
}

/// Log the machine and fail early when the batch cannot fit in memory
fn check_memory(needed: usize) -> Result<()> {
    let mut sys = System::new_all();
    sys.refresh_all();

    info!(
        cores = sys.cpus().len(),
        cpu = sys.cpus().first().map(|c| c.brand()).unwrap_or("unknown"),
        total_gib = gib(sys.total_memory()),
        available_gib = gib(sys.available_memory()),
        "system information"
    );

    let available = sys.available_memory();
    if available > 0 && needed as u64 > available {
        bail!(
            "batch needs {:.2} GiB but only {:.2} GiB is available",
            gib(needed as u64),
            gib(available)
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("failed to configure the thread pool")?;
    }

    let workers = WorkersPerHash::try_from(args.workers)?;
    let seed = hex::decode(&args.seed).map_err(Error::from)?;
    let config = ExecutionConfig::new()
        .with_workers(workers)
        .with_iterations(args.iterations)
        .with_batch_iterations(args.batch_iterations);

    let dataset_bytes = if args.full_dataset {
        Dataset::full_size()
    } else {
        args.dataset_mib * MIB
    };
    // scratchpads, plus a second copy of each while verifying
    let copies = if args.verify { 2 } else { 1 };
    check_memory(dataset_bytes + args.hashes * RANDOMX_SCRATCHPAD_L3 * copies)?;

    info!(
        hashes = args.hashes,
        workers = workers.lanes(),
        iterations = config.iterations,
        launches = config.launches().len(),
        dataset_mib = dataset_bytes / MIB,
        "starting batch"
    );

    let start = Instant::now();
    let dataset = Dataset::from_seed(&seed, dataset_bytes).context("failed to build the dataset")?;
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "dataset ready");

    let mut batch = VmBatch::from_seed(config, dataset, &seed, args.hashes)?;
    let stats = batch.stats();
    info!(
        instructions = %format_number(stats.instructions as u64),
        cycles = %format_number(stats.cycles as u64),
        words = %format_number(stats.words as u64),
        ipc = stats.ipc(),
        "schedule"
    );

    let expected = args.verify.then(|| batch.expected_outputs());

    let run_start = Instant::now();
    let outputs = batch.run()?;
    let elapsed = run_start.elapsed();

    let verified = match &expected {
        Some(expected) => {
            let mismatches: Vec<usize> = outputs
                .iter()
                .zip(expected.iter())
                .enumerate()
                .filter(|(_, (got, want))| got != want)
                .map(|(i, _)| i)
                .collect();
            if mismatches.is_empty() {
                info!(instances = outputs.len(), "all instances match the reference interpreter");
            } else {
                warn!(?mismatches, "instances differ from the reference interpreter");
            }
            Some(mismatches.is_empty())
        }
        None => None,
    };

    if args.json {
        let report = Report {
            config,
            seed: args.seed.clone(),
            dataset_bytes,
            stats,
            ipc: stats.ipc(),
            elapsed_ms: elapsed.as_millis() as u64,
            verified,
            outputs: outputs
                .iter()
                .enumerate()
                .map(|(index, out)| OutputRecord {
                    index,
                    hex: hex::encode(out.to_bytes()),
                    registers: *out,
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for (index, out) in outputs.iter().enumerate() {
            println!("{index:>6}  {}", hex::encode(&out.to_bytes()[..64]));
        }
    }

    if verified == Some(false) {
        bail!("compiled execution diverged from the reference interpreter");
    }
    Ok(())
}
