//! embstore - Synthetic Training Workload
//!
//! Drives a tiered embedding store with a skewed lookup/update/evict loop and
//! reports the resulting tier metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        embstore driver                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Workload   │───▶│ EmbeddingVar │───▶│ TieredStorage│       │
//! │  │  (blocking)  │    │              │    │ HBM/DRAM/SSD │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │         ▲                                       │               │
//! │      Ctrl-C                                 Reporter            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use embstore::storage::export_prometheus;
use embstore::{CacheStrategy, EmbeddingConfig, EmbeddingVar, StorageConfig, TieredStorage};

// =============================================================================
// CLI Arguments
// =============================================================================

/// embstore - Multi-tier embedding storage workload driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML storage configuration
    #[arg(long, env = "EMBSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for SSD tier segments
    #[arg(long, env = "EMBSTORE_SSD_PATH")]
    ssd_path: Option<PathBuf>,

    /// Size of the key space
    #[arg(long, env = "EMBSTORE_KEYS", default_value = "1000000")]
    keys: u64,

    /// Keys looked up per step
    #[arg(long, env = "EMBSTORE_BATCH_SIZE", default_value = "4096")]
    batch_size: usize,

    /// Training steps to run
    #[arg(long, env = "EMBSTORE_STEPS", default_value = "200")]
    steps: u64,

    /// Embedding width
    #[arg(long, env = "EMBSTORE_VALUE_LEN", default_value = "16")]
    value_len: usize,

    /// Accesses before a key gets its own embedding (0 admits all)
    #[arg(long, env = "EMBSTORE_FILTER_FREQ", default_value = "0")]
    filter_freq: u64,

    /// Drop keys untouched for this many steps (0 disables)
    #[arg(long, env = "EMBSTORE_STEPS_TO_LIVE", default_value = "0")]
    steps_to_live: i64,

    /// Run shrink every N steps (0 disables)
    #[arg(long, env = "EMBSTORE_SHRINK_EVERY", default_value = "0")]
    shrink_every: u64,

    /// Worker threads for batch lookups (0 = available parallelism)
    #[arg(long, env = "EMBSTORE_THREADS")]
    threads: Option<usize>,

    /// HBM budget in MiB
    #[arg(long, env = "EMBSTORE_HBM_MB")]
    hbm_mb: Option<u64>,

    /// DRAM budget in MiB
    #[arg(long, env = "EMBSTORE_DRAM_MB")]
    dram_mb: Option<u64>,

    /// HBM eviction strategy (lru, lfu)
    #[arg(long, env = "EMBSTORE_STRATEGY")]
    strategy: Option<CacheStrategy>,

    /// Progress report interval in seconds (0 disables)
    #[arg(long, env = "EMBSTORE_REPORT_SECS", default_value = "5")]
    report_secs: u64,

    /// Print final metrics in Prometheus text format instead of JSON
    #[arg(long, env = "EMBSTORE_PROMETHEUS")]
    prometheus: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = build_config(&args)?;
    info!("Starting embstore workload");
    info!("  Storage: {}", config.name);
    info!("  SSD path: {}", config.ssd.path.display());
    info!("  HBM budget: {} bytes", config.hbm_capacity_bytes);
    info!("  DRAM budget: {} bytes", config.dram_capacity_bytes);
    info!("  Strategy: {}", config.cache_strategy);
    info!("  IO scheme: {}", config.ssd.io_scheme);
    info!(
        "  Workload: {} steps x {} keys over {} ids",
        args.steps, args.batch_size, args.keys
    );

    let storage = Arc::new(
        TieredStorage::<i64, f32>::new(config).context("failed to open tiered storage")?,
    );
    let mut var_config = EmbeddingConfig::new(args.value_len);
    var_config.filter_freq = args.filter_freq;
    var_config.steps_to_live = args.steps_to_live;
    let var = EmbeddingVar::new(Arc::clone(&storage), var_config)?;

    let stop = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(AtomicU64::new(0));

    // Stop after the current step on Ctrl-C
    let stop_signal = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            stop_signal.store(true, Ordering::Relaxed);
        }
    });

    let reporter = (args.report_secs > 0).then(|| {
        let storage = Arc::clone(&storage);
        let progress = Arc::clone(&progress);
        let every = Duration::from_secs(args.report_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let m = storage.metrics();
                info!(
                    step = progress.load(Ordering::Relaxed),
                    hbm_keys = m.hbm_keys,
                    dram_keys = m.dram_keys,
                    ssd_keys = m.ssd_keys,
                    hbm_hit_ratio = m.hbm_hit_ratio,
                    lookup_latency_us = m.lookup_latency_us,
                    "Progress"
                );
            }
        })
    });

    let workload = Workload {
        key_space: args.keys.max(1),
        batch_size: args.batch_size,
        steps: args.steps,
        shrink_every: args.shrink_every,
        learning_rate: 0.01,
    };
    let started = Instant::now();
    let steps_run = {
        let stop = Arc::clone(&stop);
        let progress = Arc::clone(&progress);
        tokio::task::spawn_blocking(move || workload.run(&var, &stop, &progress)).await??
    };
    if let Some(reporter) = reporter {
        reporter.abort();
    }

    storage.flush_background();
    info!(
        "Ran {} steps in {:.2}s",
        steps_run,
        started.elapsed().as_secs_f64()
    );

    let snapshot = storage.metrics();
    if args.prometheus {
        print!("{}", export_prometheus("embstore", &snapshot)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    info!("Workload complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

fn build_config(args: &Args) -> anyhow::Result<StorageConfig> {
    let mut config = match &args.config {
        Some(path) => StorageConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => StorageConfig::default(),
    };
    config.apply_env_overrides()?;

    if let Some(path) = &args.ssd_path {
        config.ssd.path = path.clone();
    }
    if let Some(threads) = args.threads {
        config.worker_threads = threads;
    }
    if let Some(mb) = args.hbm_mb {
        config.hbm_capacity_bytes = mb * 1024 * 1024;
    }
    if let Some(mb) = args.dram_mb {
        config.dram_capacity_bytes = mb * 1024 * 1024;
    }
    if let Some(strategy) = args.strategy {
        config.cache_strategy = strategy;
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Workload
// =============================================================================

struct Workload {
    key_space: u64,
    batch_size: usize,
    steps: u64,
    shrink_every: u64,
    learning_rate: f32,
}

impl Workload {
    /// Run until `steps` complete or `stop` is raised; returns steps run
    fn run(
        &self,
        var: &EmbeddingVar<i64, f32>,
        stop: &AtomicBool,
        progress: &AtomicU64,
    ) -> embstore::Result<u64> {
        let mut rng = rand::rng();
        let storage = var.storage();
        let mut grad = vec![0f32; var.value_len()];

        for step in 0..self.steps {
            if stop.load(Ordering::Relaxed) {
                return Ok(step);
            }

            // Cubing a uniform sample concentrates accesses on low ids
            let keys: Vec<i64> = (0..self.batch_size)
                .map(|_| {
                    let u: f64 = rng.random();
                    (self.key_space as f64 * u * u * u) as i64
                })
                .collect();

            let slots = var.batch_lookup_or_create(&keys, None)?;
            for (slot, admitted) in &slots {
                if *admitted {
                    grad.iter_mut()
                        .for_each(|g| *g = rng.random::<f32>() - 0.5);
                    let mut weights = var.flat(slot)?;
                    for (w, g) in weights.iter_mut().zip(&grad) {
                        *w -= self.learning_rate * g;
                    }
                }
                var.update_version(slot, step as i64);
            }
            drop(slots);

            var.update_cache(&keys, None)?;
            storage.schedule_eviction();

            if self.shrink_every > 0 && step > 0 && step % self.shrink_every == 0 {
                let removed = var.shrink(step as i64)?;
                info!(step, removed, "Shrink");
            }
            progress.store(step + 1, Ordering::Relaxed);
        }
        Ok(self.steps)
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
