//! vmsched-soak: drives a `ComputerThread` with synthetic computers.
//!
//! Runs a set of well-behaved computers which keep resubmitting themselves
//! alongside a few wedged ones which ignore every abort, then stops the
//! scheduler and reports what each computer got to do.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use vmsched::scheduler::interrupt;
use vmsched::{
    AggregateMetrics, ComputerThread, Executor, SchedulerConfig, SchedulerError, SchedulerStatus, WorkError, Worker,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Soak test for the computer scheduler.
#[derive(Parser, Debug)]
#[command(name = "vmsched-soak", version, about)]
struct Cli {
    /// Path to a scheduler TOML config. Defaults to VMSCHED_* env vars.
    #[arg(long, env = "VMSCHED_CONFIG")]
    config: Option<String>,

    /// Worker threads (overrides the config).
    #[arg(long)]
    threads: Option<usize>,

    /// Number of well-behaved computers.
    #[arg(long, default_value_t = 8)]
    computers: usize,

    /// Number of computers which never yield.
    #[arg(long, default_value_t = 1)]
    wedged: usize,

    /// How long to run before stopping, in seconds.
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Time each well-behaved task spends working, in milliseconds.
    #[arg(long, default_value_t = 2)]
    work_ms: u64,

    /// Shutdown timeout in seconds. Must cover a wedged computer's full
    /// timeout plus two abort periods.
    #[arg(long, default_value_t = 15)]
    shutdown_timeout: u64,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

// ── Synthetic computers ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum Kind {
    Looping,
    Wedged,
}

/// A synthetic computer. Looping computers work for a moment and queue
/// themselves again; wedged ones block far past every timeout.
struct SoakComputer {
    id: i32,
    kind: Kind,
    work: Duration,
    executor: OnceLock<Weak<dyn Executor>>,
    runs: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    unloads: AtomicU64,
}

impl SoakComputer {
    fn new(id: i32, kind: Kind, work: Duration) -> Self {
        Self {
            id,
            kind,
            work,
            executor: OnceLock::new(),
            runs: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            unloads: AtomicU64::new(0),
        }
    }

    fn resubmit(&self) {
        let Some(executor) = self.executor.get().and_then(Weak::upgrade) else { return };
        match executor.submit() {
            Ok(()) | Err(SchedulerError::NotRunning) => {}
            Err(e) => warn!(computer = self.id, "Failed to resubmit: {e}"),
        }
    }
}

impl Worker for SoakComputer {
    fn work(&self) -> Result<(), WorkError> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        match self.kind {
            Kind::Looping => {
                interrupt::sleep(self.work)?;
                self.resubmit();
                Ok(())
            }
            Kind::Wedged => {
                // Deliberately not interruptible.
                std::thread::sleep(self.work);
                Ok(())
            }
        }
    }

    fn computer_id(&self) -> i32 {
        self.id
    }

    fn write_state(&self, output: &mut dyn std::fmt::Write) {
        let _ = writeln!(output, "Soak computer #{} ({:?}), {} runs", self.id, self.kind, self.runs.load(Ordering::Relaxed));
    }

    fn abort_with_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn abort_with_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Report ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ComputerReport {
    id: i32,
    kind: Kind,
    runs: u64,
    timeouts: u64,
    errors: u64,
    unloads: u64,
    virtual_runtime_ms: f64,
}

#[derive(Serialize)]
struct SoakReport {
    config: serde_json::Value,
    elapsed_ms: u128,
    stopped_cleanly: bool,
    status: SchedulerStatus,
    computers: Vec<ComputerReport>,
    metrics: serde_json::Value,
}

fn load_config(cli: &Cli) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path).with_context(|| format!("loading config from {path}"))?,
        None => SchedulerConfig::from_env(),
    };
    if let Some(threads) = cli.threads {
        config.worker_threads = threads;
    }
    config.validate()?;
    Ok(config)
}

fn print_text(report: &SoakReport) {
    println!("elapsed: {} ms, stopped cleanly: {}", report.elapsed_ms, report.stopped_cleanly);
    println!(
        "workers: {} live, {} replaced; {} queued",
        report.status.live_workers, report.status.replaced_workers, report.status.queued
    );
    println!("{:>6} {:>8} {:>8} {:>8} {:>7} {:>7} {:>12}", "id", "kind", "runs", "timeouts", "errors", "unloads", "vruntime_ms");
    for c in &report.computers {
        println!(
            "{:>6} {:>8} {:>8} {:>8} {:>7} {:>7} {:>12.1}",
            c.id,
            format!("{:?}", c.kind),
            c.runs,
            c.timeouts,
            c.errors,
            c.unloads,
            c.virtual_runtime_ms
        );
    }
    println!("metrics: {}", report.metrics);
}

// ── main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    vmsched_core::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    config.log_summary();

    // Wedged computers block for well past the hard abort.
    let wedge = config.timeout() + config.abort_timeout() * 4;
    let scheduler = ComputerThread::new(config.clone())?;
    let metrics = Arc::new(AggregateMetrics::new());

    let mut computers = Vec::new();
    let mut executors = Vec::new();
    for i in 0..cli.computers + cli.wedged {
        let (kind, work) = if i < cli.computers {
            (Kind::Looping, Duration::from_millis(cli.work_ms))
        } else {
            (Kind::Wedged, wedge)
        };
        let computer = Arc::new(SoakComputer::new(i as i32, kind, work));
        let executor = scheduler.create_executor(computer.clone(), metrics.clone());
        let _ = computer.executor.set(Arc::downgrade(&executor));
        computers.push(computer);
        executors.push(executor);
    }

    info!(computers = cli.computers, wedged = cli.wedged, duration_s = cli.duration, "Starting soak");
    let started = Instant::now();
    for executor in &executors {
        executor.submit()?;
    }

    std::thread::sleep(Duration::from_secs(cli.duration));
    let stopped_cleanly = scheduler.stop(Duration::from_secs(cli.shutdown_timeout));
    if !stopped_cleanly {
        warn!("Scheduler did not stop within {}s", cli.shutdown_timeout);
    }

    let report = SoakReport {
        config: config.summary(),
        elapsed_ms: started.elapsed().as_millis(),
        stopped_cleanly,
        status: scheduler.status(),
        computers: computers
            .iter()
            .zip(&executors)
            .map(|(c, e)| ComputerReport {
                id: c.id,
                kind: c.kind,
                runs: c.runs.load(Ordering::Relaxed),
                timeouts: c.timeouts.load(Ordering::Relaxed),
                errors: c.errors.load(Ordering::Relaxed),
                unloads: c.unloads.load(Ordering::Relaxed),
                virtual_runtime_ms: e.virtual_runtime() as f64 / 1e6,
            })
            .collect(),
        metrics: serde_json::to_value(metrics.snapshot())?,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }
    Ok(())
}
