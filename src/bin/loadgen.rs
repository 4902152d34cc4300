//! AtlasLog Load Generator
//!
//! Drives a log engine with concurrent appenders and reports commit
//! throughput. Optionally resizes the log or archives it mid-run.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use atlaslog::{Config, FatalPolicy, IoMode, LogEngine};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Normal,
    Mmap,
    Archived,
}

/// AtlasLog load generator
#[derive(Parser, Debug)]
#[command(name = "atlaslog-loadgen")]
#[command(about = "Concurrent append/commit load against an AtlasLog log")]
#[command(version)]
struct Args {
    /// Log directory
    #[arg(short, long, default_value = "./atlaslog_data")]
    log_dir: String,

    /// Log file size in MB
    #[arg(short = 's', long, default_value = "96")]
    log_file_mb: u64,

    /// Log buffer size in KB
    #[arg(short = 'b', long, default_value = "2048")]
    buffer_kb: usize,

    /// Appender threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Records per thread
    #[arg(short, long, default_value = "100000")]
    records: usize,

    /// Record size in bytes
    #[arg(long, default_value = "128")]
    record_size: usize,

    /// Commit after every N appends
    #[arg(long, default_value = "8")]
    commit_every: usize,

    /// I/O mode
    #[arg(long, value_enum, default_value = "normal")]
    mode: Mode,

    /// Resize the log to this many MB halfway through
    #[arg(long)]
    resize_mb: Option<u64>,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,atlaslog=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("AtlasLog load generator v{}", atlaslog::VERSION);

    let config = Config::builder()
        .log_dir(&args.log_dir)
        .log_file_size(args.log_file_mb * 1024 * 1024)
        .log_buffer_size(args.buffer_kb * 1024)
        .io_mode(match args.mode {
            Mode::Normal => IoMode::Normal,
            Mode::Mmap => IoMode::CircularMmap,
            Mode::Archived => IoMode::ArchivedMmap,
        })
        .fatal_policy(FatalPolicy::Propagate)
        .build();

    let engine = match LogEngine::open(config) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!("Failed to open log: {}", e);
            std::process::exit(1);
        }
    };

    let started = Instant::now();
    let start_lsn = engine.buffered_lsn();

    let workers: Vec<_> = (0..args.threads)
        .map(|id| {
            let engine = Arc::clone(&engine);
            let records = args.records;
            let record_size = args.record_size;
            let commit_every = args.commit_every.max(1);
            thread::spawn(move || -> atlaslog::Result<()> {
                let record = vec![id as u8; record_size];
                for i in 0..records {
                    let lsn = engine.append(&record)?;
                    if (i + 1) % commit_every == 0 {
                        engine.commit(lsn)?;
                    }
                }
                Ok(())
            })
        })
        .collect();

    if let Some(mb) = args.resize_mb {
        thread::sleep(Duration::from_millis(200));
        let outcome = engine
            .resize_start(mb * 1024 * 1024)
            .and_then(|_| engine.resize_rename());
        match outcome {
            Ok(size) => tracing::info!("Log resized to {} bytes", size),
            Err(e) => tracing::warn!("Resize failed: {}", e),
        }
    }

    let mut failed = false;
    for handle in workers {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Appender failed: {}", e);
                failed = true;
            }
            Err(_) => {
                tracing::error!("Appender panicked");
                failed = true;
            }
        }
    }

    let elapsed = started.elapsed();
    let total = (args.threads * args.records) as f64;
    let bytes = engine.buffered_lsn() - start_lsn;
    let stats = engine.stats();
    tracing::info!(
        "{} records in {:.2?} ({:.0} records/s, {:.1} MB/s of log)",
        total,
        elapsed,
        total / elapsed.as_secs_f64(),
        bytes as f64 / elapsed.as_secs_f64() / (1024.0 * 1024.0)
    );
    tracing::info!(
        "writes={} flushes={} checkpoints={} archived={}",
        stats.physical_writes,
        stats.flushes,
        stats.checkpoints,
        stats.archived_bytes
    );

    let engine = match Arc::try_unwrap(engine) {
        Ok(engine) => engine,
        Err(_) => {
            tracing::error!("Engine still shared at shutdown");
            std::process::exit(1);
        }
    };
    if let Err(e) = engine.shutdown() {
        tracing::error!("Shutdown failed: {}", e);
        failed = true;
    }
    if failed {
        std::process::exit(1);
    }
}
