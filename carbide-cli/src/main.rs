//! CLI for the carbide metrics write path.
//!
//! Runs the persister as a daemon fed from stdin, inspects archive files,
//! and validates configuration files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use carbide::{ArchiveFile, Config, DiskArchives, Persister, Points, PointsChannel, SystemClock};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// carbide: Graphite-compatible metrics write path.
#[derive(Parser)]
#[command(name = "carbide", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the persister, reading `metric value timestamp` lines from stdin.
    Run {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: PathBuf,
    },

    /// Display an archive file's header and retention ladder.
    Info {
        /// Path to a `.wsp` archive file.
        file: PathBuf,
    },

    /// Validate a configuration file and print it with defaults filled in.
    Check {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => cmd_run(&config),
        Commands::Info { file } => cmd_info(&file),
        Commands::Check { config } => cmd_check(&config),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `carbide run --config <file>`.
fn cmd_run(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_file(config_path)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.common.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let router = config.router()?;
    tracing::info!(
        storage_rules = router.storage_rule_count(),
        aggregation_rules = router.aggregation_rule_count(),
        "schemas loaded"
    );

    let input = PointsChannel::new(config.input.capacity);
    let mut persister = Persister::new(
        config.whisper,
        input.clone(),
        Arc::new(router),
        Arc::new(DiskArchives),
        Arc::new(SystemClock),
    );
    persister.start()?;

    let stdin = BufReader::new(tokio::io::stdin());
    let finished = tokio::select! {
        read = ingest(stdin, &input) => {
            let (accepted, rejected) = read?;
            tracing::info!(accepted, rejected, "end of input");
            true
        }
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            tracing::info!("interrupted");
            false
        }
    };

    if finished {
        tokio::select! {
            () = persister.drain() => {}
            interrupted = tokio::signal::ctrl_c() => {
                interrupted?;
                tracing::warn!("interrupted while draining, abandoning queued batches");
            }
        }
    }

    persister.stop();
    persister.join().await;
    Ok(())
}

/// Feeds plaintext lines into the queue. Returns accepted and rejected line
/// counts.
async fn ingest<R>(reader: R, input: &PointsChannel) -> Result<(u64, u64), Box<dyn std::error::Error>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut accepted = 0;
    let mut rejected = 0;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match Points::parse_plain(&line) {
            Some(points) => {
                input.send(points).await?;
                accepted += 1;
            }
            None => {
                tracing::warn!(line = %line, "skipping malformed line");
                rejected += 1;
            }
        }
    }

    Ok((accepted, rejected))
}

/// Implements `carbide info <file>`.
fn cmd_info(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let file = ArchiveFile::open(path)?;
    let size = std::fs::metadata(path)?.len();

    println!("Archive: {}", path.display());
    println!("  Size: {size} bytes");
    println!("  Aggregation: {}", file.method());
    println!("  X-files factor: {}", file.x_files_factor());
    println!("  Archives: {}", file.archives().len());

    for (i, info) in file.archives().iter().enumerate() {
        let live = file.fetch_archive(i)?;
        println!(
            "    Archive {i}: precision={}, points={}, retention={}, offset={}",
            format_seconds(u64::from(info.seconds_per_point)),
            info.points,
            format_seconds(info.retention()),
            info.offset,
        );
        match (live.first(), live.last()) {
            (Some(first), Some(last)) => println!(
                "      Live points: {} ({} .. {})",
                live.len(),
                first.timestamp,
                last.timestamp
            ),
            _ => println!("      Live points: 0"),
        }
    }

    Ok(())
}

/// Implements `carbide check --config <file>`.
fn cmd_check(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_file(path)?;
    let router = config.router()?;

    println!("{}", serde_json::to_string_pretty(&config)?);
    println!();
    println!(
        "OK: {} storage rule(s), {} aggregation rule(s), {} worker(s)",
        router.storage_rule_count(),
        router.aggregation_rule_count(),
        config.whisper.workers.max(1)
    );
    Ok(())
}

/// Formats seconds as a human-readable duration.
fn format_seconds(secs: u64) -> String {
    const UNITS: [(u64, &str); 5] = [
        (365 * 86_400, "y"),
        (7 * 86_400, "w"),
        (86_400, "d"),
        (3_600, "h"),
        (60, "m"),
    ];

    UNITS
        .iter()
        .find(|(unit, _)| secs >= *unit && secs.is_multiple_of(*unit))
        .map_or_else(|| format!("{secs}s"), |(unit, suffix)| format!("{}{suffix}", secs / unit))
}
