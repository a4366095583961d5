//! blocksync: block-level file synchronization client
//!
//! Each `sync` invocation performs exactly one reconciliation pass against
//! the coordinator and terminates; convergence comes from every client
//! running at least once after the last edit.

mod config;

use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use tracing::{info, warn};

use blocksync_core::{Scanner, SyncEngine};
use blocksync_transport::TcpCoordinator;

use crate::config::SyncConfig;

const DEFAULT_BLOCK_SIZE: u32 = 4096;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "blocksync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Block-level file sync against a central coordinator")]
#[command(long_about = r#"
blocksync reconciles a local directory against a central server.

Each sync run is a single pass:
  • local changes are chunked, deduplicated and uploaded
  • a stale edit loses its version race and adopts the winner
  • server-side changes are downloaded, deletions included

Examples:
  blocksync sync ./dir --server 127.0.0.1:9090    One reconciliation pass
  blocksync scan ./dir                            Inspect local hash lists
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass against the coordinator
    Sync {
        /// Local base directory
        dir: PathBuf,

        /// Coordinator address (falls back to .blocksync.toml)
        #[arg(short, long)]
        server: Option<String>,

        /// Block size in bytes; must match the server's
        #[arg(short, long)]
        block_size: Option<u32>,
    },

    /// Scan a directory and print its block hash lists
    Scan {
        /// Directory to scan
        path: PathBuf,

        /// Block size in bytes
        #[arg(short, long)]
        block_size: Option<u32>,

        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },

    /// Show version info
    Version,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Version => {
            eprintln!("blocksync {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Sync {
            dir,
            server,
            block_size,
        } => {
            sync_command(&dir, server, block_size)?;
        }
        Commands::Scan {
            path,
            block_size,
            format,
        } => {
            scan_command(&path, block_size, &format)?;
        }
    }

    Ok(())
}

fn sync_command(dir: &PathBuf, server: Option<String>, block_size: Option<u32>) -> Result<()> {
    let config = SyncConfig::load(dir)?;
    let (server, block_size) = resolve_settings(server, block_size, &config)?;

    info!(
        "Syncing {} against {server} (block size {block_size})",
        dir.display()
    );

    let mut coordinator = TcpCoordinator::connect(server.as_str())?;
    let mut engine = SyncEngine::new(&mut coordinator, dir, block_size);
    let summary = engine.run()?;

    info!(
        "Pass complete: {} uploaded, {} downloaded, {} removed, {} unchanged",
        summary.uploaded, summary.downloaded, summary.removed, summary.unchanged
    );

    if !summary.is_clean() {
        for (name, err) in &summary.failed {
            warn!("{name}: {err}");
        }
        color_eyre::eyre::bail!(
            "{} file(s) failed this pass; re-run to retry",
            summary.failed.len()
        );
    }

    Ok(())
}

fn scan_command(path: &PathBuf, block_size: Option<u32>, format: &str) -> Result<()> {
    let config = SyncConfig::load(path)?;
    let block_size = block_size
        .or(config.block_size)
        .unwrap_or(DEFAULT_BLOCK_SIZE);

    let scanner = Scanner::new(path, block_size);
    let entries = scanner.scan()?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&entries)?;
            eprintln!("{json}");
        }
        _ => {
            eprintln!("Files: {}", entries.len());
            let total_size: u64 = entries.iter().map(|f| f.size).sum();
            eprintln!("Total size: {total_size} bytes");

            for entry in &entries {
                eprintln!(
                    "  {} ({} bytes, {} block(s))",
                    entry.name,
                    entry.size,
                    entry.hash_list.len()
                );
            }
        }
    }

    Ok(())
}

/// Merge CLI flags with per-directory config: flags win, the server address
/// is required from one of the two.
fn resolve_settings(
    server: Option<String>,
    block_size: Option<u32>,
    config: &SyncConfig,
) -> Result<(String, u32)> {
    let server = server
        .or_else(|| config.server.clone())
        .ok_or_else(|| {
            color_eyre::eyre::eyre!(
                "no coordinator address: pass --server or set `server` in .blocksync.toml"
            )
        })?;

    let block_size = block_size
        .or(config.block_size)
        .unwrap_or(DEFAULT_BLOCK_SIZE);
    if block_size == 0 {
        color_eyre::eyre::bail!("block size must be positive");
    }

    Ok((server, block_size))
}
