//! Coordinator server binary

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use blocksync_server::{serve, ServerState};

#[derive(Parser)]
#[command(name = "blocksync-server")]
#[command(version)]
#[command(about = "Coordinator server for blocksync file synchronization")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve blocks and metadata over TCP
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:9090")]
        addr: String,

        /// Block size in bytes, shared by all participants
        #[arg(short, long, default_value = "4096")]
        block_size: u32,

        /// Directory for the durable block and metadata stores
        #[arg(short, long)]
        data_dir: PathBuf,
    },
    /// Print version and exit
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
            eprintln!("blocksync-server {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Serve {
            addr,
            block_size,
            data_dir,
        } => {
            let state = ServerState::open(&data_dir, block_size)?;
            let listener = TcpListener::bind(&addr)?;
            serve(listener, Arc::new(state))?;
        }
    }

    Ok(())
}
