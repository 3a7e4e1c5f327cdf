//! Command-line front end: loads a peer config, starts the client core,
//! and runs a line-oriented `/command` REPL against it.

mod repl;
mod rendezvous_check;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerline", about = "Peer-to-peer chat mesh client")]
struct Cli {
    /// Path to the peer's TOML config file.
    #[arg(long, short = 'c', env = "PEERLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Fires a batch of recorded requests at a rendezvous server and
    /// checks the responses against expectations in a JSON test file.
    RendezvousCheck {
        /// JSON array of test cases (see `rendezvous_check` module docs).
        file: PathBuf,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 5000)]
        port: u16,
        #[arg(long, default_value_t = 5.0)]
        timeout: f64,
        #[arg(long, default_value_t = 0.0)]
        delay: f64,
    },
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peerline")
        .join("peerline.toml")
}

fn init_logging() {
    let json_logs = std::env::var("PEERLINE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("peerline=info".parse().unwrap());
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    if let Some(Command::RendezvousCheck { file, host, port, timeout, delay }) = cli.command {
        return rendezvous_check::run(&file, &host, port, timeout, delay).await;
    }

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = peerline_core::Config::from_file(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    repl::run(config).await
}
