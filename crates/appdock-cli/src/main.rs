use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod completion;
mod config;
mod render;

use completion::{write_completions_script, CliCompletionShell};
use config::resolve_config;

const LOG_ENV: &str = "APPDOCK_LOG";

#[derive(Parser, Debug)]
#[command(name = "appdock")]
#[command(about = "Keeps hosted app packages installed and up to date", long_about = None)]
struct Cli {
    /// Directory holding `apps/` and `settings.json`.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the package server base URL.
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Commands {
    /// Install or upgrade an app and mark it loaded.
    Load { name: String },
    /// Restore the session, check for upgrades, then apply staged swaps.
    Sync,
    /// Like `sync`, but keep refreshing until interrupted.
    Run,
    Status,
    Unload { name: String },
    Activate { name: String },
    Remove { name: String },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        return write_completions_script(shell, &mut io::stdout());
    }

    init_tracing();
    let resolved = resolve_config(
        cli.root.as_deref(),
        cli.config.as_deref(),
        cli.base_url.as_deref(),
    )?;
    commands::run(cli.command, resolved).await
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}
