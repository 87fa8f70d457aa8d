mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use commands::serve::ServeArgs;

// ============================================================================
// CLI Types
// ============================================================================

/// tfmux - share long-lived terminal sessions with many remote viewers
#[derive(Parser, Debug)]
#[command(version = tfmux::build_info::VERSION, about, long_about = None)]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. "debug" or "tfmux=trace"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server and the configured sessions
    Serve(ServeArgs),

    /// List the signals accepted by --signal
    Signals,
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(cli.command).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::Signals => {
            commands::signals::run();
            Ok(())
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
