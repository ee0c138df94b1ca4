mod case;
mod cli;
mod improve;
mod judge;
mod replay;
mod results;
mod suite;
mod workspace;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bench", version, about = "Benchmark suite and self-improvement loop")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all benchmark cases.
    List,
    /// Run the scored suite and append the result to the history log.
    Run {
        /// Aggregate score required for a passing exit code.
        #[arg(long, default_value_t = 0.8)]
        threshold: f64,
    },
    /// Run the self-improvement loop against this repository.
    Improve {
        /// Approve plans automatically instead of prompting.
        #[arg(long)]
        auto: bool,
        /// Maximum improvement cycles to run.
        #[arg(long, default_value_t = 1)]
        cycles: u32,
    },
    /// Summarize the benchmark history log.
    Report,
    /// Remove accumulated case workspaces.
    Clean,
}

fn main() -> Result<std::process::ExitCode> {
    init_logging();
    let cli = Cli::parse();
    let repo_root = std::env::current_dir()?;
    match cli.command {
        Command::List => cli::list_cases(&repo_root).map(|()| std::process::ExitCode::SUCCESS),
        Command::Run { threshold } => cli::run_suite_cmd(&repo_root, threshold),
        Command::Improve { auto, cycles } => {
            cli::improve_cmd(&repo_root, auto, cycles).map(|()| std::process::ExitCode::SUCCESS)
        }
        Command::Report => cli::report_cmd(&repo_root).map(|()| std::process::ExitCode::SUCCESS),
        Command::Clean => cli::clean_cmd(&repo_root).map(|()| std::process::ExitCode::SUCCESS),
    }
}

/// Dev diagnostics via `RUST_LOG`, stderr only. Suite results go to the
/// history log regardless of the filter.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
