//! Autonomous coding-agent CLI.
//!
//! `agent run <request>` drives one task through the classify →
//! explore/plan/apply/verify pipeline against the current directory.
//! `agent init` detects the project and writes `agent.toml` plus default
//! configuration.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use agent::context::AgentContext;
use agent::exit_codes;
use agent::io::completion::CommandCompletion;
use agent::io::config::{AgentConfig, TrustLevel, load_config, write_config};
use agent::io::lock::LockError;
use agent::io::manifest::{MANIFEST_FILE, detect_manifest, write_manifest};
use agent::planning::{Approver, AutoApprover, StdinApprover};
use agent::task::{TaskOutcome, run_task};

#[derive(Parser)]
#[command(name = "agent", version, about = "Autonomous coding-agent pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive one request through the pipeline against the current directory.
    Run {
        /// The request text.
        request: Vec<String>,
        /// Approve plans automatically instead of prompting.
        #[arg(long)]
        auto: bool,
    },
    /// Detect the project and write `agent.toml` and `.agent/config.toml`.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    agent::logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            if err.downcast_ref::<LockError>().is_some() {
                eprintln!("{err:#}");
                return ExitCode::from(exit_codes::BUSY as u8);
            }
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::ERROR as u8)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Run { request, auto } => {
            let request = request.join(" ");
            if request.trim().is_empty() {
                eprintln!("usage: agent run <request>");
                return Ok(ExitCode::from(exit_codes::ERROR as u8));
            }

            let mut ctx = AgentContext::initialize(&root)?;
            if auto {
                ctx.config.trust = TrustLevel::Auto;
            }
            let completion = CommandCompletion::new(ctx.config.completion.command.clone());
            let approver: Box<dyn Approver> = match ctx.config.trust {
                TrustLevel::Auto => Box::new(AutoApprover),
                TrustLevel::Interactive => Box::new(StdinApprover),
            };

            let outcome = run_task(&ctx, &completion, approver.as_ref(), &request, None)?;
            Ok(report_outcome(outcome))
        }
        Command::Init { force } => {
            let manifest_path = root.join(MANIFEST_FILE);
            if force || !manifest_path.exists() {
                let manifest = detect_manifest(&root);
                write_manifest(&root, &manifest)?;
                println!(
                    "wrote {} (kind: {}, verify: {})",
                    manifest_path.display(),
                    manifest.project.kind,
                    manifest.verify.command.join(" ")
                );
            } else {
                println!("{} already exists", manifest_path.display());
            }

            let config_path = root.join(".agent").join("config.toml");
            if force || !config_path.exists() {
                let config = load_config(&config_path).unwrap_or_default();
                write_config(&config_path, &config)?;
                println!("wrote {}", config_path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report_outcome(outcome: TaskOutcome) -> ExitCode {
    match outcome {
        TaskOutcome::Completed(report) => {
            println!("completed: {} ({} phases)", report.task_id, report.records.len());
            if !report.rollback_log.is_empty() {
                println!("applied {} patches", report.rollback_log.len());
            }
            ExitCode::from(exit_codes::COMPLETED as u8)
        }
        TaskOutcome::Clarify { question } => {
            println!("clarification needed: {question}");
            ExitCode::from(exit_codes::CLARIFY as u8)
        }
        TaskOutcome::OutOfScope {
            classification,
            candidates,
        } => {
            println!(
                "request classified as '{}' (confidence {:.2}); not a code task",
                classification.intent.as_str(),
                classification.confidence
            );
            for candidate in candidates {
                println!("  {candidate}");
            }
            ExitCode::from(exit_codes::COMPLETED as u8)
        }
        TaskOutcome::Failed(report) => {
            if let Some(failure) = &report.failure {
                eprintln!(
                    "failed in {} phase ({}): {}",
                    failure.phase.as_str(),
                    failure.error_kind,
                    failure.message
                );
                if let Some(call) = &failure.last_tool_call {
                    eprintln!("last tool call: {} -> {}", call.kind, call.outcome);
                }
                eprintln!("suggestion: {}", failure.suggestion);
            }
            eprintln!("report: .agent/tasks/{}/report.json", report.task_id);
            ExitCode::from(exit_codes::FAILED as u8)
        }
    }
}
