//! CLI command implementations.

use std::path::Path;
use std::process::ExitCode;

use agent::context::AgentContext;
use agent::io::completion::CommandCompletion;
use agent::io::config::TrustLevel;
use agent::planning::{Approver, AutoApprover, StdinApprover};
use anyhow::{Context, Result};
use tracing::info;

use crate::case::discover_cases;
use crate::improve::{ImproveOptions, run_improvement};
use crate::results::{append_history, read_history};
use crate::suite::run_suite;

fn cases_dir(repo_root: &Path) -> std::path::PathBuf {
    repo_root.join("bench").join("cases")
}

fn workspaces_dir(repo_root: &Path) -> std::path::PathBuf {
    repo_root.join("bench").join("workspaces")
}

/// List all benchmark cases.
pub fn list_cases(repo_root: &Path) -> Result<()> {
    let cases = discover_cases(&cases_dir(repo_root))?;
    for case in cases {
        println!("{} ({})", case.case.id, case.case.category);
    }
    Ok(())
}

/// Run the suite, print per-category scores, append to history.
///
/// Exit code reflects the pass threshold.
pub fn run_suite_cmd(repo_root: &Path, threshold: f64) -> Result<ExitCode> {
    let result = run_suite(&cases_dir(repo_root), &workspaces_dir(repo_root), None)
        .context("run suite")?;
    append_history(repo_root, &result).context("append history")?;

    for (category, score) in &result.categories {
        println!(
            "category {category}: {:.2} ({}/{})",
            score.score, score.passed, score.total
        );
    }
    for test in result.tests.iter().filter(|t| !t.passed) {
        println!("failed {}: {}", test.id, test.detail);
    }
    println!("aggregate: {:.3} (threshold {threshold:.3})", result.aggregate);

    if result.aggregate >= threshold {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Run the self-improvement loop against this repository.
pub fn improve_cmd(repo_root: &Path, auto: bool, cycles: u32) -> Result<()> {
    let mut ctx = AgentContext::initialize(repo_root)?;
    if auto {
        ctx.config.trust = TrustLevel::Auto;
    }
    let completion = CommandCompletion::new(ctx.config.completion.command.clone());
    let approver: Box<dyn Approver> = match ctx.config.trust {
        TrustLevel::Auto => Box::new(AutoApprover),
        TrustLevel::Interactive => Box::new(StdinApprover),
    };

    info!(cycles, auto, "self-improvement started");
    let reports = run_improvement(
        &ctx,
        &completion,
        approver.as_ref(),
        &cases_dir(repo_root),
        &workspaces_dir(repo_root),
        ImproveOptions {
            cycles,
            ..ImproveOptions::default()
        },
    )?;

    for report in &reports {
        let category = report.category.as_deref().unwrap_or("-");
        let after = report
            .after_aggregate
            .map(|a| format!("{a:.3}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "cycle {}: category={} before={:.3} after={} outcome={:?}",
            report.cycle, category, report.before_aggregate, after, report.outcome
        );
    }
    Ok(())
}

/// Remove accumulated case workspaces.
pub fn clean_cmd(repo_root: &Path) -> Result<()> {
    let dir = workspaces_dir(repo_root);
    if dir.exists() {
        std::fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
    }
    println!("clean: {}", dir.display());
    Ok(())
}

/// Summarize the benchmark history log.
pub fn report_cmd(repo_root: &Path) -> Result<()> {
    let history = read_history(repo_root)?;
    if history.is_empty() {
        println!("no benchmark history");
        return Ok(());
    }
    println!("runs: {}", history.len());
    let latest = history.last().expect("non-empty history");
    println!("latest: {} aggregate={:.3}", latest.timestamp, latest.aggregate);
    for (category, score) in &latest.categories {
        println!(
            "  {category}: {:.2} ({}/{})",
            score.score, score.passed, score.total
        );
    }
    if history.len() >= 2 {
        let previous = &history[history.len() - 2];
        let delta = latest.aggregate - previous.aggregate;
        println!("delta vs previous: {delta:+.3}");
    }
    Ok(())
}
