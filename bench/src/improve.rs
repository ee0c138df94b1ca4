//! Self-improvement loop: SelectWeakness → RunTaskPipeline(target=self) →
//! Score → AcceptOrRollback.
//!
//! The loop is an ordinary client of the agent pipeline: the "self" case is
//! just a task whose target repository is the agent's own tree. Scoring
//! re-runs the fixed suite, so before/after aggregates are comparable by
//! construction. Every retry path is bounded; a weakness that keeps
//! failing is parked as needs-human-review instead of looping forever.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use agent::context::AgentContext;
use agent::io::completion::Completion;
use agent::io::diff::{self, AppliedPatch};
use agent::io::vcs::Vcs;
use agent::planning::Approver;
use agent::task::{TaskOutcome, run_task};
use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::results::{BenchmarkResult, append_history};
use crate::suite::run_suite;

/// Fixed tie-break order for weakness selection; categories not listed
/// rank after these, alphabetically.
pub const CATEGORY_PRIORITY: &[&str] = &["intent", "planning", "editing", "verify"];

/// Attempts per weakness before it is parked for human review.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct ImproveOptions {
    pub cycles: u32,
    pub max_attempts: u32,
}

impl Default for ImproveOptions {
    fn default() -> Self {
        Self {
            cycles: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// New aggregate >= old aggregate; the change was kept and committed.
    Accepted,
    /// Regression; every cycle patch was reverted in reverse order.
    Rolledback,
    /// The pipeline did not produce a change (failed, clarified, or out of
    /// scope); nothing to score.
    AttemptFailed,
    /// The weakness hit its attempt limit and was parked.
    NeedsHumanReview,
    /// Every category already scores 1.0.
    NothingToImprove,
}

/// Record of one improvement cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u32,
    pub category: Option<String>,
    pub before_aggregate: f64,
    pub after_aggregate: Option<f64>,
    pub outcome: CycleOutcome,
}

/// Pick the weakest category: lowest score first, ties broken by the fixed
/// priority order. Parked categories are skipped.
pub fn select_weakness(result: &BenchmarkResult, parked: &BTreeSet<String>) -> Option<String> {
    result
        .categories
        .iter()
        .filter(|(category, score)| score.score < 1.0 && !parked.contains(*category))
        .min_by(|(a_name, a), (b_name, b)| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| priority_index(a_name).cmp(&priority_index(b_name)))
                .then_with(|| a_name.cmp(b_name))
        })
        .map(|(category, _)| category.clone())
}

fn priority_index(category: &str) -> usize {
    CATEGORY_PRIORITY
        .iter()
        .position(|c| c == &category)
        .unwrap_or(CATEGORY_PRIORITY.len())
}

/// Revert applied patches in reverse application order.
pub fn rollback_patches(root: &Path, log: &[AppliedPatch]) -> Result<()> {
    for patch in log.iter().rev() {
        diff::revert(root, patch)?;
    }
    Ok(())
}

fn synthesize_request(category: &str, result: &BenchmarkResult) -> String {
    let failing: Vec<String> = result
        .failing_tests(category)
        .iter()
        .map(|test| test.id.clone())
        .collect();
    format!(
        "implement improvements in the {category} handling so the failing benchmark cases pass: {}",
        failing.join(", ")
    )
}

/// Run up to `options.cycles` improvement cycles against `ctx`'s repository.
#[instrument(skip_all, fields(cycles = options.cycles))]
pub fn run_improvement(
    ctx: &AgentContext,
    completion: &dyn Completion,
    approver: &dyn Approver,
    cases_dir: &Path,
    workspaces_dir: &Path,
    options: ImproveOptions,
) -> Result<Vec<CycleReport>> {
    let root = ctx.root();
    let mut attempts: BTreeMap<String, u32> = BTreeMap::new();
    let mut parked: BTreeSet<String> = BTreeSet::new();
    let mut reports = Vec::new();

    for cycle in 1..=options.cycles {
        let before = run_suite(cases_dir, workspaces_dir, None)?;
        append_history(root, &before)?;

        let Some(category) = select_weakness(&before, &parked) else {
            info!(cycle, "no improvable category remains");
            reports.push(CycleReport {
                cycle,
                category: None,
                before_aggregate: before.aggregate,
                after_aggregate: None,
                outcome: CycleOutcome::NothingToImprove,
            });
            break;
        };
        info!(cycle, category = %category, score = before.categories[&category].score, "weakness selected");

        let request = synthesize_request(&category, &before);
        let outcome = run_task(ctx, completion, approver, &request, None)?;

        let report = match outcome {
            TaskOutcome::Completed(task_report) => {
                let after = run_suite(cases_dir, workspaces_dir, Some(task_report.task_id.clone()))?;
                append_history(root, &after)?;

                if after.aggregate >= before.aggregate {
                    info!(
                        before = before.aggregate,
                        after = after.aggregate,
                        "improvement accepted"
                    );
                    CycleReport {
                        cycle,
                        category: Some(category.clone()),
                        before_aggregate: before.aggregate,
                        after_aggregate: Some(after.aggregate),
                        outcome: CycleOutcome::Accepted,
                    }
                } else {
                    warn!(
                        before = before.aggregate,
                        after = after.aggregate,
                        "benchmark regression, rolling back"
                    );
                    rollback_patches(root, &task_report.rollback_log)?;
                    commit_rollback(root, &category);
                    let failed_attempts = bump_attempts(&mut attempts, &category);
                    let outcome = park_if_exhausted(
                        &mut parked,
                        &category,
                        failed_attempts,
                        options.max_attempts,
                        CycleOutcome::Rolledback,
                    );
                    CycleReport {
                        cycle,
                        category: Some(category.clone()),
                        before_aggregate: before.aggregate,
                        after_aggregate: Some(after.aggregate),
                        outcome,
                    }
                }
            }
            other => {
                warn!(cycle, "improvement pipeline produced no change: {other:?}");
                // A failed task may have left flagged patches; the
                // self-improvement loop always restores its target.
                if let TaskOutcome::Failed(task_report) = &other {
                    rollback_patches(root, &task_report.rollback_log)?;
                    commit_rollback(root, &category);
                }
                let failed_attempts = bump_attempts(&mut attempts, &category);
                let outcome = park_if_exhausted(
                    &mut parked,
                    &category,
                    failed_attempts,
                    options.max_attempts,
                    CycleOutcome::AttemptFailed,
                );
                CycleReport {
                    cycle,
                    category: Some(category.clone()),
                    before_aggregate: before.aggregate,
                    after_aggregate: None,
                    outcome,
                }
            }
        };
        reports.push(report);
    }

    Ok(reports)
}

fn bump_attempts(attempts: &mut BTreeMap<String, u32>, category: &str) -> u32 {
    let count = attempts.entry(category.to_string()).or_insert(0);
    *count += 1;
    *count
}

fn park_if_exhausted(
    parked: &mut BTreeSet<String>,
    category: &str,
    failed_attempts: u32,
    max_attempts: u32,
    otherwise: CycleOutcome,
) -> CycleOutcome {
    if failed_attempts >= max_attempts {
        warn!(category, failed_attempts, "weakness parked for human review");
        parked.insert(category.to_string());
        CycleOutcome::NeedsHumanReview
    } else {
        otherwise
    }
}

fn commit_rollback(root: &Path, category: &str) {
    let vcs = Vcs::new(root);
    if !vcs.is_repo() {
        return;
    }
    let message = format!("bench: revert regressing {category} change");
    if let Err(err) = vcs.add_all().and_then(|()| vcs.commit_staged(&message)) {
        warn!(err = %err, "rollback commit failed");
    }
}
