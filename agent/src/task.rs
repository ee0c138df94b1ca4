//! Task driver: one request through Explore → Plan → Apply → Verify.
//!
//! The driver owns the repository lock, the bounded Verify→Plan retry
//! loop, phase records, the rollback log, and the experience cache
//! consult/record. Terminal outcomes are values; the full phase history is
//! persisted under `.agent/tasks/<id>/report.json` whether the task
//! completed or failed.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::apply::{StepFailureKind, apply_plan};
use crate::classify::classify;
use crate::context::AgentContext;
use crate::core::fingerprint::fingerprint;
use crate::core::intent::{Classification, Intent, complexity};
use crate::core::phase::{ApprovalMode, Phase, PhaseRecord, ToolCallRecord};
use crate::core::plan::Plan;
use crate::explore::{ContextBundle, DEFAULT_MAX_FILES, NoRelevantFiles, explore, rank_candidates};
use crate::io::completion::Completion;
use crate::io::diff::AppliedPatch;
use crate::io::experience::{CachedOutcome, ExperienceEntry};
use crate::io::lock::RepoLock;
use crate::io::manifest::{load_manifest, load_or_rebuild_index};
use crate::io::tools::{ToolExecutor, ToolParams};
use crate::planning::{Approver, PlanDecision, decide, draft_plan};
use crate::verify::verify;

/// User-visible failure context: what failed, where, and what to do next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub phase: Phase,
    pub error_kind: String,
    pub message: String,
    pub last_tool_call: Option<ToolCallRecord>,
    pub suggestion: String,
}

/// Durable record of one task run.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub request: String,
    pub classification: Classification,
    pub complexity: u32,
    /// Terminal phase: `Completed` or `Failed`.
    pub phase: Phase,
    pub records: Vec<PhaseRecord>,
    /// Inverse diffs of every patch still applied, newest last. On failure
    /// these are flagged for manual follow-up, not auto-reverted.
    pub rollback_log: Vec<AppliedPatch>,
    pub failure: Option<FailureReport>,
}

/// Terminal outcome of driving one request.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed(TaskReport),
    /// The request needs clarification before any phase can run.
    Clarify { question: String },
    /// Classified as something the code pipeline does not handle; for
    /// locate requests the ranked candidates are included.
    OutOfScope {
        classification: Classification,
        candidates: Vec<String>,
    },
    Failed(TaskReport),
}

/// Drive one request through the pipeline.
///
/// Locks the repository for the whole task; a held lock surfaces as
/// [`crate::io::lock::LockError::Busy`] in the error chain.
#[instrument(skip_all, fields(root = %ctx.root().display()))]
pub fn run_task(
    ctx: &AgentContext,
    completion: &dyn Completion,
    approver: &dyn Approver,
    request: &str,
    recent_context: Option<&str>,
) -> Result<TaskOutcome> {
    let config = &ctx.config;
    let root = ctx.root();

    let classification = classify(request, recent_context, completion, config);
    if classification.intent == Intent::Clarify {
        let question = classification
            .clarifying_question
            .clone()
            .unwrap_or_else(|| "Could you restate the request more concretely?".to_string());
        info!("request needs clarification");
        return Ok(TaskOutcome::Clarify { question });
    }

    let manifest = load_manifest(root)?;
    let index = load_or_rebuild_index(root, &manifest)?;

    if classification.intent != Intent::CodeTask {
        let candidates = if classification.intent == Intent::Locate {
            rank_candidates(&index, request)
                .into_iter()
                .take(DEFAULT_MAX_FILES)
                .map(|(entry, _)| entry.path.display().to_string())
                .collect()
        } else {
            Vec::new()
        };
        info!(intent = classification.intent.as_str(), "request is not a code task");
        return Ok(TaskOutcome::OutOfScope {
            classification,
            candidates,
        });
    }

    let lock = RepoLock::acquire(root, Duration::from_secs(config.lock_timeout_secs))
        .map_err(anyhow::Error::new)?;

    let task_id = format!("task-{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let mut tools = ToolExecutor::new(
        root,
        Duration::from_secs(config.command_timeout_secs),
        config.output_limit_bytes,
        manifest.paths.ignore.clone(),
    );

    let mut report = TaskReport {
        task_id: task_id.clone(),
        request: request.to_string(),
        classification,
        complexity: complexity(request),
        phase: Phase::Explore,
        records: Vec::new(),
        rollback_log: Vec::new(),
        failure: None,
    };

    // --- Explore -------------------------------------------------------
    let mut record = PhaseRecord::start(Phase::Explore, 0, request.to_string());
    let mut bundle = match explore(request, &index, &mut tools, DEFAULT_MAX_FILES) {
        Ok(bundle) => {
            record.finish(
                format!("selected {} files", bundle.files.len()),
                tools.drain_log(),
            );
            report.records.push(record);
            bundle
        }
        Err(err) => {
            record.finish(format!("explore failed: {err:#}"), tools.drain_log());
            report.records.push(record);
            if err.downcast_ref::<NoRelevantFiles>().is_some() {
                lock.release();
                return Ok(TaskOutcome::Clarify {
                    question: format!(
                        "I couldn't find any files related to \"{}\". Which file or module should I look at?",
                        request.trim()
                    ),
                });
            }
            return Err(err);
        }
    };

    // --- Experience cache ---------------------------------------------
    let cache_key = fingerprint(request, &bundle.file_hashes);
    let mut cached_plan: Option<Plan> = None;
    if let Some(entry) = ctx.experience.lookup(&cache_key, root)?
        && entry.outcome == CachedOutcome::Success
    {
        // A prior success short-circuits Plan; Apply and Verify always
        // re-run against current repository state.
        info!("experience cache hit, reusing prior plan");
        cached_plan = Some(entry.plan);
    }

    // --- Plan / Apply / Verify with bounded retries --------------------
    let mut attempt: u32 = 0;
    let mut reexplore = false;
    let outcome = loop {
        // Durable progress marker: an interrupted multi-step task leaves
        // committed steps plus this resumable record, never a half-written
        // file (patch writes themselves are atomic).
        write_report(root, &report)?;

        if reexplore {
            reexplore = false;
            let mut record = PhaseRecord::start(Phase::Explore, attempt, request.to_string());
            match explore(request, &index, &mut tools, DEFAULT_MAX_FILES) {
                Ok(mut fresh) => {
                    fresh.feedback = bundle.feedback.clone();
                    record.finish(
                        format!("reselected {} files", fresh.files.len()),
                        tools.drain_log(),
                    );
                    report.records.push(record);
                    bundle = fresh;
                }
                Err(err) => {
                    // Keep the previous bundle; planning can still proceed.
                    record.finish(format!("re-explore failed: {err:#}"), tools.drain_log());
                    report.records.push(record);
                }
            }
        }

        // Plan.
        let mut record = PhaseRecord::start(
            Phase::Plan,
            attempt,
            format!("{} files in context", bundle.files.len()),
        );
        let plan = match cached_plan.take() {
            Some(plan) => {
                record.finish(
                    format!(
                        "reused cached plan ({} steps); approval: {:?}",
                        plan.steps.len(),
                        ApprovalMode::Auto
                    ),
                    tools.drain_log(),
                );
                report.records.push(record);
                plan
            }
            None => match draft_plan(completion, config, &manifest, &bundle, request) {
                Ok(drafted) => match decide(drafted, config.trust, approver)? {
                    PlanDecision::Approved { plan, mode } => {
                        record.finish(
                            format!("approved {} steps; approval: {mode:?}", plan.steps.len()),
                            tools.drain_log(),
                        );
                        report.records.push(record);
                        plan
                    }
                    PlanDecision::Rejected { feedback } => {
                        record.finish(format!("rejected: {feedback}"), tools.drain_log());
                        report.records.push(record);
                        bundle.feedback.push(format!("plan rejected: {feedback}"));
                        attempt += 1;
                        if attempt > config.retry_budget {
                            break exhausted(&mut report, Phase::Plan, "plan approval");
                        }
                        reexplore = true;
                        continue;
                    }
                },
                Err(err) => {
                    record.finish(format!("plan failed: {err}"), tools.drain_log());
                    report.records.push(record);
                    bundle.feedback.push(format!("previous plan attempt failed: {err}"));
                    attempt += 1;
                    if attempt > config.retry_budget {
                        break exhausted(&mut report, Phase::Plan, "plan drafting");
                    }
                    continue;
                }
            },
        };

        // Apply.
        let mut record = PhaseRecord::start(Phase::Apply, attempt, format!("{} steps", plan.steps.len()));
        match apply_plan(completion, config, &mut tools, request, &plan) {
            Ok(applied) => {
                record.finish(applied.summary.clone(), tools.drain_log());
                report.records.push(record);
                report.rollback_log.extend(applied.applied.clone());

                // Verify.
                let mut record = PhaseRecord::start(
                    Phase::Verify,
                    attempt,
                    manifest.verify.command.join(" "),
                );
                let verdict = verify(
                    completion,
                    config,
                    &mut tools,
                    &manifest,
                    request,
                    &applied.summary,
                );
                record.finish(clip(&verdict.detail, 4_000), tools.drain_log());
                report.records.push(record);

                if verdict.passed {
                    break complete(ctx, &mut tools, &mut report, request, &cache_key, &bundle, &plan)?;
                }

                bundle
                    .feedback
                    .push(format!("verification failed:\n{}", clip(&verdict.detail, 2_000)));
                attempt += 1;
                if attempt > config.retry_budget {
                    break exhausted(&mut report, Phase::Verify, "verification");
                }
                debug!(attempt, "verification failed, returning to plan");
            }
            Err(failure) => {
                record.finish(failure.to_string(), tools.drain_log());
                report.records.push(record);
                bundle.feedback.push(format!("apply failed: {failure}"));
                if let StepFailureKind::Conflict { path } = &failure.kind {
                    // External drift; the next attempt re-reads the tree.
                    warn!(path = %path.display(), "patch conflict, re-exploring");
                    reexplore = true;
                }
                attempt += 1;
                if attempt > config.retry_budget {
                    break exhausted(&mut report, Phase::Apply, "apply");
                }
            }
        }
    };

    write_report(root, &report)?;
    lock.release();

    Ok(match outcome {
        LoopEnd::Completed => TaskOutcome::Completed(report),
        LoopEnd::Failed => {
            ctx.experience
                .record(ExperienceEntry {
                    fingerprint: cache_key,
                    plan: Plan { steps: Vec::new() },
                    outcome: CachedOutcome::Failure,
                    file_hashes: bundle.file_hashes.clone(),
                    recorded_at_epoch_secs: epoch_now(),
                    ttl_secs: ctx.config.cache_ttl_secs,
                })
                .unwrap_or_else(|err| warn!(err = %err, "failed to record experience"));
            TaskOutcome::Failed(report)
        }
    })
}

enum LoopEnd {
    Completed,
    Failed,
}

fn complete(
    ctx: &AgentContext,
    tools: &mut ToolExecutor,
    report: &mut TaskReport,
    request: &str,
    print: &str,
    bundle: &ContextBundle,
    plan: &Plan,
) -> Result<LoopEnd> {
    report.phase = Phase::Completed;

    let message = format!("agent: {}", clip(request, 60));
    if let Err(err) = tools.execute(&ToolParams::VcsCommit { message }) {
        // Committing the verified change is best-effort; the task itself
        // succeeded and the report still carries the rollback log.
        warn!(err = %err, "vcs commit failed");
    }
    if let Some(last) = report.records.last_mut() {
        last.tool_calls.extend(tools.drain_log());
    }

    ctx.experience.record(ExperienceEntry {
        fingerprint: print.to_string(),
        plan: plan.clone(),
        outcome: CachedOutcome::Success,
        file_hashes: bundle.file_hashes.clone(),
        recorded_at_epoch_secs: epoch_now(),
        ttl_secs: ctx.config.cache_ttl_secs,
    })?;
    info!("task completed");
    Ok(LoopEnd::Completed)
}

fn exhausted(report: &mut TaskReport, phase: Phase, what: &str) -> LoopEnd {
    report.phase = Phase::Failed;
    let last_tool_call = report
        .records
        .iter()
        .rev()
        .flat_map(|record| record.tool_calls.iter().rev())
        .next()
        .cloned();
    report.failure = Some(FailureReport {
        phase,
        error_kind: "retry_budget_exhausted".to_string(),
        message: format!("retry budget exhausted during {what}"),
        last_tool_call,
        suggestion: if report.rollback_log.is_empty() {
            "re-run with a more specific request".to_string()
        } else {
            "applied patches were left in place; review them manually or revert via the rollback log"
                .to_string()
        },
    });
    warn!(what, "retry budget exhausted");
    LoopEnd::Failed
}

/// Persist the task report under `.agent/tasks/<id>/report.json`.
pub fn write_report(root: &Path, report: &TaskReport) -> Result<()> {
    let dir = root.join(".agent").join("tasks").join(&report.task_id);
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let mut buf = serde_json::to_string_pretty(report).context("serialize task report")?;
    buf.push('\n');
    let path = dir.join("report.json");
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

fn epoch_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
