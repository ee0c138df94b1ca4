//! Plan phase: schema-constrained plan drafting plus the approval gate.
//!
//! Drafting asks the completion service for ordered steps (no code), then
//! validates the result structurally. Approval is a trait seam so the CLI
//! can prompt interactively while the bench harness and `--auto` runs
//! approve programmatically; either way the decision is recorded.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::phase::ApprovalMode;
use crate::core::plan::{Plan, Step, StepAction};
use crate::explore::ContextBundle;
use crate::io::completion::{Completion, CompletionError, CompletionRequest, complete_json};
use crate::io::config::{AgentConfig, TrustLevel};
use crate::io::manifest::Manifest;
use crate::io::prompt::{PLAN_SCHEMA, PromptEngine};

#[derive(Debug, Deserialize)]
struct PlanJson {
    steps: Vec<StepJson>,
}

#[derive(Debug, Deserialize)]
struct StepJson {
    description: String,
    action: StepAction,
    #[serde(default)]
    files: Vec<PathBuf>,
}

/// Outcome of the approval gate.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    Approved { plan: Plan, mode: ApprovalMode },
    Rejected { feedback: String },
}

/// Interactive seam for plan review.
pub trait Approver {
    /// Approve the plan, or reject it with feedback for the next attempt.
    fn review(&self, plan: &Plan) -> Result<PlanReview>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanReview {
    Approve,
    Reject { feedback: String },
}

/// Approves every plan; used under `trust = "auto"` and `--auto`.
pub struct AutoApprover;

impl Approver for AutoApprover {
    fn review(&self, _plan: &Plan) -> Result<PlanReview> {
        Ok(PlanReview::Approve)
    }
}

/// Prompts on the terminal: `y` approves, anything else rejects with the
/// typed text as feedback.
pub struct StdinApprover;

impl Approver for StdinApprover {
    fn review(&self, plan: &Plan) -> Result<PlanReview> {
        let mut out = std::io::stderr();
        writeln!(out, "\nProposed plan:")?;
        for (index, step) in plan.steps.iter().enumerate() {
            let files = step
                .files
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(out, "  {}. {} [{}]", index + 1, step.description, files)?;
        }
        write!(out, "Apply this plan? [y/N or feedback]: ")?;
        out.flush()?;

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        let answer = line.trim();
        if answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes") {
            return Ok(PlanReview::Approve);
        }
        let feedback = if answer.is_empty() || answer.eq_ignore_ascii_case("n") {
            "plan rejected by reviewer".to_string()
        } else {
            answer.to_string()
        };
        Ok(PlanReview::Reject { feedback })
    }
}

/// Draft a plan from the context bundle via the completion service.
///
/// Structural problems in the output (schema violations, overlapping step
/// files, escaping paths) surface as [`CompletionError::Malformed`] so the
/// task driver treats them like any other bad completion.
#[instrument(skip_all)]
pub fn draft_plan(
    completion: &dyn Completion,
    config: &AgentConfig,
    manifest: &Manifest,
    bundle: &ContextBundle,
    task_text: &str,
) -> Result<Plan, CompletionError> {
    let engine = PromptEngine::new(config.prompt_budget_bytes);
    let feedback = if bundle.feedback.is_empty() {
        None
    } else {
        Some(bundle.feedback.join("\n"))
    };
    let prompt = engine
        .render_plan(
            task_text,
            &manifest.project.kind,
            &manifest.verify.command.join(" "),
            &bundle.render(),
            feedback.as_deref(),
        )
        .map_err(|err| CompletionError::Malformed(format!("render plan prompt: {err}")))?;

    let request = CompletionRequest {
        prompt,
        timeout: Duration::from_secs(config.completion_timeout_secs),
        output_limit_bytes: config.output_limit_bytes,
    };
    let parsed: PlanJson =
        complete_json(completion, &request, PLAN_SCHEMA, config.completion_retries)?;

    let plan = Plan {
        steps: parsed
            .steps
            .into_iter()
            .map(|step| Step {
                description: step.description,
                action: step.action,
                files: step.files,
            })
            .collect(),
    };
    plan.validate()
        .map_err(|err| CompletionError::Malformed(format!("invalid plan: {err:#}")))?;
    debug!(steps = plan.steps.len(), "plan drafted");
    Ok(plan)
}

/// Run the approval gate for a drafted plan.
pub fn decide(plan: Plan, trust: TrustLevel, approver: &dyn Approver) -> Result<PlanDecision> {
    match trust {
        TrustLevel::Auto => Ok(PlanDecision::Approved {
            plan,
            mode: ApprovalMode::Auto,
        }),
        TrustLevel::Interactive => match approver.review(&plan)? {
            PlanReview::Approve => Ok(PlanDecision::Approved {
                plan,
                mode: ApprovalMode::Interactive,
            }),
            PlanReview::Reject { feedback } => Ok(PlanDecision::Rejected { feedback }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::manifest::Manifest;

    struct Scripted(String);

    impl Completion for Scripted {
        fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
            Ok(self.0.clone())
        }
    }

    struct RejectWith(&'static str);

    impl Approver for RejectWith {
        fn review(&self, _plan: &Plan) -> Result<PlanReview> {
            Ok(PlanReview::Reject {
                feedback: self.0.to_string(),
            })
        }
    }

    fn sample_plan() -> Plan {
        Plan {
            steps: vec![Step {
                description: "add logging".to_string(),
                action: StepAction::Modify,
                files: vec![PathBuf::from("src/x.rs")],
            }],
        }
    }

    #[test]
    fn drafts_and_validates_plan() {
        let completion = Scripted(
            r#"{"steps": [{"description": "add tracing to worker", "action": "modify", "files": ["src/worker.rs"]}]}"#
                .to_string(),
        );
        let plan = draft_plan(
            &completion,
            &AgentConfig::default(),
            &Manifest::default(),
            &ContextBundle::default(),
            "add logging to worker",
        )
        .expect("plan");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].files, vec![PathBuf::from("src/worker.rs")]);
    }

    #[test]
    fn overlapping_steps_are_malformed() {
        let completion = Scripted(
            r#"{"steps": [
                {"description": "one", "action": "modify", "files": ["src/x.rs"]},
                {"description": "two", "action": "modify", "files": ["src/x.rs"]}
            ]}"#
            .to_string(),
        );
        let err = draft_plan(
            &completion,
            &AgentConfig::default(),
            &Manifest::default(),
            &ContextBundle::default(),
            "task",
        )
        .expect_err("overlap");
        assert!(matches!(err, CompletionError::Malformed(_)));
    }

    #[test]
    fn schema_violation_is_malformed() {
        let completion = Scripted(r#"{"steps": []}"#.to_string());
        let err = draft_plan(
            &completion,
            &AgentConfig::default(),
            &Manifest::default(),
            &ContextBundle::default(),
            "task",
        )
        .expect_err("empty steps");
        assert!(matches!(err, CompletionError::Malformed(_)));
    }

    #[test]
    fn auto_trust_records_auto_mode() {
        let decision = decide(sample_plan(), TrustLevel::Auto, &RejectWith("unused")).expect("decide");
        match decision {
            PlanDecision::Approved { mode, .. } => assert_eq!(mode, ApprovalMode::Auto),
            other => panic!("expected approval, got {other:?}"),
        }
    }

    #[test]
    fn interactive_rejection_carries_feedback() {
        let decision = decide(
            sample_plan(),
            TrustLevel::Interactive,
            &RejectWith("touch only the parser"),
        )
        .expect("decide");
        assert_eq!(
            decision,
            PlanDecision::Rejected {
                feedback: "touch only the parser".to_string()
            }
        );
    }
}
