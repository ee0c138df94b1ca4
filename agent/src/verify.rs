//! Verify phase: run the manifest's verification command and an optional
//! completion self-review of the applied changes.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::io::completion::{Completion, CompletionRequest, complete_json};
use crate::io::config::AgentConfig;
use crate::io::manifest::Manifest;
use crate::io::prompt::{PromptEngine, REVIEW_SCHEMA};
use crate::io::tools::{ToolError, ToolExecutor, ToolParams, ToolPayload};

#[derive(Debug, Clone, Deserialize)]
pub struct Review {
    pub matches_intent: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

/// Outcome of the Verify phase.
#[derive(Debug)]
pub struct VerifyOutcome {
    pub passed: bool,
    /// Structured failure detail fed back into the next Plan attempt.
    pub detail: String,
    pub review: Option<Review>,
}

/// Run verification for the task's applied changes.
///
/// The verification command decides pass/fail; the self-review can demote a
/// green run to a failure when the diff does not implement the task, but a
/// failed or unavailable review never blocks an otherwise green run.
#[instrument(skip_all)]
pub fn verify(
    completion: &dyn Completion,
    config: &AgentConfig,
    tools: &mut ToolExecutor,
    manifest: &Manifest,
    task_text: &str,
    changes_summary: &str,
) -> VerifyOutcome {
    let command_outcome = tools.execute(&ToolParams::RunCommand {
        command: manifest.verify.command.clone(),
        timeout_secs: Some(config.command_timeout_secs),
    });

    let (passed, output) = match command_outcome {
        Ok(ToolPayload::CommandResult {
            exit_code,
            stdout,
            stderr,
            ..
        }) => {
            let passed = exit_code == Some(0);
            debug!(?exit_code, passed, "verification command finished");
            (
                passed,
                format!("exit: {exit_code:?}\n=== stdout ===\n{stdout}\n=== stderr ===\n{stderr}"),
            )
        }
        Ok(_) => unreachable!("run_command returns command result"),
        Err(err @ ToolError::Timeout { .. }) => {
            warn!("verification command timed out");
            (false, format!("verification timed out: {err}"))
        }
        Err(err) => (false, format!("verification command failed: {err}")),
    };

    if !passed {
        return VerifyOutcome {
            passed: false,
            detail: output,
            review: None,
        };
    }

    match self_review(completion, config, task_text, changes_summary, &output) {
        Some(review) if !review.matches_intent => {
            let issues = if review.issues.is_empty() {
                review.summary.clone()
            } else {
                review.issues.join("; ")
            };
            VerifyOutcome {
                passed: false,
                detail: format!("self-review rejected the changes: {issues}"),
                review: Some(review),
            }
        }
        review => VerifyOutcome {
            passed: true,
            detail: output,
            review,
        },
    }
}

fn self_review(
    completion: &dyn Completion,
    config: &AgentConfig,
    task_text: &str,
    changes_summary: &str,
    verify_output: &str,
) -> Option<Review> {
    if changes_summary.trim().is_empty() {
        return None;
    }
    let engine = PromptEngine::new(config.prompt_budget_bytes);
    let prompt = engine
        .render_review(task_text, changes_summary, Some(verify_output))
        .ok()?;
    let request = CompletionRequest {
        prompt,
        timeout: Duration::from_secs(config.completion_timeout_secs),
        output_limit_bytes: config.output_limit_bytes,
    };
    match complete_json::<Review>(completion, &request, REVIEW_SCHEMA, config.completion_retries) {
        Ok(review) => Some(review),
        Err(err) => {
            // Review is advisory; verification already passed.
            warn!(err = %err, "self-review unavailable, keeping verification result");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::completion::CompletionError;
    use crate::io::manifest::VerifyConfig;
    use std::path::Path;

    struct Scripted(Option<String>);

    impl Completion for Scripted {
        fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
            match &self.0 {
                Some(text) => Ok(text.clone()),
                None => Err(CompletionError::Rejected {
                    exit_code: Some(1),
                    detail: "down".to_string(),
                }),
            }
        }
    }

    fn manifest_with(command: &[&str]) -> Manifest {
        Manifest {
            verify: VerifyConfig {
                command: command.iter().map(|s| s.to_string()).collect(),
            },
            ..Manifest::default()
        }
    }

    fn tools(root: &Path) -> ToolExecutor {
        ToolExecutor::new(root, Duration::from_secs(5), 10_000, Vec::new())
    }

    #[test]
    fn passing_command_and_review_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let completion = Scripted(Some(
            r#"{"matches_intent": true, "issues": [], "summary": "looks right"}"#.to_string(),
        ));
        let outcome = verify(
            &completion,
            &AgentConfig::default(),
            &mut tools(temp.path()),
            &manifest_with(&["true"]),
            "task",
            "step 1: patched src/x.rs",
        );
        assert!(outcome.passed);
        assert!(outcome.review.is_some());
    }

    #[test]
    fn failing_command_fails_with_output_detail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let completion = Scripted(None);
        let outcome = verify(
            &completion,
            &AgentConfig::default(),
            &mut tools(temp.path()),
            &manifest_with(&["sh", "-c", "echo boom >&2; exit 1"]),
            "task",
            "changes",
        );
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("boom"));
    }

    #[test]
    fn review_rejection_demotes_green_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let completion = Scripted(Some(
            r#"{"matches_intent": false, "issues": ["edited the wrong module"], "summary": ""}"#
                .to_string(),
        ));
        let outcome = verify(
            &completion,
            &AgentConfig::default(),
            &mut tools(temp.path()),
            &manifest_with(&["true"]),
            "task",
            "changes",
        );
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("wrong module"));
    }

    #[test]
    fn unavailable_review_keeps_green_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let completion = Scripted(None);
        let outcome = verify(
            &completion,
            &AgentConfig::default(),
            &mut tools(temp.path()),
            &manifest_with(&["true"]),
            "task",
            "changes",
        );
        assert!(outcome.passed);
        assert!(outcome.review.is_none());
    }
}
