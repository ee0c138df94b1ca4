//! Apply phase: turn approved plan steps into applied patches.
//!
//! Each step asks the completion service for line edits scoped to exactly
//! that step's target files, builds hash-bound patches, and applies them
//! through the tool registry, the only write path. A failure inside a
//! step reverts that step's already-applied patches in reverse order;
//! patches from earlier, completed steps stay intact.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::core::plan::{Plan, Step, StepAction};
use crate::io::completion::{Completion, CompletionRequest, complete_json};
use crate::io::config::AgentConfig;
use crate::io::diff::{self, AppliedPatch, LineEdit};
use crate::io::prompt::{EDITS_SCHEMA, NumberedFile, PromptEngine};
use crate::io::tools::{ToolError, ToolExecutor, ToolParams, ToolPayload};

#[derive(Debug, Deserialize)]
struct EditsJson {
    edits: Vec<EditJson>,
}

#[derive(Debug, Deserialize)]
struct EditJson {
    path: PathBuf,
    hunks: Vec<LineEdit>,
}

/// Result of applying a whole plan.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// Every patch applied, in application order, with durable inverses.
    pub applied: Vec<AppliedPatch>,
    /// Human-readable change summary for verify/review prompts.
    pub summary: String,
}

/// Why a step failed; the step's own patches were already reverted.
#[derive(Debug)]
pub struct StepFailure {
    pub step_index: usize,
    pub description: String,
    pub kind: StepFailureKind,
    pub detail: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StepFailureKind {
    /// Base-hash or context mismatch; caller should re-explore, not retry.
    Conflict { path: PathBuf },
    /// Tool-layer failure (io, timeout, validation, permission).
    Tool { error_kind: &'static str, retryable: bool },
    /// Completion call failed or produced unusable edits.
    Completion,
    /// The completion tried to edit a file outside the step's scope.
    OutOfScope { path: PathBuf },
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} ({}) failed: {}",
            self.step_index + 1,
            self.description,
            self.detail
        )
    }
}

impl std::error::Error for StepFailure {}

/// Apply every step of an approved plan.
#[instrument(skip_all, fields(steps = plan.steps.len()))]
pub fn apply_plan(
    completion: &dyn Completion,
    config: &AgentConfig,
    tools: &mut ToolExecutor,
    task_text: &str,
    plan: &Plan,
) -> Result<ApplyOutcome, StepFailure> {
    let engine = PromptEngine::new(config.prompt_budget_bytes);
    let mut applied = Vec::new();
    let mut summary_lines = Vec::new();

    for (step_index, step) in plan.steps.iter().enumerate() {
        if step.action == StepAction::Run || step.files.is_empty() {
            // Command-style steps carry no edits; verification runs the
            // manifest command for the whole task.
            summary_lines.push(format!("step {}: {} (no edits)", step_index + 1, step.description));
            continue;
        }
        let step_applied =
            apply_step(&engine, completion, config, tools, task_text, step_index, step)?;
        for patch in &step_applied {
            summary_lines.push(format!(
                "step {}: patched {} ({} hunks)",
                step_index + 1,
                patch.patch.path.display(),
                patch.patch.hunks.len()
            ));
        }
        applied.extend(step_applied);
    }

    Ok(ApplyOutcome {
        applied,
        summary: summary_lines.join("\n"),
    })
}

fn apply_step(
    engine: &PromptEngine,
    completion: &dyn Completion,
    config: &AgentConfig,
    tools: &mut ToolExecutor,
    task_text: &str,
    step_index: usize,
    step: &Step,
) -> Result<Vec<AppliedPatch>, StepFailure> {
    let fail = |kind, detail: String| StepFailure {
        step_index,
        description: step.description.clone(),
        kind,
        detail,
    };

    // Current content of every target file; missing files are creations.
    let mut current: Vec<(PathBuf, String)> = Vec::with_capacity(step.files.len());
    for path in &step.files {
        match tools.execute(&ToolParams::ReadFile { path: path.clone() }) {
            Ok(ToolPayload::FileContents { content, .. }) => {
                current.push((path.clone(), content));
            }
            Ok(_) => unreachable!("read_file returns file contents"),
            Err(ToolError::Io(_)) if step.action == StepAction::Create => {
                current.push((path.clone(), String::new()));
            }
            Err(err) => {
                return Err(fail(
                    StepFailureKind::Tool {
                        error_kind: err.kind(),
                        retryable: err.retryable(),
                    },
                    err.to_string(),
                ));
            }
        }
    }

    let numbered: Vec<NumberedFile> = current
        .iter()
        .map(|(path, content)| NumberedFile::new(path.display().to_string(), content))
        .collect();
    let files_list = step
        .files
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let prompt = engine
        .render_edit(task_text, &step.description, &files_list, &numbered)
        .map_err(|err| fail(StepFailureKind::Completion, format!("render edit prompt: {err}")))?;

    let request = CompletionRequest {
        prompt,
        timeout: Duration::from_secs(config.completion_timeout_secs),
        output_limit_bytes: config.output_limit_bytes,
    };
    let parsed: EditsJson =
        complete_json(completion, &request, EDITS_SCHEMA, config.completion_retries)
            .map_err(|err| fail(StepFailureKind::Completion, err.to_string()))?;

    let allowed: BTreeSet<&PathBuf> = step.files.iter().collect();
    let mut seen_paths: BTreeSet<PathBuf> = BTreeSet::new();
    let mut step_applied: Vec<AppliedPatch> = Vec::new();

    for edit in &parsed.edits {
        if !allowed.contains(&edit.path) {
            revert_in_reverse(tools, &step_applied);
            return Err(fail(
                StepFailureKind::OutOfScope { path: edit.path.clone() },
                format!("edit targets {} outside the step's files", edit.path.display()),
            ));
        }
        if !seen_paths.insert(edit.path.clone()) {
            revert_in_reverse(tools, &step_applied);
            return Err(fail(
                StepFailureKind::Completion,
                format!("duplicate edit entry for {}", edit.path.display()),
            ));
        }

        let base = current
            .iter()
            .find(|(path, _)| path == &edit.path)
            .map(|(_, content)| content.as_str())
            .unwrap_or("");
        let patch = match diff::from_line_edits(&edit.path, base, &edit.hunks) {
            Ok(patch) => patch,
            Err(err) => {
                revert_in_reverse(tools, &step_applied);
                return Err(fail(StepFailureKind::Completion, err.to_string()));
            }
        };

        match tools.execute(&ToolParams::ApplyPatch { patch }) {
            Ok(ToolPayload::Applied { applied }) => {
                debug!(path = %applied.patch.path.display(), "step edit applied");
                step_applied.push(applied);
            }
            Ok(_) => unreachable!("apply_patch returns applied payload"),
            Err(ToolError::Conflict { path, detail }) => {
                revert_in_reverse(tools, &step_applied);
                return Err(fail(StepFailureKind::Conflict { path }, detail));
            }
            Err(err) => {
                revert_in_reverse(tools, &step_applied);
                return Err(fail(
                    StepFailureKind::Tool {
                        error_kind: err.kind(),
                        retryable: err.retryable(),
                    },
                    err.to_string(),
                ));
            }
        }
    }

    Ok(step_applied)
}

/// Roll back a partially applied step, newest patch first.
fn revert_in_reverse(tools: &ToolExecutor, applied: &[AppliedPatch]) {
    for patch in applied.iter().rev() {
        if let Err(err) = diff::revert(tools.root(), patch) {
            warn!(path = %patch.patch.path.display(), err = %err, "step rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::completion::CompletionError;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    struct Scripted {
        responses: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    impl Completion for Scripted {
        fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
            self.responses
                .lock()
                .expect("lock")
                .pop()
                .ok_or_else(|| CompletionError::Rejected {
                    exit_code: Some(1),
                    detail: "script exhausted".to_string(),
                })
        }
    }

    fn tools(root: &Path) -> ToolExecutor {
        ToolExecutor::new(root, Duration::from_secs(5), 10_000, vec!["target".to_string()])
    }

    fn plan_for(path: &str, action: StepAction) -> Plan {
        Plan {
            steps: vec![Step {
                description: "apply the change".to_string(),
                action,
                files: vec![PathBuf::from(path)],
            }],
        }
    }

    #[test]
    fn applies_edit_to_existing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/x.rs"), "fn x() {}\nfn y() {}\n").expect("seed");

        let completion = Scripted::new(vec![
            r#"{"edits": [{"path": "src/x.rs", "hunks": [{"old_start": 0, "old_len": 1, "new_lines": ["fn x() { tracing::info!(\"x\"); }"]}]}]}"#,
        ]);
        let mut tools = tools(temp.path());
        let outcome = apply_plan(
            &completion,
            &AgentConfig::default(),
            &mut tools,
            "add logging",
            &plan_for("src/x.rs", StepAction::Modify),
        )
        .expect("apply");

        assert_eq!(outcome.applied.len(), 1);
        let on_disk = fs::read_to_string(temp.path().join("src/x.rs")).expect("read");
        assert!(on_disk.contains("tracing::info"));
        assert!(on_disk.contains("fn y() {}"));
    }

    #[test]
    fn creates_new_file_for_create_step() {
        let temp = tempfile::tempdir().expect("tempdir");
        let completion = Scripted::new(vec![
            r#"{"edits": [{"path": "src/new.rs", "hunks": [{"old_start": 0, "old_len": 0, "new_lines": ["pub fn fresh() {}"]}]}]}"#,
        ]);
        let mut tools = tools(temp.path());
        let outcome = apply_plan(
            &completion,
            &AgentConfig::default(),
            &mut tools,
            "create module",
            &plan_for("src/new.rs", StepAction::Create),
        )
        .expect("apply");

        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(
            fs::read_to_string(temp.path().join("src/new.rs")).expect("read"),
            "pub fn fresh() {}\n"
        );
    }

    #[test]
    fn out_of_scope_edit_fails_and_reverts_step() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/x.rs"), "fn x() {}\n").expect("seed");
        fs::write(temp.path().join("src/other.rs"), "fn other() {}\n").expect("seed");

        let completion = Scripted::new(vec![
            r#"{"edits": [
                {"path": "src/x.rs", "hunks": [{"old_start": 0, "old_len": 1, "new_lines": ["fn x() { changed(); }"]}]},
                {"path": "src/other.rs", "hunks": [{"old_start": 0, "old_len": 1, "new_lines": ["fn other() { changed(); }"]}]}
            ]}"#,
        ]);
        let mut tools = tools(temp.path());
        let err = apply_plan(
            &completion,
            &AgentConfig::default(),
            &mut tools,
            "task",
            &plan_for("src/x.rs", StepAction::Modify),
        )
        .expect_err("out of scope");

        assert!(matches!(err.kind, StepFailureKind::OutOfScope { .. }));
        // The in-scope patch that had already landed was rolled back.
        assert_eq!(
            fs::read_to_string(temp.path().join("src/x.rs")).expect("read"),
            "fn x() {}\n"
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("src/other.rs")).expect("read"),
            "fn other() {}\n"
        );
    }

    #[test]
    fn completion_failure_is_step_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/x.rs"), "fn x() {}\n").expect("seed");

        let completion = Scripted::new(Vec::new());
        let mut tools = tools(temp.path());
        let err = apply_plan(
            &completion,
            &AgentConfig::default(),
            &mut tools,
            "task",
            &plan_for("src/x.rs", StepAction::Modify),
        )
        .expect_err("completion failure");
        assert_eq!(err.kind, StepFailureKind::Completion);
    }

    #[test]
    fn run_steps_apply_no_edits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let completion = Scripted::new(Vec::new());
        let mut tools = tools(temp.path());
        let plan = Plan {
            steps: vec![Step {
                description: "run the formatter".to_string(),
                action: StepAction::Run,
                files: Vec::new(),
            }],
        };
        let outcome =
            apply_plan(&completion, &AgentConfig::default(), &mut tools, "task", &plan)
                .expect("apply");
        assert!(outcome.applied.is_empty());
        assert!(outcome.summary.contains("no edits"));
    }
}
