//! Case file parsing and validation.
//!
//! Cases are TOML files defining scored benchmark tasks. Two kinds exist:
//! intent cases score the deterministic classifier rule layer; task cases
//! seed a workspace, replay scripted completions through the full
//! pipeline, and judge the result with checks. Together they form the
//! fixed benchmark seed: same cases, same inputs, same scores.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use agent::core::intent::Intent;
use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

/// A parsed case file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CaseFile {
    pub case: CaseMeta,
    #[serde(default)]
    pub intent: Option<IntentCase>,
    #[serde(default)]
    pub task: Option<TaskCase>,
}

/// Case metadata: identifier, scoring category, weight.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CaseMeta {
    /// Unique identifier (slug format: `[a-z0-9_-]+`).
    pub id: String,
    /// Scoring category, e.g. "intent", "editing".
    pub category: String,
    /// Relative weight in the aggregate score.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Scores the classifier rule layer: request in, expected intent out.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IntentCase {
    pub request: String,
    pub expected: Intent,
}

/// Drives the full pipeline in an isolated workspace with replayed
/// completions, then judges the result.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TaskCase {
    pub request: String,
    /// Files seeded into the workspace before the run.
    #[serde(default)]
    pub files: Vec<SeedFile>,
    /// Scripted completion outputs, consumed in order.
    pub completions: Vec<String>,
    /// Workspace verification command (manifest `verify.command`).
    #[serde(default = "default_verify")]
    pub verify_command: Vec<String>,
    /// Checks judged after the pipeline run.
    pub checks: Vec<Check>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_verify() -> Vec<String> {
    vec!["true".to_string()]
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SeedFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Verification check run after a task case completes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    /// Check that a file exists in the workspace.
    FileExists { path: PathBuf },
    /// Check that a file contains a substring.
    FileContains { path: PathBuf, needle: String },
    /// Check that a command exits successfully.
    CommandSucceeds { cmd: Vec<String> },
    /// Check that the pipeline run completed.
    TaskCompleted,
}

impl CaseFile {
    /// Load and validate a case file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read case {}", path.display()))?;
        let case: CaseFile =
            toml::from_str(&contents).with_context(|| format!("parse case {}", path.display()))?;
        case.validate()
            .with_context(|| format!("validate case {}", path.display()))?;
        Ok(case)
    }

    #[cfg(test)]
    pub fn parse_str(contents: &str) -> Result<Self> {
        let case: CaseFile = toml::from_str(contents).context("parse case")?;
        case.validate()?;
        Ok(case)
    }

    fn validate(&self) -> Result<()> {
        validate_case_id(&self.case.id)?;
        if self.case.category.trim().is_empty() {
            bail!("case.category must be non-empty");
        }
        if self.case.weight <= 0.0 {
            bail!("case.weight must be > 0");
        }
        match (&self.intent, &self.task) {
            (Some(intent), None) => {
                if intent.request.trim().is_empty() {
                    bail!("intent.request must be non-empty");
                }
                Ok(())
            }
            (None, Some(task)) => task.validate(),
            (Some(_), Some(_)) => bail!("case declares both [intent] and [task]"),
            (None, None) => bail!("case declares neither [intent] nor [task]"),
        }
    }
}

impl TaskCase {
    fn validate(&self) -> Result<()> {
        if self.request.trim().is_empty() {
            bail!("task.request must be non-empty");
        }
        if self.completions.is_empty() {
            bail!("task.completions must be non-empty (the benchmark replays fixed outputs)");
        }
        if self.checks.is_empty() {
            bail!("task.checks must be a non-empty array");
        }
        if self.verify_command.is_empty() || self.verify_command[0].trim().is_empty() {
            bail!("task.verify_command must be a non-empty array");
        }
        for (index, check) in self.checks.iter().enumerate() {
            check
                .validate()
                .with_context(|| format!("checks[{index}] invalid"))?;
        }
        for seed in &self.files {
            if seed.path.as_os_str().is_empty() {
                bail!("task.files path must be non-empty");
            }
        }
        Ok(())
    }

    /// Workspace-relative paths this case seeds; used to force overlapping
    /// cases into the same sequential batch.
    pub fn seeded_paths(&self) -> Vec<&Path> {
        self.files.iter().map(|seed| seed.path.as_path()).collect()
    }
}

impl Check {
    fn validate(&self) -> Result<()> {
        match self {
            Check::FileExists { path } => {
                if path.as_os_str().is_empty() {
                    bail!("file_exists.path must be non-empty");
                }
            }
            Check::FileContains { path, needle } => {
                if path.as_os_str().is_empty() {
                    bail!("file_contains.path must be non-empty");
                }
                if needle.is_empty() {
                    bail!("file_contains.needle must be non-empty");
                }
            }
            Check::CommandSucceeds { cmd } => {
                if cmd.is_empty() || cmd[0].trim().is_empty() {
                    bail!("command_succeeds.cmd must be a non-empty array");
                }
            }
            Check::TaskCompleted => {}
        }
        Ok(())
    }
}

/// Discover and load all case files from a directory.
///
/// Returns cases sorted by (category, id). Errors if duplicate ids are found.
pub fn discover_cases(dir: &Path) -> Result<Vec<CaseFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut cases = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read cases dir {}", dir.display()))? {
        let entry = entry.context("read case entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        cases.push(CaseFile::load(&path)?);
    }
    cases.sort_by(|left, right| {
        (left.case.category.as_str(), left.case.id.as_str())
            .cmp(&(right.case.category.as_str(), right.case.id.as_str()))
    });
    let mut ids: Vec<&str> = cases.iter().map(|c| c.case.id.as_str()).collect();
    ids.sort_unstable();
    for pair in ids.windows(2) {
        if pair[0] == pair[1] {
            return Err(anyhow!("duplicate case.id {}", pair[0]));
        }
    }
    Ok(cases)
}

fn validate_case_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("case.id must be non-empty");
    }
    if id.contains('/') || id.contains('\\') {
        bail!("case.id must not contain path separators");
    }
    if id.contains("..") {
        bail!("case.id must not contain '..'");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("case.id must use [a-z0-9_-] only");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_intent_case() {
        let input = r#"
[case]
id = "classify-vague"
category = "intent"

[intent]
request = "fix it"
expected = "clarify"
"#;
        let case = CaseFile::parse_str(input).expect("case parses");
        assert_eq!(case.case.id, "classify-vague");
        assert_eq!(case.intent.expect("intent").expected, Intent::Clarify);
    }

    #[test]
    fn parses_task_case() {
        let input = r#"
[case]
id = "add-logging"
category = "editing"
weight = 2.0

[task]
request = "add logging to the worker module"
completions = ['{"steps": []}', '{"edits": []}']

[[task.files]]
path = "src/worker.rs"
contents = "pub fn work() {}\n"

[[task.checks]]
type = "file_contains"
path = "src/worker.rs"
needle = "tracing"

[[task.checks]]
type = "task_completed"
"#;
        let case = CaseFile::parse_str(input).expect("case parses");
        let task = case.task.expect("task");
        assert_eq!(task.files.len(), 1);
        assert_eq!(task.checks.len(), 2);
        assert_eq!(task.verify_command, vec!["true"]);
    }

    #[test]
    fn rejects_case_with_both_kinds() {
        let input = r#"
[case]
id = "both"
category = "intent"

[intent]
request = "hi"
expected = "chat"

[task]
request = "x"
completions = ["y"]

[[task.checks]]
type = "task_completed"
"#;
        let err = CaseFile::parse_str(input).expect_err("both kinds");
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn rejects_task_without_completions() {
        let input = r#"
[case]
id = "no-replay"
category = "editing"

[task]
request = "do the thing"
completions = []

[[task.checks]]
type = "task_completed"
"#;
        let _err = CaseFile::parse_str(input).expect_err("no completions");
    }

    #[test]
    fn rejects_invalid_id() {
        let input = r#"
[case]
id = "bad/id"
category = "intent"

[intent]
request = "hi"
expected = "chat"
"#;
        let err = CaseFile::parse_str(input).expect_err("invalid id");
        assert!(err.to_string().contains("case.id"));
    }
}
