//! Tool registry and executor.
//!
//! Every side-effecting action the pipeline takes flows through
//! [`ToolExecutor::execute`] with typed, validated parameters from a closed
//! set. Unknown or malformed parameters fail before any side effect;
//! `apply_patch` is the only path that changes file content. Each call is
//! logged for the owning phase record.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::phase::ToolCallRecord;
use crate::core::plan::validate_relative;
use crate::io::diff::{self, AppliedPatch, DiffError, Patch};
use crate::io::process::run_command_with_timeout;
use crate::io::vcs::Vcs;

/// Patches replacing every line of an existing file at least this long are
/// rejected; a diff must be scoped tighter than a rewrite.
pub const WHOLE_FILE_REWRITE_THRESHOLD: usize = 8;

/// Typed parameters for the closed tool set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolParams {
    ReadFile {
        path: PathBuf,
    },
    SearchCode {
        pattern: String,
        #[serde(default = "default_max_results")]
        max_results: usize,
    },
    ApplyPatch {
        patch: Patch,
    },
    RunCommand {
        command: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    VcsCommit {
        message: String,
    },
    VcsRevert {
        #[serde(default)]
        paths: Vec<PathBuf>,
    },
}

fn default_max_results() -> usize {
    50
}

impl ToolParams {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolParams::ReadFile { .. } => "read_file",
            ToolParams::SearchCode { .. } => "search_code",
            ToolParams::ApplyPatch { .. } => "apply_patch",
            ToolParams::RunCommand { .. } => "run_command",
            ToolParams::VcsCommit { .. } => "vcs_commit",
            ToolParams::VcsRevert { .. } => "vcs_revert",
        }
    }
}

/// One line matched by `search_code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
}

/// Successful tool results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolPayload {
    FileContents {
        path: PathBuf,
        content: String,
    },
    Matches {
        matches: Vec<SearchMatch>,
    },
    Applied {
        applied: AppliedPatch,
    },
    CommandResult {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        timed_out: bool,
    },
    Committed {
        committed: bool,
    },
    Reverted,
}

/// Typed tool failures.
#[derive(Debug)]
pub enum ToolError {
    /// Malformed parameters; no side effect occurred.
    Validation(String),
    /// Denylisted operation; refused before any process was spawned.
    PermissionDenied(String),
    /// The spawned command exceeded its deadline and was killed.
    Timeout { secs: u64 },
    Io(String),
    /// Patch base hash or context mismatch; never retried automatically.
    Conflict { path: PathBuf, detail: String },
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "validation",
            ToolError::PermissionDenied(_) => "permission_denied",
            ToolError::Timeout { .. } => "timeout",
            ToolError::Io(_) => "io",
            ToolError::Conflict { .. } => "conflict",
        }
    }

    /// Io and Timeout failures may be retried within the phase budget;
    /// validation, permission, and conflict failures fail the step.
    pub fn retryable(&self) -> bool {
        matches!(self, ToolError::Io(_) | ToolError::Timeout { .. })
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::Validation(detail) => write!(f, "validation error: {detail}"),
            ToolError::PermissionDenied(detail) => write!(f, "permission denied: {detail}"),
            ToolError::Timeout { secs } => write!(f, "timed out after {secs}s"),
            ToolError::Io(detail) => write!(f, "io error: {detail}"),
            ToolError::Conflict { path, detail } => {
                write!(f, "patch conflict on {}: {detail}", path.display())
            }
        }
    }
}

impl std::error::Error for ToolError {}

static DENYLIST: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"rm\s+(-\w*\s+)*-\w*[rf]\w*\s+[/~]",
        r"rm\s+-\w*[rf]\w*\s+\*",
        r"\bsudo\b",
        r"\bdoas\b",
        r">\s*/dev/sd",
        r"\bmkfs\.",
        r"\bdd\s+if=",
        r":\(\)\s*\{",
        r"\bgit\s+push\s+.*--force",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("denylist pattern"))
    .collect()
});

/// Executes validated tool calls against one repository root.
pub struct ToolExecutor {
    root: PathBuf,
    command_timeout: Duration,
    output_limit_bytes: usize,
    ignore_dirs: Vec<String>,
    log: Vec<ToolCallRecord>,
}

impl ToolExecutor {
    pub fn new(
        root: impl Into<PathBuf>,
        command_timeout: Duration,
        output_limit_bytes: usize,
        ignore_dirs: Vec<String>,
    ) -> Self {
        Self {
            root: root.into(),
            command_timeout,
            output_limit_bytes,
            ignore_dirs,
            log: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Drain the audit log accumulated since the last call, for the
    /// active phase record.
    pub fn drain_log(&mut self) -> Vec<ToolCallRecord> {
        std::mem::take(&mut self.log)
    }

    /// Validate and execute one tool call, recording the outcome.
    #[instrument(skip_all, fields(kind = params.kind()))]
    pub fn execute(&mut self, params: &ToolParams) -> Result<ToolPayload, ToolError> {
        let result = self.validate(params).and_then(|()| self.dispatch(params));
        self.record(params, &result);
        result
    }

    fn record(&mut self, params: &ToolParams, result: &Result<ToolPayload, ToolError>) {
        let (outcome, message) = match result {
            Ok(payload) => ("ok".to_string(), summarize_payload(payload)),
            Err(err) => (err.kind().to_string(), err.to_string()),
        };
        self.log.push(ToolCallRecord {
            kind: params.kind().to_string(),
            params: serde_json::to_value(params).unwrap_or(serde_json::Value::Null),
            outcome,
            message,
        });
    }

    fn validate(&self, params: &ToolParams) -> Result<(), ToolError> {
        match params {
            ToolParams::ReadFile { path } => {
                validate_relative(path).map_err(|err| ToolError::Validation(err.to_string()))
            }
            ToolParams::SearchCode { pattern, max_results } => {
                if *max_results == 0 {
                    return Err(ToolError::Validation("max_results must be > 0".to_string()));
                }
                Regex::new(pattern)
                    .map(|_| ())
                    .map_err(|err| ToolError::Validation(format!("invalid pattern: {err}")))
            }
            ToolParams::ApplyPatch { patch } => {
                validate_relative(&patch.path)
                    .map_err(|err| ToolError::Validation(err.to_string()))?;
                if patch.base_hash.is_empty() {
                    return Err(ToolError::Validation("patch missing base hash".to_string()));
                }
                if patch.hunks.is_empty() {
                    return Err(ToolError::Validation("patch has no hunks".to_string()));
                }
                self.reject_whole_file_rewrite(patch)
            }
            ToolParams::RunCommand { command, timeout_secs } => {
                if command.is_empty() || command[0].trim().is_empty() {
                    return Err(ToolError::Validation(
                        "command must be a non-empty array".to_string(),
                    ));
                }
                if timeout_secs == &Some(0) {
                    return Err(ToolError::Validation("timeout_secs must be > 0".to_string()));
                }
                let joined = command.join(" ");
                for pattern in DENYLIST.iter() {
                    if pattern.is_match(&joined) {
                        warn!(command = %joined, "denylisted command refused");
                        return Err(ToolError::PermissionDenied(format!(
                            "destructive command refused: {joined}"
                        )));
                    }
                }
                Ok(())
            }
            ToolParams::VcsCommit { message } => {
                if message.trim().is_empty() {
                    return Err(ToolError::Validation("commit message must be non-empty".to_string()));
                }
                Ok(())
            }
            ToolParams::VcsRevert { paths } => {
                for path in paths {
                    validate_relative(path).map_err(|err| ToolError::Validation(err.to_string()))?;
                }
                Ok(())
            }
        }
    }

    fn reject_whole_file_rewrite(&self, patch: &Patch) -> Result<(), ToolError> {
        let full_path = self.root.join(&patch.path);
        if !full_path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&full_path)
            .map_err(|err| ToolError::Io(format!("read {}: {err}", patch.path.display())))?;
        let total_lines = content.split_inclusive('\n').count();
        if patch.is_whole_file_rewrite(total_lines, WHOLE_FILE_REWRITE_THRESHOLD) {
            return Err(ToolError::Validation(format!(
                "patch rewrites all {total_lines} lines of {}; scope it to the lines that change",
                patch.path.display()
            )));
        }
        Ok(())
    }

    fn dispatch(&self, params: &ToolParams) -> Result<ToolPayload, ToolError> {
        match params {
            ToolParams::ReadFile { path } => self.read_file(path),
            ToolParams::SearchCode { pattern, max_results } => self.search_code(pattern, *max_results),
            ToolParams::ApplyPatch { patch } => self.apply_patch(patch),
            ToolParams::RunCommand { command, timeout_secs } => {
                self.run_command(command, *timeout_secs)
            }
            ToolParams::VcsCommit { message } => self.vcs_commit(message),
            ToolParams::VcsRevert { paths } => self.vcs_revert(paths),
        }
    }

    fn read_file(&self, path: &Path) -> Result<ToolPayload, ToolError> {
        let full_path = self.root.join(path);
        let content = fs::read_to_string(&full_path)
            .map_err(|err| ToolError::Io(format!("read {}: {err}", path.display())))?;
        Ok(ToolPayload::FileContents {
            path: path.to_path_buf(),
            content,
        })
    }

    fn search_code(&self, pattern: &str, max_results: usize) -> Result<ToolPayload, ToolError> {
        let regex = Regex::new(pattern)
            .map_err(|err| ToolError::Validation(format!("invalid pattern: {err}")))?;
        let mut matches = Vec::new();
        let root = self.root.clone();
        self.search_dir(&root, &regex, max_results, &mut matches)?;
        Ok(ToolPayload::Matches { matches })
    }

    fn search_dir(
        &self,
        dir: &Path,
        regex: &Regex,
        max_results: usize,
        matches: &mut Vec<SearchMatch>,
    ) -> Result<(), ToolError> {
        if matches.len() >= max_results {
            return Ok(());
        }
        let entries = fs::read_dir(dir)
            .map_err(|err| ToolError::Io(format!("read dir {}: {err}", dir.display())))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        paths.sort();

        for path in paths {
            if matches.len() >= max_results {
                return Ok(());
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if path.is_dir() {
                if name.starts_with('.') || self.ignore_dirs.contains(&name) {
                    continue;
                }
                self.search_dir(&path, regex, max_results, matches)?;
                continue;
            }
            if name.starts_with('.') {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue; // binary or unreadable files are not searchable
            };
            let rel = path.strip_prefix(&self.root).unwrap_or(&path).to_path_buf();
            for (index, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(SearchMatch {
                        path: rel.clone(),
                        line: index + 1,
                        text: line.to_string(),
                    });
                    if matches.len() >= max_results {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_patch(&self, patch: &Patch) -> Result<ToolPayload, ToolError> {
        match diff::apply(&self.root, patch) {
            Ok(applied) => Ok(ToolPayload::Applied { applied }),
            Err(DiffError::Conflict { path, detail }) => Err(ToolError::Conflict { path, detail }),
            Err(DiffError::Io { path, source }) => {
                Err(ToolError::Io(format!("{}: {source}", path.display())))
            }
        }
    }

    fn run_command(
        &self,
        command: &[String],
        timeout_secs: Option<u64>,
    ) -> Result<ToolPayload, ToolError> {
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.command_timeout);
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]).current_dir(&self.root);

        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .map_err(|err| ToolError::Io(format!("{err:#}")))?;
        if output.timed_out {
            return Err(ToolError::Timeout {
                secs: timeout.as_secs(),
            });
        }
        debug!(exit_code = ?output.status.code(), "command completed");
        Ok(ToolPayload::CommandResult {
            exit_code: output.status.code(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            timed_out: false,
        })
    }

    fn vcs_commit(&self, message: &str) -> Result<ToolPayload, ToolError> {
        let vcs = Vcs::new(&self.root);
        vcs.add_all()
            .and_then(|()| vcs.commit_staged(message))
            .map(|committed| ToolPayload::Committed { committed })
            .map_err(|err| ToolError::Io(format!("{err:#}")))
    }

    fn vcs_revert(&self, paths: &[PathBuf]) -> Result<ToolPayload, ToolError> {
        let vcs = Vcs::new(&self.root);
        let path_strs: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        let refs: Vec<&str> = path_strs.iter().map(String::as_str).collect();
        vcs.restore_paths(&refs)
            .map(|()| ToolPayload::Reverted)
            .map_err(|err| ToolError::Io(format!("{err:#}")))
    }
}

fn summarize_payload(payload: &ToolPayload) -> String {
    match payload {
        ToolPayload::FileContents { path, content } => {
            format!("read {} ({} bytes)", path.display(), content.len())
        }
        ToolPayload::Matches { matches } => format!("{} matches", matches.len()),
        ToolPayload::Applied { applied } => format!(
            "applied {} ({} hunks)",
            applied.patch.path.display(),
            applied.patch.hunks.len()
        ),
        ToolPayload::CommandResult { exit_code, .. } => format!("exit {exit_code:?}"),
        ToolPayload::Committed { committed } => format!("committed={committed}"),
        ToolPayload::Reverted => "reverted".to_string(),
    }
}
