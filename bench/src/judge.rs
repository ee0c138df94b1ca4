//! Check execution for task cases.
//!
//! Runs verification checks after a pipeline run and records detailed
//! outcomes including command output.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::case::Check;

/// Limits for command execution in checks.
#[derive(Debug, Clone, Copy)]
pub struct CommandLimits {
    /// Maximum time before killing the command.
    pub timeout: Duration,
    /// Maximum bytes to capture from stdout/stderr.
    pub output_limit_bytes: usize,
}

impl CommandLimits {
    /// Default limits: 60s timeout, 50KB output.
    pub fn default_limits() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            output_limit_bytes: 50_000,
        }
    }
}

/// Collected check outcomes for a run.
#[derive(Debug, Serialize, Deserialize)]
pub struct Judgment {
    pub checks: Vec<CheckOutcome>,
}

impl Judgment {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(CheckOutcome::passed)
    }

    pub fn failure_summary(&self) -> String {
        self.checks
            .iter()
            .filter(|outcome| !outcome.passed())
            .map(CheckOutcome::label)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Result of running a single check.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckOutcome {
    FileExists {
        path: String,
        passed: bool,
    },
    FileContains {
        path: String,
        needle: String,
        passed: bool,
    },
    CommandSucceeds {
        cmd: Vec<String>,
        passed: bool,
        exit_code: Option<i32>,
        timed_out: bool,
        stdout: String,
        stderr: String,
    },
    TaskCompleted {
        passed: bool,
    },
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        match self {
            CheckOutcome::FileExists { passed, .. }
            | CheckOutcome::FileContains { passed, .. }
            | CheckOutcome::CommandSucceeds { passed, .. }
            | CheckOutcome::TaskCompleted { passed } => *passed,
        }
    }

    fn label(&self) -> String {
        match self {
            CheckOutcome::FileExists { path, .. } => format!("file_exists {path}"),
            CheckOutcome::FileContains { path, needle, .. } => {
                format!("file_contains {path} ~ {needle}")
            }
            CheckOutcome::CommandSucceeds { cmd, .. } => format!("command_succeeds {cmd:?}"),
            CheckOutcome::TaskCompleted { .. } => "task_completed".to_string(),
        }
    }
}

/// Run all checks and collect outcomes.
#[instrument(skip_all, fields(check_count = checks.len()))]
pub fn run_checks(
    checks: &[Check],
    workspace_root: &Path,
    task_completed: bool,
    limits: CommandLimits,
) -> Result<Judgment> {
    let mut outcomes = Vec::with_capacity(checks.len());
    for check in checks {
        match check {
            Check::FileExists { path } => {
                let passed = workspace_root.join(path).exists();
                debug!(check = "file_exists", path = %path.display(), passed, "check result");
                outcomes.push(CheckOutcome::FileExists {
                    path: path.display().to_string(),
                    passed,
                });
            }
            Check::FileContains { path, needle } => {
                let passed = fs::read_to_string(workspace_root.join(path))
                    .map(|content| content.contains(needle))
                    .unwrap_or(false);
                debug!(check = "file_contains", path = %path.display(), passed, "check result");
                outcomes.push(CheckOutcome::FileContains {
                    path: path.display().to_string(),
                    needle: needle.clone(),
                    passed,
                });
            }
            Check::CommandSucceeds { cmd } => {
                let outcome = run_command_check(cmd, workspace_root, limits)?;
                if let CheckOutcome::CommandSucceeds {
                    passed, timed_out, ..
                } = &outcome
                {
                    if *timed_out {
                        warn!(check = "command_succeeds", cmd = ?cmd, "check timed out");
                    } else {
                        debug!(check = "command_succeeds", cmd = ?cmd, passed, "check result");
                    }
                }
                outcomes.push(outcome);
            }
            Check::TaskCompleted => {
                debug!(check = "task_completed", passed = task_completed, "check result");
                outcomes.push(CheckOutcome::TaskCompleted {
                    passed: task_completed,
                });
            }
        }
    }
    Ok(Judgment { checks: outcomes })
}

fn run_command_check(
    cmd: &[String],
    workspace_root: &Path,
    limits: CommandLimits,
) -> Result<CheckOutcome> {
    if cmd.is_empty() {
        bail!("command_succeeds cmd must be non-empty");
    }

    let mut child = Command::new(&cmd[0])
        .args(&cmd[1..])
        .current_dir(workspace_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn command {:?}", cmd))?;

    let mut timed_out = false;
    let status = match child.wait_timeout(limits.timeout)? {
        Some(status) => status,
        None => {
            timed_out = true;
            child.kill().ok();
            child.wait().context("wait after kill")?
        }
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_end(&mut stdout).context("read stdout")?;
    }
    if let Some(mut err) = child.stderr.take() {
        err.read_to_end(&mut stderr).context("read stderr")?;
    }
    stdout.truncate(limits.output_limit_bytes);
    stderr.truncate(limits.output_limit_bytes);

    let exit_code = status.code();
    let passed = !timed_out && status.success();

    Ok(CheckOutcome::CommandSucceeds {
        cmd: cmd.to_vec(),
        passed,
        exit_code,
        timed_out,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn file_exists_passes() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("hello.txt"), "hi").expect("write");

        let checks = vec![Check::FileExists {
            path: PathBuf::from("hello.txt"),
        }];
        let result =
            run_checks(&checks, temp.path(), true, CommandLimits::default_limits()).expect("checks");
        assert!(result.all_passed());
    }

    #[test]
    fn file_contains_checks_substring() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("x.rs"), "tracing::info!(\"x\")").expect("write");

        let checks = vec![
            Check::FileContains {
                path: PathBuf::from("x.rs"),
                needle: "tracing".to_string(),
            },
            Check::FileContains {
                path: PathBuf::from("x.rs"),
                needle: "absent".to_string(),
            },
        ];
        let result =
            run_checks(&checks, temp.path(), true, CommandLimits::default_limits()).expect("checks");
        assert!(result.checks[0].passed());
        assert!(!result.checks[1].passed());
        assert!(result.failure_summary().contains("absent"));
    }

    #[test]
    fn command_succeeds_passes_and_fails() {
        let temp = tempdir().expect("tempdir");
        let limits = CommandLimits {
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1024,
        };

        let checks = vec![Check::CommandSucceeds {
            cmd: vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
        }];
        let result = run_checks(&checks, temp.path(), true, limits).expect("checks");
        assert!(result.all_passed());

        let checks = vec![Check::CommandSucceeds {
            cmd: vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
        }];
        let result = run_checks(&checks, temp.path(), true, limits).expect("checks");
        assert!(!result.all_passed());
    }

    #[test]
    fn task_completed_reflects_pipeline_outcome() {
        let checks = vec![Check::TaskCompleted];
        let result = run_checks(&checks, Path::new("."), false, CommandLimits::default_limits())
            .expect("checks");
        assert!(!result.all_passed());
    }
}
