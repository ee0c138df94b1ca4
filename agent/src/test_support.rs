//! Test-only helpers: scripted completion/approver seams and seeded git
//! repositories.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};

use crate::core::plan::Plan;
use crate::io::completion::{Completion, CompletionError, CompletionRequest};
use crate::io::manifest::{Manifest, VerifyConfig, write_manifest};
use crate::planning::{Approver, PlanReview};

/// Completion backend that replays queued responses in order.
///
/// An exhausted queue returns a well-formed rejection, so a test that
/// under-scripts fails loudly instead of hanging.
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedCompletion {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn from_strs(responses: &[&str]) -> Self {
        Self::new(responses.iter().map(|s| s.to_string()).collect())
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().expect("scripted completion lock").len()
    }
}

impl Completion for ScriptedCompletion {
    fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
        self.responses
            .lock()
            .expect("scripted completion lock")
            .pop_front()
            .ok_or_else(|| CompletionError::Rejected {
                exit_code: Some(1),
                detail: "scripted completion exhausted".to_string(),
            })
    }
}

/// Approver that replays queued reviews; defaults to approve when empty.
pub struct ScriptedApprover {
    reviews: Mutex<VecDeque<PlanReview>>,
}

impl ScriptedApprover {
    pub fn new(reviews: Vec<PlanReview>) -> Self {
        Self {
            reviews: Mutex::new(reviews.into()),
        }
    }

    pub fn approve_all() -> Self {
        Self::new(Vec::new())
    }
}

impl Approver for ScriptedApprover {
    fn review(&self, _plan: &Plan) -> Result<PlanReview> {
        Ok(self
            .reviews
            .lock()
            .expect("scripted approver lock")
            .pop_front()
            .unwrap_or(PlanReview::Approve))
    }
}

/// A temporary git repository seeded for pipeline tests.
pub struct TestRepo {
    temp: tempfile::TempDir,
}

impl TestRepo {
    /// Create an empty repo with an initial commit.
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { temp };
        repo.git(&["init"])?;
        repo.git(&["config", "user.email", "agent-test@local.invalid"])?;
        repo.git(&["config", "user.name", "Agent Test"])?;
        repo.seed_file("README.md", "seed\n")?;
        repo.commit_all("chore: init")?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn seed_file(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.temp.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        let path = self.temp.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Write an `agent.toml` with the given verification command.
    pub fn init_manifest(&self, verify_command: &[&str]) -> Result<()> {
        let manifest = Manifest {
            verify: VerifyConfig {
                command: verify_command.iter().map(|s| s.to_string()).collect(),
            },
            ..Manifest::default()
        };
        write_manifest(self.temp.path(), &manifest)
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-m", message])?;
        Ok(())
    }

    pub fn head_sha(&self) -> Result<String> {
        let out = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(self.temp.path())
            .output()
            .context("git rev-parse")?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.temp.path())
            .output()
            .with_context(|| format!("run git {args:?}"))?;
        if !status.status.success() {
            bail!(
                "git {:?} failed: {}",
                args,
                String::from_utf8_lossy(&status.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Paths of every file under `root`, with content hashes, for
/// before/after comparisons in rollback tests.
pub fn snapshot_hashes(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut out = Vec::new();
    snapshot_dir(root, root, &mut out)?;
    out.sort();
    Ok(out)
}

fn snapshot_dir(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, String)>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name == ".git" || name == ".agent" {
            continue;
        }
        if path.is_dir() {
            snapshot_dir(root, &path, out)?;
        } else {
            let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            out.push((
                path.strip_prefix(root).unwrap_or(&path).to_path_buf(),
                crate::core::fingerprint::content_hash(&bytes),
            ));
        }
    }
    Ok(())
}
