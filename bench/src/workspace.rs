//! Workspace creation for task cases.
//!
//! Each task case runs in an isolated git repository seeded from its case
//! file, with an `agent.toml` carrying the case's verification command.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use agent::io::manifest::{Manifest, VerifyConfig, write_manifest};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};

use crate::case::TaskCase;

/// An isolated workspace for running a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Absolute path to the workspace root.
    pub root: PathBuf,
    /// Workspace directory name (case id, timestamp, random suffix).
    pub name: String,
}

/// Create an isolated workspace for running a task case.
///
/// The workspace is a fresh git repository with the case's seed files and a
/// generated manifest, committed clean before the pipeline runs.
pub fn create_workspace(base_dir: &Path, case_id: &str, task: &TaskCase) -> Result<Workspace> {
    fs::create_dir_all(base_dir)
        .with_context(|| format!("create workspace dir {}", base_dir.display()))?;

    let timestamp = generate_timestamp();
    let short_id = generate_short_id();
    let name = build_workspace_name(case_id, &timestamp, &short_id);
    let root = base_dir.join(&name);
    fs::create_dir_all(&root)
        .with_context(|| format!("create workspace root {}", root.display()))?;

    run_git(&root, &["init"])?;
    run_git(&root, &["config", "user.name", "Bench"])?;
    run_git(&root, &["config", "user.email", "bench@local.invalid"])?;

    for seed in &task.files {
        let path = root.join(&seed.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, &seed.contents)
            .with_context(|| format!("write seed {}", path.display()))?;
    }

    let manifest = Manifest {
        verify: VerifyConfig {
            command: task.verify_command.clone(),
        },
        ..Manifest::default()
    };
    write_manifest(&root, &manifest)?;

    let seed = format!("case_id: {case_id}\ncreated_at: {timestamp}\n");
    fs::write(root.join("README.txt"), seed)
        .with_context(|| format!("write seed {}", root.display()))?;

    run_git(&root, &["add", "."])?;
    run_git(&root, &["commit", "-m", "chore(bench): bootstrap workspace"])?;

    let status = run_git(&root, &["status", "--porcelain"])?;
    if !status.trim().is_empty() {
        bail!("workspace has uncommitted changes after bootstrap");
    }

    Ok(Workspace { root, name })
}

pub fn build_workspace_name(case_id: &str, timestamp: &str, short_id: &str) -> String {
    format!("{case_id}_{timestamp}_{short_id}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

fn run_git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("run git {:?}", args))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {:?} failed: {}", args, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::Check;
    use tempfile::tempdir;

    fn sample_task() -> TaskCase {
        TaskCase {
            request: "do the thing".to_string(),
            files: vec![crate::case::SeedFile {
                path: PathBuf::from("src/x.rs"),
                contents: "pub fn x() {}\n".to_string(),
            }],
            completions: vec!["{}".to_string()],
            verify_command: vec!["true".to_string()],
            checks: vec![Check::TaskCompleted],
            env: Default::default(),
        }
    }

    #[test]
    fn workspace_name_uses_expected_format() {
        let name = build_workspace_name("case", "20260808_120000", "abc123");
        assert_eq!(name, "case_20260808_120000_abc123");
    }

    #[test]
    fn creates_seeded_clean_workspace() {
        let temp = tempdir().expect("tempdir");
        let workspace = create_workspace(temp.path(), "case", &sample_task()).expect("workspace");

        assert!(workspace.root.join(".git").exists());
        assert!(workspace.root.join("src/x.rs").exists());
        assert!(workspace.root.join("agent.toml").exists());

        let status = run_git(&workspace.root, &["status", "--porcelain"]).expect("status");
        assert!(status.trim().is_empty());
    }
}
