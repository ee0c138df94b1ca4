//! Plan and step types produced by the Plan phase.
//!
//! A plan is validated structurally when produced and never mutated
//! afterwards; Apply consumes it read-only.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Modify,
    Create,
    Delete,
    Run,
}

/// A single plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    pub action: StepAction,
    /// Repository-relative paths this step is allowed to touch.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

/// Ordered list of steps for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    /// Validate structure: non-empty, described steps, relative confined
    /// paths, and no file shared between two steps (same-file patches are
    /// serialized by construction; see the concurrency model).
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            bail!("plan has no steps");
        }
        let mut seen: BTreeSet<&Path> = BTreeSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.description.trim().is_empty() {
                bail!("steps[{index}] has an empty description");
            }
            if step.files.is_empty() && step.action != StepAction::Run {
                bail!("steps[{index}] names no target files");
            }
            for file in &step.files {
                validate_relative(file)
                    .map_err(|err| anyhow::anyhow!("steps[{index}] {err}"))?;
                if !seen.insert(file.as_path()) {
                    bail!(
                        "steps[{index}] targets {} which an earlier step already targets",
                        file.display()
                    );
                }
            }
        }
        Ok(())
    }

    /// All file paths the plan touches, in step order.
    pub fn target_files(&self) -> Vec<&Path> {
        self.steps
            .iter()
            .flat_map(|step| step.files.iter().map(PathBuf::as_path))
            .collect()
    }
}

/// Reject absolute paths and parent-directory escapes.
pub fn validate_relative(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("names an empty path");
    }
    if path.is_absolute() {
        bail!("names an absolute path {}", path.display());
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            bail!("path {} escapes the repository root", path.display());
        }
    }
    Ok(())
}
