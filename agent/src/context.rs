//! Process-wide context for one target repository.
//!
//! The experience cache and configuration are shared mutable state; they
//! are owned here, constructed explicitly at startup, and passed to the
//! pipeline by reference, never reached through ambient singletons.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::io::config::{AgentConfig, load_config};
use crate::io::experience::ExperienceStore;

/// Explicitly constructed pipeline context.
pub struct AgentContext {
    root: PathBuf,
    pub config: AgentConfig,
    pub experience: ExperienceStore,
}

impl AgentContext {
    /// Load configuration and open persistent state for `root`.
    pub fn initialize(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = load_config(&root.join(".agent").join("config.toml"))?;
        ensure_state_gitignore(&root)?;
        let experience = ExperienceStore::for_repo(&root);
        Ok(Self {
            root,
            config,
            experience,
        })
    }

    /// Initialize with an explicit configuration (bench harness, tests).
    pub fn with_config(root: impl Into<PathBuf>, config: AgentConfig) -> Self {
        let root = root.into();
        let _ = ensure_state_gitignore(&root);
        let experience = ExperienceStore::for_repo(&root);
        Self {
            root,
            config,
            experience,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Keep the whole state directory out of version control; `vcs_commit`
/// stages with `add -A` and must never pick up the lock file or cache.
fn ensure_state_gitignore(root: &Path) -> Result<()> {
    let dir = root.join(".agent");
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(".gitignore");
    if !path.exists() {
        fs::write(&path, "*\n").with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}
