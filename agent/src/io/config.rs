//! Agent configuration stored under `.agent/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Trust level for plan approval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Plans require interactive approval before Apply.
    Interactive,
    /// Plans are approved automatically; the approval event is still recorded.
    Auto,
}

/// Agent configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Verify -> Plan retries before the task fails terminally.
    pub retry_budget: u32,

    /// Hard timeout for `run_command` tool calls, in seconds.
    pub command_timeout_secs: u64,

    /// Hard timeout for one completion-service call, in seconds.
    pub completion_timeout_secs: u64,

    /// Automatic retries for transient completion failures.
    pub completion_retries: u32,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Experience cache entry time-to-live, in seconds.
    pub cache_ttl_secs: u64,

    /// How long to wait for the repository lock before failing `Busy`.
    pub lock_timeout_secs: u64,

    /// Classifier confidence below this yields a clarifying question.
    pub clarify_threshold: f64,

    /// Byte budget for rendered prompts before context sections are trimmed.
    pub prompt_budget_bytes: usize,

    pub trust: TrustLevel,

    pub completion: CompletionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompletionConfig {
    /// Command implementing `complete(prompt) -> text`: prompt on stdin,
    /// completion on stdout, non-zero exit for a well-formed rejection.
    pub command: Vec<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm-complete".to_string()],
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            command_timeout_secs: 60,
            completion_timeout_secs: 120,
            completion_retries: 2,
            output_limit_bytes: 100_000,
            cache_ttl_secs: 7 * 24 * 60 * 60,
            lock_timeout_secs: 10,
            clarify_threshold: 0.6,
            prompt_budget_bytes: 40_000,
            trust: TrustLevel::Interactive,
            completion: CompletionConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_budget == 0 {
            return Err(anyhow!("retry_budget must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.completion_timeout_secs == 0 {
            return Err(anyhow!("completion_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.clarify_threshold) {
            return Err(anyhow!("clarify_threshold must be within 0.0..=1.0"));
        }
        if self.completion.command.is_empty() || self.completion.command[0].trim().is_empty() {
            return Err(anyhow!("completion.command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = AgentConfig {
            trust: TrustLevel::Auto,
            retry_budget: 5,
            ..AgentConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn zero_retry_budget_is_rejected() {
        let cfg = AgentConfig {
            retry_budget: 0,
            ..AgentConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_completion_command_is_rejected() {
        let cfg = AgentConfig {
            completion: CompletionConfig { command: Vec::new() },
            ..AgentConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
