//! Phase state machine contracts.
//!
//! The transition table is explicit data so illegal phase jumps are a
//! validation failure rather than a latent bug. Records are append-only
//! and owned by the task that produced them.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Pipeline phases, including terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Explore,
    Plan,
    Apply,
    Verify,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Explore => "explore",
            Phase::Plan => "plan",
            Phase::Apply => "apply",
            Phase::Verify => "verify",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

/// Whether `from -> to` is a legal transition.
///
/// Verify may loop back to Plan (bounded by the retry budget, enforced by
/// the task driver); Plan may return to Explore on rejection; any active
/// phase may fail.
pub fn can_transition(from: Phase, to: Phase) -> bool {
    use Phase::{Apply, Completed, Explore, Failed, Plan, Verify};
    match from {
        Explore => matches!(to, Plan | Failed),
        Plan => matches!(to, Apply | Explore | Failed),
        Apply => matches!(to, Verify | Failed),
        Verify => matches!(to, Completed | Plan | Failed),
        Completed | Failed => false,
    }
}

/// Outcome of a single tool invocation, logged into the owning record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Tool kind, e.g. `read_file`.
    pub kind: String,
    /// Parameters as passed, serialized for audit.
    pub params: serde_json::Value,
    /// `"ok"` or the typed error kind, e.g. `"timeout"`.
    pub outcome: String,
    /// Human-readable result or error summary.
    pub message: String,
}

/// Append-only record of one phase execution.
///
/// Timestamps are RFC 3339 strings so records serialize without pulling
/// date types into every consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub retry_index: u32,
    pub started_at: String,
    pub ended_at: Option<String>,
    /// Snapshot of phase inputs (request, bundle summary, failure detail).
    pub inputs: String,
    /// Snapshot of phase outputs (plan summary, verify detail).
    pub outputs: String,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl PhaseRecord {
    pub fn start(phase: Phase, retry_index: u32, inputs: impl Into<String>) -> Self {
        Self {
            phase,
            retry_index,
            started_at: Utc::now().to_rfc3339(),
            ended_at: None,
            inputs: inputs.into(),
            outputs: String::new(),
            tool_calls: Vec::new(),
        }
    }

    pub fn finish(&mut self, outputs: impl Into<String>, tool_calls: Vec<ToolCallRecord>) {
        self.ended_at = Some(Utc::now().to_rfc3339());
        self.outputs = outputs.into();
        self.tool_calls = tool_calls;
    }
}

/// How a plan approval was decided. Always recorded, even when automatic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    Auto,
    Interactive,
}
