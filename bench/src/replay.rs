//! Replay completion backend for deterministic benchmark runs.
//!
//! Task cases carry their completion outputs verbatim; replaying them makes
//! the suite a fixed seed (same cases, same inputs, same scores), which is
//! what lets before/after aggregates be compared during self-improvement.

use std::collections::VecDeque;
use std::sync::Mutex;

use agent::io::completion::{Completion, CompletionError, CompletionRequest};

/// Completion that replays case-scripted outputs in order.
///
/// An exhausted queue is a well-formed rejection: the case under-scripted
/// its run and the pipeline fails deterministically instead of hanging.
pub struct ReplayCompletion {
    outputs: Mutex<VecDeque<String>>,
}

impl ReplayCompletion {
    pub fn new(outputs: &[String]) -> Self {
        Self {
            outputs: Mutex::new(outputs.iter().cloned().collect()),
        }
    }
}

impl Completion for ReplayCompletion {
    fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
        self.outputs
            .lock()
            .expect("replay queue lock")
            .pop_front()
            .ok_or_else(|| CompletionError::Rejected {
                exit_code: Some(1),
                detail: "replay outputs exhausted".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request() -> CompletionRequest {
        CompletionRequest {
            prompt: "p".to_string(),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 1024,
        }
    }

    #[test]
    fn replays_in_order_then_rejects() {
        let replay = ReplayCompletion::new(&["one".to_string(), "two".to_string()]);
        assert_eq!(replay.complete(&request()).expect("one"), "one");
        assert_eq!(replay.complete(&request()).expect("two"), "two");
        let err = replay.complete(&request()).expect_err("exhausted");
        assert!(matches!(err, CompletionError::Rejected { .. }));
    }
}
