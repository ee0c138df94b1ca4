//! Completion-service client.
//!
//! The [`Completion`] trait decouples the pipeline from the text-generation
//! backend. The production implementation shells out to a configured
//! command (prompt on stdin, completion on stdout); tests and benchmark
//! replay use scripted implementations that return predetermined outputs
//! without spawning processes.

use std::fmt;
use std::process::Command;
use std::time::Duration;

use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Parameters for one completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Typed completion failures.
#[derive(Debug)]
pub enum CompletionError {
    /// Spawn or pipe failure; worth a bounded retry.
    Transient(String),
    /// The service returned non-zero: a well-formed rejection, never retried.
    Rejected { exit_code: Option<i32>, detail: String },
    /// The service exceeded its deadline.
    Timeout(Duration),
    /// Output did not match the expected schema.
    Malformed(String),
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionError::Transient(detail) => write!(f, "transient completion failure: {detail}"),
            CompletionError::Rejected { exit_code, detail } => {
                write!(f, "completion rejected (exit {exit_code:?}): {detail}")
            }
            CompletionError::Timeout(timeout) => {
                write!(f, "completion timed out after {timeout:?}")
            }
            CompletionError::Malformed(detail) => write!(f, "malformed completion output: {detail}"),
        }
    }
}

impl std::error::Error for CompletionError {}

/// Abstraction over text-generation backends.
pub trait Completion {
    /// Produce a completion for the prompt. Must not have repository side
    /// effects; all mutation goes through the tool layer.
    fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

/// Completion backend that spawns a configured command.
pub struct CommandCompletion {
    command: Vec<String>,
}

impl CommandCompletion {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Completion for CommandCompletion {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .map_err(|err| CompletionError::Transient(format!("{err:#}")))?;

        if output.timed_out {
            warn!("completion command timed out");
            return Err(CompletionError::Timeout(request.timeout));
        }
        if !output.status.success() {
            return Err(CompletionError::Rejected {
                exit_code: output.status.code(),
                detail: output.stderr_lossy().trim().to_string(),
            });
        }
        debug!(bytes = output.stdout.len(), "completion received");
        Ok(output.stdout_lossy())
    }
}

/// Call the service, retrying transient failures up to `retries` times.
/// Rejections, timeouts, and malformed output are never retried here.
pub fn complete_with_retries(
    completion: &dyn Completion,
    request: &CompletionRequest,
    retries: u32,
) -> Result<String, CompletionError> {
    let mut attempt = 0;
    loop {
        match completion.complete(request) {
            Err(CompletionError::Transient(detail)) if attempt < retries => {
                attempt += 1;
                warn!(attempt, retries, detail = %detail, "retrying transient completion failure");
            }
            other => return other,
        }
    }
}

/// Call the service and decode schema-constrained JSON output.
///
/// The raw text may wrap the JSON in markdown fences or prose; the first
/// balanced JSON object is extracted, validated against `schema`
/// (Draft 2020-12), then deserialized.
pub fn complete_json<T: DeserializeOwned>(
    completion: &dyn Completion,
    request: &CompletionRequest,
    schema: &str,
    retries: u32,
) -> Result<T, CompletionError> {
    let raw = complete_with_retries(completion, request, retries)?;
    decode_json(&raw, schema)
}

/// Extract, validate, and deserialize a JSON object from completion text.
pub fn decode_json<T: DeserializeOwned>(raw: &str, schema: &str) -> Result<T, CompletionError> {
    let json_text = extract_json_object(raw)
        .ok_or_else(|| CompletionError::Malformed("no JSON object in output".to_string()))?;
    let instance: Value = serde_json::from_str(json_text)
        .map_err(|err| CompletionError::Malformed(format!("parse json: {err}")))?;
    let schema_json: Value = serde_json::from_str(schema)
        .map_err(|err| CompletionError::Malformed(format!("parse schema: {err}")))?;

    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema_json)
        .map_err(|err| CompletionError::Malformed(format!("compile schema: {err}")))?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(CompletionError::Malformed(format!(
            "schema validation failed: {}",
            messages.join("; ")
        )));
    }

    serde_json::from_value(instance)
        .map_err(|err| CompletionError::Malformed(format!("deserialize: {err}")))
}

/// Find the first balanced top-level JSON object in free text.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    const SAMPLE_SCHEMA: &str = r#"{
        "type": "object",
        "required": ["name", "count"],
        "properties": {
            "name": {"type": "string"},
            "count": {"type": "integer"}
        }
    }"#;

    struct Scripted(&'static str);

    impl Completion for Scripted {
        fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
            Ok(self.0.to_string())
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            prompt: "prompt".to_string(),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn decodes_fenced_json() {
        const RAW: &str = "```json\n{\"name\": \"x\", \"count\": 2}\n```";
        let sample: Sample =
            complete_json(&Scripted(RAW), &request(), SAMPLE_SCHEMA, 0).expect("decode");
        assert_eq!(
            sample,
            Sample {
                name: "x".to_string(),
                count: 2
            }
        );
    }

    #[test]
    fn schema_violation_is_malformed() {
        let err = complete_json::<Sample>(
            &Scripted("{\"name\": \"x\", \"count\": \"two\"}"),
            &request(),
            SAMPLE_SCHEMA,
            0,
        )
        .expect_err("schema violation");
        assert!(matches!(err, CompletionError::Malformed(_)));
    }

    #[test]
    fn prose_without_json_is_malformed() {
        let err = complete_json::<Sample>(&Scripted("no json here"), &request(), SAMPLE_SCHEMA, 0)
            .expect_err("no json");
        assert!(matches!(err, CompletionError::Malformed(_)));
    }

    #[test]
    fn transient_failures_are_retried_then_surface() {
        struct AlwaysTransient;
        impl Completion for AlwaysTransient {
            fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
                Err(CompletionError::Transient("boom".to_string()))
            }
        }
        let err = complete_with_retries(&AlwaysTransient, &request(), 2).expect_err("exhausted");
        assert!(matches!(err, CompletionError::Transient(_)));
    }

    #[test]
    fn rejection_is_not_retried() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);

        struct Rejecting;
        impl Completion for Rejecting {
            fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Err(CompletionError::Rejected {
                    exit_code: Some(1),
                    detail: "refused".to_string(),
                })
            }
        }
        let err = complete_with_retries(&Rejecting, &request(), 3).expect_err("rejected");
        assert!(matches!(err, CompletionError::Rejected { .. }));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn extracts_nested_objects() {
        let raw = "prefix {\"a\": {\"b\": 1}, \"c\": \"}\"} suffix";
        assert_eq!(extract_json_object(raw), Some("{\"a\": {\"b\": 1}, \"c\": \"}\"}"));
    }

    #[test]
    fn command_completion_runs_subprocess() {
        let completion = CommandCompletion::new(vec!["cat".to_string(), "-".to_string()]);
        let out = completion
            .complete(&CompletionRequest {
                prompt: "echoed".to_string(),
                timeout: Duration::from_secs(5),
                output_limit_bytes: 1024,
            })
            .expect("complete");
        assert_eq!(out, "echoed");
    }

    #[test]
    fn command_completion_rejection_has_exit_code() {
        let completion = CommandCompletion::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo nope >&2; exit 3".to_string(),
        ]);
        let err = completion
            .complete(&CompletionRequest {
                prompt: String::new(),
                timeout: Duration::from_secs(5),
                output_limit_bytes: 1024,
            })
            .expect_err("rejected");
        match err {
            CompletionError::Rejected { exit_code, detail } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(detail, "nope");
            }
            other => panic!("expected rejection, got {other}"),
        }
    }
}
