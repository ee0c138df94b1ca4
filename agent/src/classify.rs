//! Orchestrated intent classification: rule layer first, completion
//! fallback second, clarification whenever neither is confident.
//!
//! This is a pure function of its inputs plus the completion call; it has
//! no repository side effects.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::core::intent::{Classification, Intent, classify_rules};
use crate::io::completion::{Completion, CompletionRequest, complete_json};
use crate::io::config::AgentConfig;
use crate::io::prompt::{INTENT_SCHEMA, PromptEngine};

#[derive(Debug, Deserialize)]
struct IntentJson {
    intent: Intent,
    confidence: f64,
    #[serde(default)]
    clarifying_question: Option<String>,
}

/// Classify a request, consulting the completion service only when the
/// deterministic rule layer abstains.
///
/// The contract is hard: ambiguous input always yields [`Intent::Clarify`]
/// with a non-empty question. A failed or malformed completion fallback is
/// ambiguity, not an error.
#[instrument(skip_all)]
pub fn classify(
    request: &str,
    recent_context: Option<&str>,
    completion: &dyn Completion,
    config: &AgentConfig,
) -> Classification {
    if let Some(classification) = classify_rules(request) {
        debug!(intent = classification.intent.as_str(), "rule layer matched");
        return classification;
    }

    let engine = PromptEngine::new(config.prompt_budget_bytes);
    let prompt = match engine.render_classify(request, recent_context) {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!(err = %err, "classify prompt failed to render");
            return fallback_clarify(request);
        }
    };

    let completion_request = CompletionRequest {
        prompt,
        timeout: Duration::from_secs(config.completion_timeout_secs),
        output_limit_bytes: config.output_limit_bytes,
    };

    match complete_json::<IntentJson>(
        completion,
        &completion_request,
        INTENT_SCHEMA,
        config.completion_retries,
    ) {
        Ok(parsed) => interpret(parsed, request, config.clarify_threshold),
        Err(err) => {
            warn!(err = %err, "completion fallback failed, clarifying");
            fallback_clarify(request)
        }
    }
}

fn interpret(parsed: IntentJson, request: &str, threshold: f64) -> Classification {
    if parsed.intent == Intent::Clarify {
        let question = parsed
            .clarifying_question
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| fallback_question(request));
        return Classification::clarify(question);
    }
    if parsed.confidence < threshold {
        debug!(
            confidence = parsed.confidence,
            threshold, "confidence below threshold, clarifying"
        );
        return Classification::clarify(fallback_question(request));
    }
    Classification {
        intent: parsed.intent,
        confidence: parsed.confidence,
        clarifying_question: None,
    }
}

fn fallback_clarify(request: &str) -> Classification {
    Classification::clarify(fallback_question(request))
}

fn fallback_question(request: &str) -> String {
    format!(
        "I'm not sure what \"{}\" asks for. Could you name the file or module and what should change?",
        request.trim()
    )
}
