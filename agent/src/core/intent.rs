//! Deterministic rule layer of the intent classifier.
//!
//! High-signal phrases are matched against a curated pattern table before
//! any completion call is made. The rule layer either produces a confident
//! classification, detects input too vague to act on, or abstains so the
//! orchestration layer can fall back to the completion service.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Closed set of request intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    /// Conversational request; no repository action.
    Chat,
    /// Find or open a file or directory.
    Locate,
    /// Run a command (tests, builds, diagnostics).
    Execute,
    /// Research on the web; outside this pipeline's scope, surfaced as-is.
    Browse,
    /// Change code in the target repository.
    CodeTask,
    /// Too ambiguous to act; ask a follow-up question instead of guessing.
    Clarify,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Chat => "chat",
            Intent::Locate => "locate",
            Intent::Execute => "execute",
            Intent::Browse => "browse",
            Intent::CodeTask => "code-task",
            Intent::Clarify => "clarify",
        }
    }
}

/// Result of classifying a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    /// 0.0..=1.0; rule matches are high-confidence by construction.
    pub confidence: f64,
    /// Present exactly when `intent` is [`Intent::Clarify`].
    pub clarifying_question: Option<String>,
}

impl Classification {
    pub fn clarify(question: impl Into<String>) -> Self {
        Self {
            intent: Intent::Clarify,
            confidence: 1.0,
            clarifying_question: Some(question.into()),
        }
    }

    fn rule(intent: Intent, confidence: f64) -> Self {
        Self {
            intent,
            confidence,
            clarifying_question: None,
        }
    }
}

static LOCATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(open|show|where is|locate|find)\s+\S").expect("locate pattern")
});

static EXECUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(run|execute|build|compile|lint|format)\s+\S|^run tests?\b")
        .expect("execute pattern")
});

static BROWSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^search\s+(the\s+)?web\s+for\s+|^(look\s+up|research|google|browse)\s+\S")
        .expect("browse pattern")
});

static CODE_TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(refactor|debug|implement|fix|rewrite|optimi[sz]e)\s+\S|^(add|write|create)\s+.*(test|function|class|method|module|logging|handler|endpoint|file)|\bfix\s+(the\s+)?bug\b",
    )
    .expect("code-task pattern")
});

static CONVERSATIONAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(who|what|how|why|when)\s+(is|are|do|does|can|would|about)\b|^(can|could|would)\s+you\s+(tell|explain)|^(thanks?|thank\s+you)\b|^(yes|no|okay|ok|sure)\b",
    )
    .expect("conversational pattern")
});

/// Path-looking token: contains a separator or a known source extension.
static FILE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[/\\]|\.(rs|py|js|ts|go|java|c|cpp|h|sh|toml|ya?ml|json|md|txt|conf)\b")
        .expect("file ref pattern")
});

const GREETINGS: &[&str] = &[
    "hello",
    "hi",
    "hey",
    "howdy",
    "greetings",
    "good morning",
    "good afternoon",
    "good evening",
];

const ACTION_VERBS: &[&str] = &[
    "open", "edit", "find", "show", "run", "check", "refactor", "debug", "search", "browse",
    "fix", "create", "delete", "move", "copy", "install", "build", "test", "add", "write",
    "implement", "rename", "update",
];

/// Classify using the deterministic rule table only.
///
/// Returns `None` when no rule fires; the caller decides whether to fall
/// back to the completion service. Vague inputs never return `None`: they
/// classify as [`Intent::Clarify`] with a generated question, so ambiguity
/// cannot silently fall through to guessing.
pub fn classify_rules(request: &str) -> Option<Classification> {
    let trimmed = request.trim();
    if trimmed.is_empty() {
        return Some(Classification::clarify(
            "The request is empty. What would you like me to do?",
        ));
    }

    let lowered = trimmed.to_lowercase();
    let cleaned = lowered.trim_end_matches(['!', '.', ',', '?']);
    if GREETINGS.contains(&cleaned) {
        return Some(Classification::rule(Intent::Chat, 1.0));
    }

    if let Some(question) = vague_question(trimmed) {
        return Some(Classification::clarify(question));
    }

    if CONVERSATIONAL_RE.is_match(trimmed) {
        return Some(Classification::rule(Intent::Chat, 0.95));
    }
    if BROWSE_RE.is_match(trimmed) {
        return Some(Classification::rule(Intent::Browse, 0.9));
    }
    if EXECUTE_RE.is_match(trimmed) {
        return Some(Classification::rule(Intent::Execute, 0.9));
    }
    if CODE_TASK_RE.is_match(trimmed) {
        return Some(Classification::rule(Intent::CodeTask, 0.85));
    }
    if LOCATE_RE.is_match(trimmed) {
        return Some(Classification::rule(Intent::Locate, 0.85));
    }

    None
}

/// Detect input too vague to act on and produce the follow-up question.
///
/// A short request is vague when it carries no file reference and either no
/// action verb (a bare noun) or no concrete target ("fix it").
pub fn vague_question(request: &str) -> Option<String> {
    let tokens: Vec<&str> = request.split_whitespace().collect();
    if tokens.len() > 3 {
        return None;
    }
    if FILE_REF_RE.is_match(request) {
        return None;
    }

    let lowered = request.to_lowercase();
    let has_verb = ACTION_VERBS
        .iter()
        .any(|verb| lowered.split_whitespace().any(|tok| tok == *verb));
    // Only non-verb, non-pronoun tokens count as a target: "fix it" names
    // a verb and a pronoun, not a target.
    let has_concrete_target = tokens.iter().any(|tok| {
        let lower = tok.to_lowercase();
        lower.len() > 2
            && !PRONOUNS.contains(&lower.as_str())
            && !ACTION_VERBS.contains(&lower.as_str())
    });

    // "fix it": verb but only a pronoun target. "database": target but no verb.
    if has_verb && has_concrete_target {
        return None;
    }
    if !has_verb && tokens.len() == 1 {
        return Some(format!(
            "What should I do with \"{}\"? For example: fix a bug in it, add a feature, or run its tests.",
            request.trim()
        ));
    }
    if has_verb && !has_concrete_target {
        return Some(format!(
            "\"{}\" does not name a target. Which file or module should I work on?",
            request.trim()
        ));
    }
    None
}

const PRONOUNS: &[&str] = &["it", "this", "that", "them", "the", "a", "an", "my", "me"];

/// Rough size estimate for a request, recorded on the task for diagnosis.
/// Word count plus a point per file reference and per conjunction.
pub fn complexity(request: &str) -> u32 {
    let words = request.split_whitespace().count() as u32;
    let file_refs = FILE_REF_RE.find_iter(request).count() as u32;
    let conjunctions = request
        .split_whitespace()
        .filter(|tok| matches!(tok.to_lowercase().as_str(), "and" | "then" | "also"))
        .count() as u32;
    words / 4 + file_refs + conjunctions * 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_is_chat() {
        let c = classify_rules("hello!").expect("rule hit");
        assert_eq!(c.intent, Intent::Chat);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn bare_noun_is_clarify_with_question() {
        let c = classify_rules("database").expect("rule hit");
        assert_eq!(c.intent, Intent::Clarify);
        let question = c.clarifying_question.expect("question");
        assert!(!question.is_empty());
    }

    #[test]
    fn fix_it_without_context_is_clarify() {
        let c = classify_rules("fix it").expect("rule hit");
        assert_eq!(c.intent, Intent::Clarify);
        assert!(c.clarifying_question.is_some());
    }

    #[test]
    fn fix_named_file_is_code_task() {
        let c = classify_rules("fix the bug in main.rs").expect("rule hit");
        assert_eq!(c.intent, Intent::CodeTask);
    }

    #[test]
    fn add_logging_is_code_task() {
        let c = classify_rules("add logging to module x").expect("rule hit");
        assert_eq!(c.intent, Intent::CodeTask);
    }

    #[test]
    fn run_tests_is_execute() {
        let c = classify_rules("run tests").expect("rule hit");
        assert_eq!(c.intent, Intent::Execute);
    }

    #[test]
    fn open_path_is_locate() {
        let c = classify_rules("open src/lib.rs").expect("rule hit");
        assert_eq!(c.intent, Intent::Locate);
    }

    #[test]
    fn web_search_is_browse() {
        let c = classify_rules("search the web for rust iterators").expect("rule hit");
        assert_eq!(c.intent, Intent::Browse);
    }

    #[test]
    fn conversational_question_is_chat_not_browse() {
        let c = classify_rules("what is your name").expect("rule hit");
        assert_eq!(c.intent, Intent::Chat);
    }

    #[test]
    fn ambiguous_sentence_abstains() {
        assert!(classify_rules("the parser seems slow on big inputs sometimes").is_none());
    }

    #[test]
    fn complexity_grows_with_files_and_conjunctions() {
        let simple = complexity("fix main.rs");
        let compound = complexity("fix main.rs and then update lib.rs and also the tests");
        assert!(compound > simple);
    }
}
