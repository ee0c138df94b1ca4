//! Prompt rendering for completion-service calls.
//!
//! Each phase has a minijinja template compiled in at build time. Context
//! sections are clamped to the configured byte budget before rendering so a
//! large repository cannot blow up a prompt.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

const CLASSIFY_TEMPLATE: &str = include_str!("prompts/classify.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const EDIT_TEMPLATE: &str = include_str!("prompts/edit.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");

pub const INTENT_SCHEMA: &str = include_str!("../../schemas/intent.schema.json");
pub const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");
pub const EDITS_SCHEMA: &str = include_str!("../../schemas/edits.schema.json");
pub const REVIEW_SCHEMA: &str = include_str!("../../schemas/review.schema.json");

/// One file shown to the edit prompt, with 0-based line numbers.
#[derive(Debug, Clone, Serialize)]
pub struct NumberedFile {
    pub path: String,
    pub numbered: String,
}

impl NumberedFile {
    pub fn new(path: impl Into<String>, content: &str) -> Self {
        let numbered = content
            .lines()
            .enumerate()
            .map(|(index, line)| format!("{index:4}| {line}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            path: path.into(),
            numbered,
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptEngine {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("classify", CLASSIFY_TEMPLATE)
            .expect("classify template should be valid");
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        env.add_template("edit", EDIT_TEMPLATE)
            .expect("edit template should be valid");
        env.add_template("review", REVIEW_TEMPLATE)
            .expect("review template should be valid");
        Self { env, budget_bytes }
    }

    pub fn render_classify(&self, request: &str, recent_context: Option<&str>) -> Result<String> {
        let template = self.env.get_template("classify")?;
        template
            .render(context! {
                request => request.trim(),
                recent_context => recent_context
                    .map(|s| clamp(s, self.budget_bytes / 4))
                    .filter(|s| !s.is_empty()),
            })
            .context("render classify prompt")
    }

    pub fn render_plan(
        &self,
        task: &str,
        project_kind: &str,
        verify_command: &str,
        context_bundle: &str,
        feedback: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template("plan")?;
        template
            .render(context! {
                task => task.trim(),
                project_kind => project_kind,
                verify_command => verify_command,
                context => clamp(context_bundle, self.budget_bytes),
                feedback => feedback.map(|s| clamp(s, self.budget_bytes / 4)).filter(|s| !s.is_empty()),
            })
            .context("render plan prompt")
    }

    pub fn render_edit(
        &self,
        task: &str,
        step_description: &str,
        step_files: &str,
        files: &[NumberedFile],
    ) -> Result<String> {
        let template = self.env.get_template("edit")?;
        template
            .render(context! {
                task => task.trim(),
                step_description => step_description.trim(),
                step_files => step_files,
                files => files,
            })
            .context("render edit prompt")
    }

    pub fn render_review(
        &self,
        task: &str,
        changes: &str,
        verify_output: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template("review")?;
        template
            .render(context! {
                task => task.trim(),
                changes => clamp(changes, self.budget_bytes),
                verify_output => verify_output
                    .map(|s| clamp(s, self.budget_bytes / 2))
                    .filter(|s| !s.is_empty()),
            })
            .context("render review prompt")
    }
}

/// Truncate to a byte budget on a char boundary, marking the cut.
fn clamp(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let mut end = budget.saturating_sub(12).min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated]", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_prompt_embeds_request() {
        let engine = PromptEngine::new(10_000);
        let prompt = engine.render_classify("fix the parser", None).expect("render");
        assert!(prompt.contains("<request>"));
        assert!(prompt.contains("fix the parser"));
        assert!(!prompt.contains("<recent-context>"));
    }

    #[test]
    fn classify_prompt_includes_context_when_present() {
        let engine = PromptEngine::new(10_000);
        let prompt = engine
            .render_classify("fix it", Some("we were discussing src/parser.rs"))
            .expect("render");
        assert!(prompt.contains("<recent-context>"));
        assert!(prompt.contains("src/parser.rs"));
    }

    #[test]
    fn plan_prompt_sections_are_ordered() {
        let engine = PromptEngine::new(10_000);
        let prompt = engine
            .render_plan("add logging", "rust", "cargo test", "file contents", Some("too broad"))
            .expect("render");
        let contract = prompt.find("<contract>").expect("contract");
        let task = prompt.find("<task>").expect("task");
        let ctx = prompt.find("<context>").expect("context");
        let feedback = prompt.find("<feedback>").expect("feedback");
        assert!(contract < task && task < ctx && ctx < feedback);
    }

    #[test]
    fn oversized_context_is_clamped() {
        let engine = PromptEngine::new(200);
        let big = "x".repeat(5_000);
        let prompt = engine
            .render_plan("task", "rust", "cargo test", &big, None)
            .expect("render");
        assert!(prompt.contains("[truncated]"));
        assert!(prompt.len() < 2_000);
    }

    #[test]
    fn edit_prompt_numbers_lines_from_zero() {
        let file = NumberedFile::new("src/a.rs", "first\nsecond\n");
        assert!(file.numbered.contains("   0| first"));
        assert!(file.numbered.contains("   1| second"));

        let engine = PromptEngine::new(10_000);
        let prompt = engine
            .render_edit("task", "change second line", "src/a.rs", &[file])
            .expect("render");
        assert!(prompt.contains("<file path=\"src/a.rs\">"));
    }

    #[test]
    fn schemas_are_valid_json() {
        for schema in [INTENT_SCHEMA, PLAN_SCHEMA, EDITS_SCHEMA, REVIEW_SCHEMA] {
            serde_json::from_str::<serde_json::Value>(schema).expect("schema parses");
        }
    }
}
