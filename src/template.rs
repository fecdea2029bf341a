//! Prompt rendering for phase instructions.
//!
//! Prompts are minijinja templates. The hyphenated `{{issue-number}}`
//! placeholder used by existing osoba configs is not a valid minijinja
//! identifier, so it is rewritten to `{{ issue_number }}` before rendering.

use std::sync::OnceLock;

use minijinja::Environment;
use serde::Serialize;

use crate::labels::Phase;

/// Variables available to a phase prompt.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub issue_number: u64,
    pub issue_title: String,
    pub repo: String,
    pub phase: String,
}

impl PromptContext {
    pub fn new(issue_number: u64, issue_title: &str, repo: &str, phase: Phase) -> Self {
        Self {
            issue_number,
            issue_title: issue_title.to_string(),
            repo: repo.to_string(),
            phase: phase.as_str().to_string(),
        }
    }
}

fn re_legacy_placeholder() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\{\{\s*issue-number\s*\}\}").unwrap())
}

/// Rewrite legacy `{{issue-number}}` placeholders into minijinja syntax.
fn normalize(template: &str) -> String {
    re_legacy_placeholder()
        .replace_all(template, "{{ issue_number }}")
        .into_owned()
}

/// Render a phase prompt template.
pub fn render_prompt(template: &str, ctx: &PromptContext) -> anyhow::Result<String> {
    let source = normalize(template);
    let mut env = Environment::new();
    env.add_template("prompt", &source)?;
    let rendered = env.get_template("prompt")?.render(ctx)?;
    Ok(rendered)
}
