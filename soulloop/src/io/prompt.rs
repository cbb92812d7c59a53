//! Prompt rendering for development, test and bug-fix iterations.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::decision::PRODUCTION_READY;
use crate::core::soul::{Bug, Soul};

const DEVELOPMENT_TEMPLATE: &str = include_str!("prompts/development.md");
const TEST_TEMPLATE: &str = include_str!("prompts/test.md");
const BUGFIX_TEMPLATE: &str = include_str!("prompts/bugfix.md");

/// Soul fields exposed to templates.
#[derive(Debug, Clone, Serialize)]
struct SoulContext {
    name: String,
    project_path: String,
    objectives: Vec<String>,
    requirements: Vec<String>,
}

impl SoulContext {
    fn from_soul(soul: &Soul) -> Self {
        Self {
            name: soul.name.clone(),
            project_path: soul.project_path.display().to_string(),
            objectives: soul.objectives.clone(),
            requirements: soul.requirements.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct BugContext {
    id: String,
    severity: String,
    description: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("development", DEVELOPMENT_TEMPLATE)
            .expect("development template should be valid");
        env.add_template("test", TEST_TEMPLATE)
            .expect("test template should be valid");
        env.add_template("bugfix", BUGFIX_TEMPLATE)
            .expect("bugfix template should be valid");
        Self { env }
    }

    /// Development prompt; `feedback` is the test output driving a retry.
    pub fn render_development(&self, soul: &Soul, feedback: Option<&str>) -> Result<String> {
        let template = self.env.get_template("development")?;
        let rendered = template
            .render(context! {
                soul => SoulContext::from_soul(soul),
                feedback => feedback.map(str::trim).filter(|s| !s.is_empty()),
                summary => soul.feedback_summary().to_string(),
            })
            .context("render development prompt")?;
        debug!(soul_id = %soul.id, bytes = rendered.len(), "rendered development prompt");
        Ok(rendered)
    }

    pub fn render_test(&self, soul: &Soul) -> Result<String> {
        let template = self.env.get_template("test")?;
        let rendered = template
            .render(context! {
                soul => SoulContext::from_soul(soul),
                ready_token => PRODUCTION_READY,
                summary => soul.feedback_summary().to_string(),
            })
            .context("render test prompt")?;
        debug!(soul_id = %soul.id, bytes = rendered.len(), "rendered test prompt");
        Ok(rendered)
    }

    /// Bug-fix prompt listing `bugs` most severe first.
    pub fn render_bugfix(&self, soul: &Soul, bugs: &[&Bug]) -> Result<String> {
        let mut sorted: Vec<&Bug> = bugs.to_vec();
        sorted.sort_by_key(|bug| bug.severity);
        let bugs: Vec<BugContext> = sorted
            .into_iter()
            .map(|bug| BugContext {
                id: bug.id.clone(),
                severity: bug.severity.as_str().to_string(),
                description: bug.description.clone(),
            })
            .collect();
        let template = self.env.get_template("bugfix")?;
        let rendered = template
            .render(context! {
                soul => SoulContext::from_soul(soul),
                bugs => bugs,
                summary => soul.feedback_summary().to_string(),
            })
            .context("render bugfix prompt")?;
        debug!(soul_id = %soul.id, bytes = rendered.len(), "rendered bugfix prompt");
        Ok(rendered)
    }
}
