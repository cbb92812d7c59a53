//! Entity model for a tracked project ("soul").
//!
//! Mutators are the only way state changes and every one of them bumps
//! `updated_at`. Storage is value-like: the store hands out owned copies, so
//! references returned here are only valid until the next mutation.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::generate_id;
use crate::core::types::{BugStatus, IterationKind, Severity, SoulStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Soul {
    pub id: String,
    pub name: String,
    /// Absolute project path; unique across the store.
    pub project_path: PathBuf,
    pub objectives: Vec<String>,
    pub requirements: Vec<String>,
    pub status: SoulStatus,
    pub feedback: Feedback,
    pub iterations: Vec<Iteration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Accumulated knowledge about the soul's implementation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub implemented_features: Vec<Feature>,
    pub known_bugs: Vec<Bug>,
    pub test_results: Vec<TestResult>,
    pub last_updated: DateTime<Utc>,
}

impl Feedback {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            implemented_features: Vec::new(),
            known_bugs: Vec::new(),
            test_results: Vec::new(),
            last_updated: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub description: String,
    pub implemented_at: DateTime<Utc>,
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bug {
    pub id: String,
    pub description: String,
    pub severity: Severity,
    pub status: BugStatus,
    pub found_at: DateTime<Utc>,
    pub fixed_at: Option<DateTime<Utc>>,
    pub agent_id: String,
}

impl Bug {
    pub fn is_unfixed(&self) -> bool {
        self.status != BugStatus::Fixed && self.fixed_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub passed: bool,
    pub message: String,
    pub executed_at: DateTime<Utc>,
    pub agent_id: String,
}

/// One agent run belonging to a soul.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    /// 1-based, strictly increasing per soul.
    pub number: u32,
    pub agent_id: String,
    pub kind: IterationKind,
    pub purpose: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the agent is running; set exactly once.
    pub completed_at: Option<DateTime<Utc>>,
    pub result: String,
}

/// Running context appended to every prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackSummary {
    pub features: usize,
    pub open_bugs: usize,
    pub tests_passed: usize,
    pub tests_total: usize,
}

impl fmt::Display for FeedbackSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} features implemented, {} open bugs, {}/{} tests passing",
            self.features, self.open_bugs, self.tests_passed, self.tests_total
        )
    }
}

impl Soul {
    /// Create a soul in `Standby` with empty feedback and no iterations.
    ///
    /// An empty `name` is replaced by the project folder name.
    pub fn new(project_path: impl Into<PathBuf>, name: &str) -> Self {
        let project_path = project_path.into();
        let now = Utc::now();
        let name = if name.trim().is_empty() {
            folder_name(&project_path)
        } else {
            name.trim().to_string()
        };
        Self {
            id: generate_id("soul"),
            name,
            project_path,
            objectives: Vec::new(),
            requirements: Vec::new(),
            status: SoulStatus::Standby,
            feedback: Feedback::empty(now),
            iterations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_objectives(&mut self, objectives: Vec<String>) {
        self.objectives = objectives;
        self.touch();
    }

    pub fn set_requirements(&mut self, requirements: Vec<String>) {
        self.requirements = requirements;
        self.touch();
    }

    pub fn set_status(&mut self, status: SoulStatus) {
        self.status = status;
        self.touch();
    }

    /// Append a running iteration numbered `len + 1` and return it.
    pub fn start_iteration(&mut self, agent_id: &str, kind: IterationKind) -> &Iteration {
        let number = self.iterations.len() as u32 + 1;
        self.iterations.push(Iteration {
            number,
            agent_id: agent_id.to_string(),
            kind,
            purpose: kind.purpose().to_string(),
            started_at: Utc::now(),
            completed_at: None,
            result: String::new(),
        });
        self.touch();
        &self.iterations[self.iterations.len() - 1]
    }

    /// Stamp the first still-running iteration with this agent id.
    ///
    /// Returns `None` without touching anything when no iteration matches, so
    /// duplicate or out-of-order completion signals are harmless.
    pub fn complete_iteration(&mut self, agent_id: &str, result: &str) -> Option<&Iteration> {
        let idx = self
            .iterations
            .iter()
            .position(|it| it.agent_id == agent_id && it.completed_at.is_none())?;
        let iteration = &mut self.iterations[idx];
        iteration.completed_at = Some(Utc::now());
        iteration.result = result.to_string();
        self.touch();
        Some(&self.iterations[idx])
    }

    /// The most recent iteration whose agent has not reported back.
    ///
    /// Iterations live in the store, so this is visible to every process
    /// sharing it, unlike an executor's in-memory view.
    pub fn open_iteration(&self) -> Option<&Iteration> {
        self.iterations.iter().rev().find(|it| it.completed_at.is_none())
    }

    /// Close every open iteration with `result`. Returns how many were closed.
    pub fn abandon_open_iterations(&mut self, result: &str) -> usize {
        let now = Utc::now();
        let mut closed = 0;
        for iteration in self.iterations.iter_mut().filter(|it| it.completed_at.is_none()) {
            iteration.completed_at = Some(now);
            iteration.result = result.to_string();
            closed += 1;
        }
        if closed > 0 {
            self.touch();
        }
        closed
    }

    pub fn add_implemented_feature(&mut self, feature: Feature) {
        self.feedback.implemented_features.push(feature);
        self.touch_feedback();
    }

    pub fn add_bug(&mut self, bug: Bug) {
        self.feedback.known_bugs.push(bug);
        self.touch_feedback();
    }

    pub fn add_test_result(&mut self, result: TestResult) {
        self.feedback.test_results.push(result);
        self.touch_feedback();
    }

    /// Mark a bug fixed. Returns `false` if no bug has this id.
    pub fn mark_bug_fixed(&mut self, bug_id: &str) -> bool {
        let Some(bug) = self.feedback.known_bugs.iter_mut().find(|b| b.id == bug_id) else {
            return false;
        };
        bug.status = BugStatus::Fixed;
        bug.fixed_at = Some(Utc::now());
        self.touch_feedback();
        true
    }

    pub fn unfixed_bugs(&self) -> Vec<&Bug> {
        self.feedback
            .known_bugs
            .iter()
            .filter(|bug| bug.is_unfixed())
            .collect()
    }

    pub fn feedback_summary(&self) -> FeedbackSummary {
        let results = &self.feedback.test_results;
        FeedbackSummary {
            features: self.feedback.implemented_features.len(),
            open_bugs: self.unfixed_bugs().len(),
            tests_passed: results.iter().filter(|r| r.passed).count(),
            tests_total: results.len(),
        }
    }

    /// Output of the most recent completed test iteration, if any.
    pub fn last_test_output(&self) -> Option<&str> {
        self.iterations
            .iter()
            .rev()
            .find(|it| it.kind == IterationKind::Test && it.completed_at.is_some())
            .map(|it| it.result.as_str())
    }

    pub fn iteration_for_agent(&self, agent_id: &str) -> Option<&Iteration> {
        self.iterations.iter().find(|it| it.agent_id == agent_id)
    }

    fn touch_feedback(&mut self) {
        self.touch();
        self.feedback.last_updated = self.updated_at;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.created_at);
    }
}

fn folder_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
