//! Heuristic extraction of features, bugs and test results from agent prose.
//!
//! This is a best-effort pattern matcher, not a grammar. It is total over any
//! input (worst case: empty lists) and deterministic for a given `now`.
//!
//! Two passes feed the result:
//! 1. A line scan applying independent feature / bug / test patterns.
//! 2. A section scan reading bulleted or numbered lists under well-known
//!    headings, plus aggregate test-summary phrases.
//!
//! Each list is then deduplicated case-insensitively, first occurrence wins.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::core::heuristics::{clean_item, dedup_by_key_ci, extract_feature_name, guess_severity};
use crate::core::soul::{Bug, Feature, TestResult};
use crate::core::types::BugStatus;

static FEATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(implemented|added|created|built|developed)[:：]?\s*(.+)")
        .expect("feature pattern should compile")
});
static BUG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(bug|issue|problem|error|defect|broken)[:：]?\s*(.+)")
        .expect("bug pattern should compile")
});
static FIXED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(fixed|resolved|solved|repaired)[:：]?\s*(.+)")
        .expect("fixed pattern should compile")
});
// Anchored so the lazy name capture runs to the end of the line.
static TEST_PASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(✅|passed?|success(?:ful)?)[:：]?\s*(.+?)(?:\s*test)?$")
        .expect("test pass pattern should compile")
});
static TEST_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(❌|failed?|error)[:：]?\s*(.+?)(?:\s*test)?$")
        .expect("test fail pattern should compile")
});
static LIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[-*•]\s*(.+)|\d+\.\s*(.+))").expect("list item pattern should compile")
});
static SUMMARY_PASSED_FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+) passed.* (\d+) failed").expect("summary pattern should compile")
});
static SUMMARY_TESTS_PASSED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)tests?: (\d+) passed").expect("summary pattern should compile")
});
static SUMMARY_TESTS_FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+) tests? failed").expect("summary pattern should compile")
});

const FEATURE_HEADERS: [&str; 5] = [
    "features implemented",
    "implemented features",
    "new features",
    "features added",
    "completed features",
];
const BUG_HEADERS: [&str; 5] = [
    "known bugs",
    "bugs found",
    "issues found",
    "problems found",
    "current issues",
];
const FEATURE_SECTION_STOP_WORDS: [&str; 3] = ["bug", "test", "issue"];
const BUG_SECTION_STOP_WORDS: [&str; 3] = ["feature", "test", "implement"];
const SECTION_MAX_LINES: usize = 20;

const ALL_TESTS: &str = "All Tests";
const TEST_SUITE: &str = "Test Suite";

/// Candidate facts extracted from one transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractedFeedback {
    pub features: Vec<Feature>,
    pub bugs: Vec<Bug>,
    pub test_results: Vec<TestResult>,
}

impl ExtractedFeedback {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.bugs.is_empty() && self.test_results.is_empty()
    }
}

/// Extract features, bugs and test results attributed to `agent_id`.
pub fn extract_feedback(
    transcript: &str,
    agent_id: &str,
    now: DateTime<Utc>,
) -> ExtractedFeedback {
    let mut feature_texts = Vec::new();
    let mut bug_texts = Vec::new();
    let mut tests = Vec::new();

    for line in transcript.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(text) = capture_cleaned(&FEATURE_RE, line) {
            feature_texts.push(text);
        }
        if !FIXED_RE.is_match(line)
            && let Some(text) = capture_cleaned(&BUG_RE, line)
        {
            bug_texts.push(text);
        }
        if let Some(name) = capture_test_name(&TEST_PASS_RE, line) {
            tests.push((name, true, line.to_string()));
        } else if let Some(name) = capture_test_name(&TEST_FAIL_RE, line) {
            tests.push((name, false, line.to_string()));
        }
    }

    feature_texts.extend(section_items(
        transcript,
        &FEATURE_HEADERS,
        &FEATURE_SECTION_STOP_WORDS,
    ));
    bug_texts.extend(section_items(transcript, &BUG_HEADERS, &BUG_SECTION_STOP_WORDS));
    tests.extend(summary_results(transcript));

    let features = dedup_by_key_ci(feature_texts, |s| s.as_str())
        .into_iter()
        .map(|description| Feature {
            name: extract_feature_name(&description),
            description,
            implemented_at: now,
            agent_id: agent_id.to_string(),
        })
        .collect();

    let stamp = now.format("%Y%m%dT%H%M%S%3f");
    let bugs = dedup_by_key_ci(bug_texts, |s| s.as_str())
        .into_iter()
        .enumerate()
        .map(|(n, description)| Bug {
            id: format!("bug-{stamp}-{}", n + 1),
            severity: guess_severity(&description),
            description,
            status: BugStatus::Open,
            found_at: now,
            fixed_at: None,
            agent_id: agent_id.to_string(),
        })
        .collect();

    let test_results = dedup_by_key_ci(tests, |(name, _, _)| name.as_str())
        .into_iter()
        .map(|(test_name, passed, message)| TestResult {
            test_name,
            passed,
            message,
            executed_at: now,
            agent_id: agent_id.to_string(),
        })
        .collect();

    ExtractedFeedback {
        features,
        bugs,
        test_results,
    }
}

fn capture_cleaned(re: &Regex, line: &str) -> Option<String> {
    let caps = re.captures(line)?;
    let cleaned = clean_item(caps.get(2)?.as_str());
    (!cleaned.is_empty()).then_some(cleaned)
}

fn capture_test_name(re: &Regex, line: &str) -> Option<String> {
    let caps = re.captures(line)?;
    let name = caps.get(2)?.as_str().trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Read the list following the first header (in `headers` order) found in
/// `text`, up to 20 lines, stopping at a line mentioning another category.
fn section_items(text: &str, headers: &[&str], stop_words: &[&str]) -> Vec<String> {
    // ASCII folding keeps byte offsets valid for slicing `text`.
    let lower = text.to_ascii_lowercase();
    let Some(start) = headers.iter().find_map(|header| lower.find(header)) else {
        return Vec::new();
    };

    let mut items = Vec::new();
    for line in text[start..].lines().skip(1).take(SECTION_MAX_LINES) {
        let line = line.trim();
        let line_lower = line.to_lowercase();
        if stop_words.iter().any(|word| line_lower.contains(word)) {
            break;
        }
        let Some(caps) = LIST_ITEM_RE.captures(line) else {
            continue;
        };
        let Some(raw) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let cleaned = clean_item(raw.as_str());
        if !cleaned.is_empty() {
            items.push(cleaned);
        }
    }
    items
}

/// At most one result per aggregate summary pattern.
fn summary_results(text: &str) -> Vec<(String, bool, String)> {
    let mut results = Vec::new();
    if let Some(caps) = SUMMARY_PASSED_FAILED_RE.captures(text) {
        let passed: u64 = caps[1].parse().unwrap_or(0);
        let failed: u64 = caps[2].parse().unwrap_or(0);
        results.push((
            TEST_SUITE.to_string(),
            failed == 0,
            format!("{passed} passed, {failed} failed"),
        ));
    }
    if let Some(caps) = SUMMARY_TESTS_PASSED_RE.captures(text) {
        results.push((
            TEST_SUITE.to_string(),
            true,
            format!("{} tests passed", &caps[1]),
        ));
    }
    if text.to_lowercase().contains("all tests passed") {
        results.push((ALL_TESTS.to_string(), true, "All tests passed".to_string()));
    }
    if let Some(caps) = SUMMARY_TESTS_FAILED_RE.captures(text) {
        results.push((
            TEST_SUITE.to_string(),
            false,
            format!("{} tests failed", &caps[1]),
        ));
    }
    results
}
