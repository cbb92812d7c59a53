//! Small text heuristics used by the feedback extractor.

use crate::core::types::Severity;

const CRITICAL_KEYWORDS: [&str; 5] = ["crash", "security", "data loss", "critical", "urgent"];
const HIGH_KEYWORDS: [&str; 5] = ["broken", "fail", "error", "cannot", "doesn't work"];
const LOW_KEYWORDS: [&str; 4] = ["minor", "cosmetic", "typo", "improvement"];

/// Keywords that anchor the name window of a long feature description.
const FEATURE_KEYWORDS: [&str; 14] = [
    "API",
    "authentication",
    "login",
    "database",
    "UI",
    "frontend",
    "backend",
    "endpoint",
    "route",
    "component",
    "function",
    "method",
    "class",
    "module",
];

const SHORT_NAME_MAX_CHARS: usize = 50;
const WINDOW_MARGIN_CHARS: usize = 20;
const ELLIPSIS: &str = "...";

/// Infer severity from a bug description. First matching tier wins:
/// critical, then high, then low; medium otherwise.
pub fn guess_severity(description: &str) -> Severity {
    let lower = description.to_lowercase();
    let contains_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if contains_any(&CRITICAL_KEYWORDS) {
        Severity::Critical
    } else if contains_any(&HIGH_KEYWORDS) {
        Severity::High
    } else if contains_any(&LOW_KEYWORDS) {
        Severity::Low
    } else {
        Severity::Medium
    }
}

/// Derive a short feature label from its description.
///
/// Descriptions of at most 50 chars are returned verbatim. Longer ones get a
/// window of 20 chars either side of the first vocabulary keyword found, or
/// the first 50 chars when no keyword occurs. Both long forms end in `...`.
pub fn extract_feature_name(description: &str) -> String {
    let chars: Vec<char> = description.chars().collect();
    if chars.len() <= SHORT_NAME_MAX_CHARS {
        return description.to_string();
    }

    let lower: Vec<char> = chars.iter().map(|c| fold_char(*c)).collect();
    for keyword in FEATURE_KEYWORDS {
        let needle: Vec<char> = keyword.chars().map(fold_char).collect();
        if let Some(idx) = find_chars(&lower, &needle) {
            let start = idx.saturating_sub(WINDOW_MARGIN_CHARS);
            let end = (idx + needle.len() + WINDOW_MARGIN_CHARS).min(chars.len());
            let window: String = chars[start..end].iter().collect();
            return format!("{window}{ELLIPSIS}");
        }
    }

    let prefix: String = chars[..SHORT_NAME_MAX_CHARS].iter().collect();
    format!("{prefix}{ELLIPSIS}")
}

/// Normalize a captured list item or line remainder.
///
/// Strips a leading bullet (`- `, `* `, `• `), trailing `.`/`,`, and one pair
/// of surrounding quotes.
pub fn clean_item(raw: &str) -> String {
    let mut text = raw.trim();
    for bullet in ["- ", "* ", "• "] {
        if let Some(rest) = text.strip_prefix(bullet) {
            text = rest.trim_start();
            break;
        }
    }
    text = text.trim_end_matches(['.', ',']).trim_end();
    for quote in ['"', '\'', '`'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            text = text[quote.len_utf8()..text.len() - quote.len_utf8()].trim();
            break;
        }
    }
    text.to_string()
}

/// Keep the first occurrence of each case-insensitively equal key, in order.
pub fn dedup_by_key_ci<T, F>(items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item).to_lowercase()))
        .collect()
}

// ASCII-only folding keeps char indices aligned with the original text.
fn fold_char(c: char) -> char {
    c.to_ascii_lowercase()
}

fn find_chars(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
