//! Rule-based categorization of new memories.
//!
//! Type rules are ordered: the first matching rule wins, and content that
//! matches nothing is `general`. Tag rules are all applied; their output is
//! merged with the caller's tags.

use regex::Regex;
use std::sync::OnceLock;

use crate::memory::types::{normalize_tags, MemoryType};

/// Result of categorizing one piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Categorization {
    pub memory_type: MemoryType,
    pub tags: Vec<String>,
}

struct Rules {
    types: Vec<(MemoryType, Regex)>,
    tags: Vec<(&'static str, Regex)>,
}

const TYPE_RULES: &[(MemoryType, &str)] = &[
    (MemoryType::Warning, r"(?i)^\s*(?:warning|caution|danger)\b"),
    (
        MemoryType::Error,
        r"\b[A-Z][A-Za-z]*(?:Error|Exception)\b|(?i:\b(?:traceback|stack trace|panicked at|segmentation fault)\b)",
    ),
    (
        MemoryType::Command,
        r"(?m)^\s*(?:\$|>)\s*\S|(?i)^\s*(?:npm|npx|yarn|pnpm|cargo|git|pip|uv|docker|kubectl|make|curl|brew|apt(?:-get)?)\s+\S",
    ),
    (
        MemoryType::Solution,
        r"(?i)\b(?:fixed|solved|resolved|the fix|solution|workaround)\b",
    ),
    (
        MemoryType::Troubleshooting,
        r"(?i)\b(?:debug(?:ging)?|troubleshoot\w*|diagnos\w*|investigat\w*|root cause)\b",
    ),
    (
        MemoryType::Decision,
        r"(?i)\b(?:decided|decision|chose to|we chose|opted|going with)\b",
    ),
    (
        MemoryType::Config,
        r"(?i)\bconfig(?:uration)?\b|\bsettings?\b|\benv(?:ironment)? var|\.(?:env|toml|ya?ml|ini)\b",
    ),
    (
        MemoryType::Code,
        r"(?m)^\s*(?:fn|def|class|function|const|let|import|pub|struct|impl)\s|```",
    ),
    (
        MemoryType::Warning,
        r"(?i)\b(?:never|avoid|do not|don't|beware|careful)\b",
    ),
    (
        MemoryType::Tip,
        r"(?i)\b(?:tip|use|prefer|always|best practice|should|recommend\w*|consider)\b",
    ),
    (
        MemoryType::Concept,
        r"(?i)\b(?:is a|refers to|means|concept|defined as)\b",
    ),
];

const TAG_RULES: &[(&str, &str)] = &[
    ("rust", r"(?i)\b(?:rust|cargo)\b|\.rs\b"),
    ("python", r"(?i)\b(?:python|pip|pytest)\b|\.py\b"),
    ("javascript", r"(?i)\b(?:javascript|node(?:js)?|npm|yarn)\b|\.js\b"),
    ("typescript", r"(?i)\btypescript\b|\.tsx?\b"),
    ("git", r"(?i)\bgit\b"),
    ("docker", r"(?i)\b(?:docker|container\w*)\b"),
    ("database", r"(?i)\b(?:sql|sqlite|postgres\w*|mysql|database)\b"),
    ("testing", r"(?i)\b(?:tests?|testing|unit test)\b"),
    ("api", r"(?i)\b(?:api|endpoint|http|rest)\b"),
    ("security", r"(?i)\b(?:auth\w*|security|password|token|secret)\b"),
    (
        "performance",
        r"(?i)\b(?:performance|latency|slow|optimi[sz]\w*|cach(?:e|ing))\b",
    ),
];

fn build_rules() -> Option<Rules> {
    let types = TYPE_RULES
        .iter()
        .map(|(t, pattern)| Regex::new(pattern).ok().map(|re| (*t, re)))
        .collect::<Option<Vec<_>>>()?;
    let tags = TAG_RULES
        .iter()
        .map(|(tag, pattern)| Regex::new(pattern).ok().map(|re| (*tag, re)))
        .collect::<Option<Vec<_>>>()?;
    Some(Rules { types, tags })
}

fn rules() -> Option<&'static Rules> {
    static RULES: OnceLock<Option<Rules>> = OnceLock::new();
    RULES.get_or_init(build_rules).as_ref()
}

/// First matching type rule, or `general`.
pub fn detect_type(content: &str) -> MemoryType {
    rules()
        .and_then(|r| {
            r.types
                .iter()
                .find(|(_, re)| re.is_match(content))
                .map(|(t, _)| *t)
        })
        .unwrap_or(MemoryType::General)
}

/// Tags suggested by content patterns.
pub fn suggest_tags(content: &str) -> Vec<String> {
    rules()
        .map(|r| {
            r.tags
                .iter()
                .filter(|(_, re)| re.is_match(content))
                .map(|(tag, _)| (*tag).to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve type and tags for new content. Explicit type wins; tags are the
/// normalized union of explicit and suggested tags.
pub fn categorize(
    content: &str,
    explicit_type: Option<MemoryType>,
    explicit_tags: &[String],
) -> Categorization {
    let memory_type = explicit_type.unwrap_or_else(|| detect_type(content));
    let suggested = suggest_tags(content);
    let tags = normalize_tags(explicit_tags.iter().chain(suggested.iter()));
    Categorization { memory_type, tags }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_rules_compile() {
        assert!(rules().is_some());
    }

    #[test]
    fn detects_warning_command_and_error() {
        assert_eq!(
            detect_type("WARNING: Never use eval() with untrusted input."),
            MemoryType::Warning
        );
        assert_eq!(detect_type("$ npm install express"), MemoryType::Command);
        assert_eq!(
            detect_type("TypeError: Cannot read property 'foo' of undefined"),
            MemoryType::Error
        );
    }

    #[test]
    fn advice_is_a_tip() {
        assert_eq!(
            detect_type("Use exponential backoff for retries"),
            MemoryType::Tip
        );
    }

    #[test]
    fn other_rules_fire_in_order() {
        assert_eq!(
            detect_type("Fixed the flaky login by pinning the clock"),
            MemoryType::Solution
        );
        assert_eq!(
            detect_type("We decided to keep SQLite for the local store"),
            MemoryType::Decision
        );
        assert_eq!(
            detect_type("Set RUST_LOG in the .env file"),
            MemoryType::Config
        );
        assert_eq!(
            detect_type("fn main() {\n    run();\n}"),
            MemoryType::Code
        );
    }

    #[test]
    fn unmatched_content_is_general() {
        assert_eq!(detect_type("the meeting went well"), MemoryType::General);
    }

    #[test]
    fn explicit_type_wins() {
        let c = categorize("$ cargo build", Some(MemoryType::Concept), &[]);
        assert_eq!(c.memory_type, MemoryType::Concept);
    }

    #[test]
    fn tags_merge_explicit_and_suggested() {
        let c = categorize(
            "Run the tests with pytest before pushing to git",
            None,
            &["CI".to_string(), "python".to_string()],
        );
        assert_eq!(c.tags, vec!["ci", "git", "python", "testing"]);
    }
}
