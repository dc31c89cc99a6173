//! Core memory type definitions.
//!
//! Defines [`MemoryType`] (the closed category set), [`MemoryStatus`]
//! (review lifecycle), [`Memory`] (a full record) and the input shapes used
//! to create, update and list memories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Importance assigned when the caller gives none.
pub const DEFAULT_IMPORTANCE: u32 = 50;
pub const MIN_IMPORTANCE: u32 = 1;
pub const MAX_IMPORTANCE: u32 = 100;

/// Memory categories. Unrecognized input resolves to [`MemoryType::General`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    General,
    Warning,
    Tip,
    Config,
    Troubleshooting,
    Code,
    Error,
    Solution,
    Command,
    Concept,
    Decision,
}

impl MemoryType {
    pub const ALL: [MemoryType; 11] = [
        Self::General,
        Self::Warning,
        Self::Tip,
        Self::Config,
        Self::Troubleshooting,
        Self::Code,
        Self::Error,
        Self::Solution,
        Self::Command,
        Self::Concept,
        Self::Decision,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Warning => "warning",
            Self::Tip => "tip",
            Self::Config => "config",
            Self::Troubleshooting => "troubleshooting",
            Self::Code => "code",
            Self::Error => "error",
            Self::Solution => "solution",
            Self::Command => "command",
            Self::Concept => "concept",
            Self::Decision => "decision",
        }
    }

    /// One-line description, for callers that list the categories.
    pub fn description(&self) -> &'static str {
        match self {
            Self::General => "General information",
            Self::Warning => "Warnings and cautions",
            Self::Tip => "Tips and best practices",
            Self::Config => "Configuration details",
            Self::Troubleshooting => "Debugging and troubleshooting steps",
            Self::Code => "Code snippets and patterns",
            Self::Error => "Errors and their causes",
            Self::Solution => "Solutions to problems",
            Self::Command => "Useful commands",
            Self::Concept => "Concepts and explanations",
            Self::Decision => "Decisions and their rationale",
        }
    }

    /// Lenient parse used at the caller boundary: anything unknown is `General`.
    pub fn from_input(raw: &str) -> Self {
        raw.trim()
            .to_ascii_lowercase()
            .parse()
            .unwrap_or(Self::General)
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown memory type: {s}"))
    }
}

/// Review lifecycle of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    #[default]
    Fresh,
    NeedsReview,
    Outdated,
    Archived,
}

impl MemoryStatus {
    pub const ALL: [MemoryStatus; 4] = [
        Self::Fresh,
        Self::NeedsReview,
        Self::Outdated,
        Self::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::NeedsReview => "needs_review",
            Self::Outdated => "outdated",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown memory status: {s}"))
    }
}

/// A memory record, matching the `memories` table plus its tag set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// `mem_` + UUID v7 (time-sortable).
    pub id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub status: MemoryStatus,
    /// Stored importance in `[1, 100]`. Decay is applied at read time.
    pub base_importance: u32,
    /// Normalized, sorted, deduplicated.
    pub tags: Vec<String>,
    pub access_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_session_id: Option<String>,
    /// Set only on global-store copies: the project the memory came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_project: Option<String>,
    pub embedding_pending: bool,
}

/// Input for creating a memory.
#[derive(Debug, Clone, Default)]
pub struct NewMemory {
    pub content: String,
    pub context: Option<String>,
    /// Explicit type wins over categorization.
    pub memory_type: Option<MemoryType>,
    pub tags: Vec<String>,
    /// `[1, 100]`, defaults to [`DEFAULT_IMPORTANCE`].
    pub importance: Option<i64>,
    /// Existing memories to link with `related_to`.
    pub related_ids: Vec<String>,
    /// Supplying a vector skips the background embedding queue.
    pub embedding: Option<Vec<f32>>,
    pub source_session_id: Option<String>,
}

impl NewMemory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Partial update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct MemoryUpdate {
    pub content: Option<String>,
    /// `Some("")` clears the context.
    pub context: Option<String>,
    pub memory_type: Option<MemoryType>,
    pub status: Option<MemoryStatus>,
    pub importance: Option<i64>,
    /// Replaces the whole tag set.
    pub tags: Option<Vec<String>>,
    pub add_tags: Vec<String>,
    pub remove_tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

impl MemoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.context.is_none()
            && self.memory_type.is_none()
            && self.status.is_none()
            && self.importance.is_none()
            && self.tags.is_none()
            && self.add_tags.is_empty()
            && self.remove_tags.is_empty()
            && self.embedding.is_none()
    }

    /// Whether the FTS row must be rebuilt. Tags are indexed there.
    pub fn touches_fts(&self) -> bool {
        self.touches_embedding_text()
            || self.tags.is_some()
            || !self.add_tags.is_empty()
            || !self.remove_tags.is_empty()
    }

    /// Whether the embedded text (content plus context) changes.
    pub fn touches_embedding_text(&self) -> bool {
        self.content.is_some() || self.context.is_some()
    }
}

/// Predicates shared by list and search. Empty vectors mean "no constraint".
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub types: Vec<MemoryType>,
    pub statuses: Vec<MemoryStatus>,
    /// Matches memories carrying any of these tags.
    pub tags: Vec<String>,
    pub min_importance: Option<u32>,
    pub max_importance: Option<u32>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Archived memories are excluded unless set, or unless `statuses`
    /// names `Archived` explicitly.
    pub include_archived: bool,
    /// Substring match on `source_project` (global store).
    pub project: Option<String>,
    pub source_session_id: Option<String>,
}

/// Sort contract for list operations. Ties always fall back to `id DESC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    LastAccessed,
    Created,
    Importance,
    AccessCount,
}

impl SortOrder {
    pub(crate) fn order_by(&self) -> &'static str {
        match self {
            Self::LastAccessed => "m.last_accessed_at DESC, m.id DESC",
            Self::Created => "m.created_at DESC, m.id DESC",
            Self::Importance => "m.base_importance DESC, m.id DESC",
            Self::AccessCount => "m.access_count DESC, m.id DESC",
        }
    }
}

/// Lowercase, trim and hyphenate inner whitespace. Empty tags are dropped.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let tag = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    (!tag.is_empty()).then_some(tag)
}

/// Normalize, dedupe and sort a tag collection.
pub fn normalize_tags<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|t| normalize_tag(t.as_ref()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Check an importance value and default it.
pub fn resolve_importance(raw: Option<i64>) -> crate::error::TroveResult<u32> {
    match raw {
        None => Ok(DEFAULT_IMPORTANCE),
        Some(v) if (MIN_IMPORTANCE as i64..=MAX_IMPORTANCE as i64).contains(&v) => Ok(v as u32),
        Some(v) => Err(crate::error::TroveError::validation(format!(
            "importance must be between {MIN_IMPORTANCE} and {MAX_IMPORTANCE}, got {v}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_type_round_trips_through_str() {
        for t in MemoryType::ALL {
            assert_eq!(t.as_str().parse::<MemoryType>().unwrap(), t);
        }
    }

    #[test]
    fn unknown_type_input_falls_back_to_general() {
        assert_eq!(MemoryType::from_input("gotcha"), MemoryType::General);
        assert_eq!(MemoryType::from_input(" Warning "), MemoryType::Warning);
        assert!("gotcha".parse::<MemoryType>().is_err());
    }

    #[test]
    fn tags_are_normalized_and_deduplicated() {
        let tags = normalize_tags(["Rust", "rust", "  async  io ", "", "db"]);
        assert_eq!(tags, vec!["async-io", "db", "rust"]);
    }

    #[test]
    fn importance_is_range_checked() {
        assert_eq!(resolve_importance(None).unwrap(), DEFAULT_IMPORTANCE);
        assert_eq!(resolve_importance(Some(1)).unwrap(), 1);
        assert_eq!(resolve_importance(Some(100)).unwrap(), 100);
        assert!(resolve_importance(Some(0)).is_err());
        assert!(resolve_importance(Some(101)).is_err());
    }

    #[test]
    fn memory_serializes_type_field() {
        let now = Utc::now();
        let memory = Memory {
            id: "mem_1".into(),
            content: "x".into(),
            context: None,
            memory_type: MemoryType::Tip,
            status: MemoryStatus::NeedsReview,
            base_importance: 50,
            tags: vec![],
            access_count: 0,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            source_session_id: None,
            source_project: None,
            embedding_pending: false,
        };
        let json = serde_json::to_value(&memory).unwrap();
        assert_eq!(json["type"], "tip");
        assert_eq!(json["status"], "needs_review");
        assert!(json.get("context").is_none());
    }
}
