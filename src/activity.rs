//! Append-only audit log of tool invocations and observations.
//!
//! Logging never rejects a record for its payload: oversized tool input and
//! output are redacted and truncated instead, so recording an activity can
//! not become the reason a caller's own operation fails.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::db::{format_ts, ts_column};
use crate::error::{TroveError, TroveResult};
use crate::memory::new_id;
use crate::memory::store::{row_to_memory, MEMORY_SELECT};
use crate::memory::types::Memory;

pub const TRUNCATION_MARKER: &str = "\n... [truncated]";
const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PreToolUse,
    PostToolUse,
    Decision,
    Observation,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreToolUse => "pre_tool_use",
            Self::PostToolUse => "post_tool_use",
            Self::Decision => "decision",
            Self::Observation => "observation",
        }
    }
}

impl FromStr for EventType {
    type Err = TroveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_tool_use" => Ok(Self::PreToolUse),
            "post_tool_use" => Ok(Self::PostToolUse),
            "decision" => Ok(Self::Decision),
            "observation" => Ok(Self::Observation),
            other => Err(TroveError::validation(format!("unknown event type: {other}"))),
        }
    }
}

/// Where a slash-command or skill invocation was defined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationScope {
    Universal,
    Project,
    #[default]
    Unknown,
}

impl InvocationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Universal => "universal",
            Self::Project => "project",
            Self::Unknown => "unknown",
        }
    }

    fn from_column(raw: &str) -> Self {
        match raw {
            "universal" => Self::Universal,
            "project" => Self::Project,
            _ => Self::Unknown,
        }
    }
}

/// Input for [`log_activity`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActivity {
    pub event_type: EventType,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<String>,
    #[serde(default)]
    pub tool_output: Option<String>,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub source_server: Option<String>,
    #[serde(default)]
    pub invocation_name: Option<String>,
    #[serde(default)]
    pub invocation_scope: InvocationScope,
}

fn default_success() -> bool {
    true
}

impl NewActivity {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            session_id: None,
            agent_id: None,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            success: true,
            error_message: None,
            duration_ms: None,
            file_path: None,
            source_server: None,
            invocation_name: None,
            invocation_scope: InvocationScope::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub event_type: EventType,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_output: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub file_path: Option<String>,
    pub project_path: String,
    pub source_server: Option<String>,
    pub invocation_name: Option<String>,
    pub invocation_scope: InvocationScope,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityFilter {
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub event_type: Option<EventType>,
    pub tool_name: Option<String>,
    pub source_server: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

const ACTIVITY_SELECT: &str = "\
SELECT id, session_id, agent_id, event_type, tool_name, tool_input, tool_output, success, \
       error_message, duration_ms, file_path, project_path, source_server, invocation_name, \
       invocation_scope, timestamp \
FROM activities";

fn row_to_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Activity> {
    let event_type: String = row.get(3)?;
    let scope: String = row.get(14)?;
    Ok(Activity {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        event_type: event_type.parse().unwrap_or(EventType::Observation),
        tool_name: row.get(4)?,
        tool_input: row.get(5)?,
        tool_output: row.get(6)?,
        success: row.get(7)?,
        error_message: row.get(8)?,
        duration_ms: row.get(9)?,
        file_path: row.get(10)?,
        project_path: row.get(11)?,
        source_server: row.get(12)?,
        invocation_name: row.get(13)?,
        invocation_scope: InvocationScope::from_column(&scope),
        timestamp: ts_column(row, 15)?,
    })
}

/// Server name from a `mcp__<server>__<tool>` tool name.
pub fn server_from_tool_name(tool_name: &str) -> Option<String> {
    let rest = tool_name.strip_prefix("mcp__")?;
    let (server, tool) = rest.split_once("__")?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some(server.to_string())
}

/// Key names whose values never reach the audit log.
fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    const MARKERS: [&str; 9] = [
        "apikey",
        "password",
        "passwd",
        "secret",
        "token",
        "credential",
        "privatekey",
        "sshkey",
        "authorization",
    ];
    normalized == "pwd" || MARKERS.iter().any(|m| normalized.contains(m))
}

fn redact_json_value(value: &mut JsonValue) {
    match value {
        JsonValue::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *inner = JsonValue::String(REDACTED.to_string());
                } else {
                    redact_json_value(inner);
                }
            }
        }
        JsonValue::Array(items) => items.iter_mut().for_each(redact_json_value),
        _ => {}
    }
}

fn inline_secret_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r#"(?i)\b(api[_-]?key|password|passwd|secret|token|credential|private[_-]?key|auth[_-]?token|access[_-]?token)(\s*[:=]\s*)("[^"]*"|'[^']*'|\S+)"#,
            )
            .ok()
        })
        .as_ref()
}

/// Redact secrets from a tool payload. JSON objects and arrays are walked by
/// key; anything else gets `key=value` style assignments masked.
pub fn redact_payload(raw: &str) -> String {
    if let Ok(mut json) = serde_json::from_str::<JsonValue>(raw) {
        if json.is_object() || json.is_array() {
            redact_json_value(&mut json);
            return serde_json::to_string(&json).unwrap_or_else(|_| raw.to_string());
        }
    }
    match inline_secret_pattern() {
        Some(re) => re.replace_all(raw, format!("${{1}}${{2}}{REDACTED}")).into_owned(),
        None => raw.to_string(),
    }
}

/// Cap `text` at `max_chars` characters, marker included.
pub fn truncate_payload(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

fn clean_payload(raw: Option<&str>, max_chars: usize) -> Option<String> {
    raw.map(|text| truncate_payload(&redact_payload(text), max_chars))
}

/// Append one activity. The only failures are storage errors.
pub fn log_activity(
    conn: &Connection,
    project_path: &str,
    new: &NewActivity,
    max_chars: usize,
    now: DateTime<Utc>,
) -> TroveResult<Activity> {
    let id = new_id("act");
    let source_server = new
        .source_server
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| new.tool_name.as_deref().and_then(server_from_tool_name));
    let duration_ms = new.duration_ms.filter(|d| *d >= 0);
    let error_message = new
        .error_message
        .as_deref()
        .map(|e| truncate_payload(e, max_chars));

    conn.execute(
        "INSERT INTO activities (id, session_id, agent_id, event_type, tool_name, tool_input, \
         tool_output, success, error_message, duration_ms, file_path, project_path, \
         source_server, invocation_name, invocation_scope, timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            id,
            new.session_id,
            new.agent_id,
            new.event_type.as_str(),
            new.tool_name,
            clean_payload(new.tool_input.as_deref(), max_chars),
            clean_payload(new.tool_output.as_deref(), max_chars),
            new.success,
            error_message,
            duration_ms,
            new.file_path,
            project_path,
            source_server,
            new.invocation_name,
            new.invocation_scope.as_str(),
            format_ts(&now),
        ],
    )?;

    tracing::debug!(
        activity_id = %id,
        event_type = new.event_type.as_str(),
        tool = new.tool_name.as_deref().unwrap_or(""),
        success = new.success,
        "activity logged"
    );
    get_activity(conn, &id)
}

pub fn get_activity(conn: &Connection, id: &str) -> TroveResult<Activity> {
    let sql = format!("{ACTIVITY_SELECT} WHERE id = ?1");
    conn.query_row(&sql, [id], row_to_activity)
        .optional()?
        .ok_or_else(|| TroveError::not_found("activity", id))
}

fn activity_where(filter: &ActivityFilter, values: &mut Vec<Value>) -> String {
    let mut clauses: Vec<&str> = Vec::new();
    let mut push_text = |clause: &'static str, value: &Option<String>, values: &mut Vec<Value>| {
        if let Some(v) = value {
            clauses.push(clause);
            values.push(Value::Text(v.clone()));
        }
    };
    push_text("session_id = ?", &filter.session_id, values);
    push_text("agent_id = ?", &filter.agent_id, values);
    push_text("tool_name = ?", &filter.tool_name, values);
    push_text("source_server = ?", &filter.source_server, values);

    if let Some(event_type) = filter.event_type {
        clauses.push("event_type = ?");
        values.push(Value::Text(event_type.as_str().to_string()));
    }
    if let Some(success) = filter.success {
        clauses.push("success = ?");
        values.push(Value::Integer(success as i64));
    }
    if let Some(since) = filter.since {
        clauses.push("timestamp >= ?");
        values.push(Value::Text(format_ts(&since)));
    }
    if let Some(until) = filter.until {
        clauses.push("timestamp <= ?");
        values.push(Value::Text(format_ts(&until)));
    }

    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

/// Activities matching `filter`, newest first.
pub fn list_activities(
    conn: &Connection,
    filter: &ActivityFilter,
    limit: usize,
    offset: usize,
) -> TroveResult<Vec<Activity>> {
    let mut values = Vec::new();
    let clause = activity_where(filter, &mut values);
    values.push(Value::Integer(limit as i64));
    values.push(Value::Integer(offset as i64));
    let sql = format!("{ACTIVITY_SELECT}{clause} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), row_to_activity)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_activities(conn: &Connection, filter: &ActivityFilter) -> TroveResult<i64> {
    let mut values = Vec::new();
    let clause = activity_where(filter, &mut values);
    let sql = format!("SELECT COUNT(*) FROM activities{clause}");
    Ok(conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineGrouping {
    #[default]
    Hour,
    Day,
    Session,
}

/// Key used for records outside any session.
pub const NO_SESSION: &str = "no_session";

#[derive(Debug, Clone, Serialize)]
pub struct TimelineGroup {
    pub key: String,
    pub activities: Vec<Activity>,
    pub memories: Vec<Memory>,
}

fn group_key(
    grouping: TimelineGrouping,
    at: DateTime<Utc>,
    session_id: Option<&str>,
) -> String {
    match grouping {
        TimelineGrouping::Hour => at.format("%Y-%m-%dT%H:00Z").to_string(),
        TimelineGrouping::Day => at.format("%Y-%m-%d").to_string(),
        TimelineGrouping::Session => session_id.unwrap_or(NO_SESSION).to_string(),
    }
}

/// Activities and created memories from the last `hours`, grouped by hour,
/// day or session. Groups are newest first; entries inside a group too.
pub fn timeline(
    conn: &Connection,
    hours: u32,
    grouping: TimelineGrouping,
    include_activities: bool,
    include_memories: bool,
    now: DateTime<Utc>,
) -> TroveResult<Vec<TimelineGroup>> {
    let since = now - Duration::hours(hours as i64);
    let mut groups: BTreeMap<String, TimelineGroup> = BTreeMap::new();
    let mut latest: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();

    let mut touch = |key: String, at: DateTime<Utc>| -> String {
        let entry = latest.entry(key.clone()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        key
    };

    if include_activities {
        let filter = ActivityFilter {
            since: Some(since),
            until: Some(now),
            ..Default::default()
        };
        for activity in list_activities(conn, &filter, i64::MAX as usize, 0)? {
            let key = touch(
                group_key(grouping, activity.timestamp, activity.session_id.as_deref()),
                activity.timestamp,
            );
            groups
                .entry(key.clone())
                .or_insert_with(|| empty_group(key))
                .activities
                .push(activity);
        }
    }

    if include_memories {
        let sql = format!(
            "{MEMORY_SELECT} WHERE m.created_at >= ?1 AND m.created_at <= ?2 \
             ORDER BY m.created_at DESC, m.id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let memories = stmt
            .query_map(params![format_ts(&since), format_ts(&now)], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        for memory in memories {
            let key = touch(
                group_key(grouping, memory.created_at, memory.source_session_id.as_deref()),
                memory.created_at,
            );
            groups
                .entry(key.clone())
                .or_insert_with(|| empty_group(key))
                .memories
                .push(memory);
        }
    }

    let mut ordered: Vec<TimelineGroup> = groups.into_values().collect();
    ordered.sort_by(|a, b| {
        latest
            .get(&b.key)
            .cmp(&latest.get(&a.key))
            .then_with(|| b.key.cmp(&a.key))
    });
    Ok(ordered)
}

fn empty_group(key: String) -> TimelineGroup {
    TimelineGroup {
        key,
        activities: Vec::new(),
        memories: Vec::new(),
    }
}
