//! Session boundaries, end-of-session synopses and continuity context.
//!
//! A session is sealed exactly once. When the caller does not supply a
//! summary, [`end_session`] derives a short statistical synopsis from the
//! activities recorded under the session id; nothing here generates prose.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::activity::EventType;
use crate::db::{format_ts, opt_ts_column, ts_column};
use crate::error::{TroveError, TroveResult};
use crate::memory::new_id;

/// Tools whose `file_path` only reads a file.
const READ_ONLY_TOOLS: [&str; 4] = ["Read", "Glob", "Grep", "LS"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_path: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub key_learnings: Vec<String>,
    pub key_decisions: Vec<String>,
    pub errors_encountered: Vec<String>,
    pub files_modified: Vec<String>,
}

impl Session {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Result of [`start_session`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionStart {
    pub session: Session,
    /// True when the id already existed and that session was returned.
    pub resumed: bool,
    pub context_summary: Option<String>,
}

/// Which parts of previous sessions go into a continuity summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextFlags {
    pub include_decisions: bool,
    pub include_errors: bool,
    pub include_learnings: bool,
}

impl Default for ContextFlags {
    fn default() -> Self {
        Self {
            include_decisions: true,
            include_errors: true,
            include_learnings: false,
        }
    }
}

/// Activity-derived detail for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub project_path: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub total_activities: i64,
    pub tool_usage: BTreeMap<String, i64>,
    pub files_modified: Vec<String>,
    pub errors: Vec<String>,
    pub memories_created: i64,
    pub key_learnings: Vec<String>,
    pub key_decisions: Vec<String>,
}

const SESSION_SELECT: &str = "\
SELECT id, project_path, started_at, ended_at, summary, key_learnings, key_decisions, \
       errors_encountered, files_modified \
FROM sessions";

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        project_path: row.get(1)?,
        started_at: ts_column(row, 2)?,
        ended_at: opt_ts_column(row, 3)?,
        summary: row.get(4)?,
        key_learnings: json_list(row.get(5)?),
        key_decisions: json_list(row.get(6)?),
        errors_encountered: json_list(row.get(7)?),
        files_modified: json_list(row.get(8)?),
    })
}

pub fn find_session(conn: &Connection, id: &str) -> TroveResult<Option<Session>> {
    let sql = format!("{SESSION_SELECT} WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_session).optional()?)
}

pub fn get_session(conn: &Connection, id: &str) -> TroveResult<Session> {
    find_session(conn, id)?.ok_or_else(|| TroveError::not_found("session", id))
}

/// Most recent sessions, newest start first. `ended_only` restricts to
/// sealed sessions ordered by end time instead.
pub fn recent_sessions(
    conn: &Connection,
    project_path: Option<&str>,
    ended_only: bool,
    limit: usize,
) -> TroveResult<Vec<Session>> {
    let order = if ended_only {
        "ended_at DESC, id DESC"
    } else {
        "started_at DESC, id DESC"
    };
    let sql = format!(
        "{SESSION_SELECT} WHERE (?1 IS NULL OR project_path = ?1) \
         AND (?2 = 0 OR ended_at IS NOT NULL) ORDER BY {order} LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![project_path, ended_only, limit as i64], row_to_session)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Start (or resume) a session.
///
/// An existing `session_id` is returned as-is; hooks may have created the
/// row before the caller asked. With `provide_context`, the summary covers
/// the `depth` most recently ended sessions of the same project.
pub fn start_session(
    conn: &Connection,
    session_id: Option<&str>,
    project_path: &str,
    provide_context: bool,
    depth: usize,
    now: DateTime<Utc>,
) -> TroveResult<SessionStart> {
    let requested = session_id.map(str::trim).filter(|s| !s.is_empty());

    let (session, resumed) = match requested.map(|id| find_session(conn, id)).transpose()? {
        Some(Some(existing)) => (existing, true),
        _ => {
            let id = requested
                .map(str::to_string)
                .unwrap_or_else(|| new_id("sess"));
            conn.execute(
                "INSERT INTO sessions (id, project_path, started_at) VALUES (?1, ?2, ?3)",
                params![id, project_path, format_ts(&now)],
            )?;
            tracing::info!(session_id = %id, project = project_path, "session started");
            (get_session(conn, &id)?, false)
        }
    };

    let context_summary = if provide_context {
        let text = context_summary(
            conn,
            Some(&session.project_path),
            depth,
            ContextFlags::default(),
        )?;
        Some(text)
    } else {
        None
    };

    Ok(SessionStart {
        session,
        resumed,
        context_summary,
    })
}

/// Seal a session. A second call returns the already-ended session unchanged.
pub fn end_session(
    conn: &Connection,
    session_id: &str,
    summary: Option<&str>,
    key_learnings: Option<&[String]>,
    now: DateTime<Utc>,
) -> TroveResult<Session> {
    let session = get_session(conn, session_id)?;
    if session.is_ended() {
        tracing::debug!(session_id, "session already ended");
        return Ok(session);
    }

    let detail = session_summary(conn, session_id)?;
    let summary = summary
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| synopsis(&detail));

    let learnings = key_learnings
        .map(|l| l.to_vec())
        .unwrap_or(session.key_learnings);
    let mut decisions = session.key_decisions;
    for decision in detail.key_decisions {
        if !decisions.contains(&decision) {
            decisions.push(decision);
        }
    }

    conn.execute(
        "UPDATE sessions SET ended_at = ?2, summary = ?3, key_learnings = ?4, key_decisions = ?5, \
         errors_encountered = ?6, files_modified = ?7 WHERE id = ?1 AND ended_at IS NULL",
        params![
            session_id,
            format_ts(&now),
            summary,
            serde_json::to_string(&learnings)?,
            serde_json::to_string(&decisions)?,
            serde_json::to_string(&detail.errors)?,
            serde_json::to_string(&detail.files_modified)?,
        ],
    )?;

    tracing::info!(
        session_id,
        activities = detail.total_activities,
        files = detail.files_modified.len(),
        "session ended"
    );
    get_session(conn, session_id)
}

/// Deterministic one-line digest of a session's recorded work.
fn synopsis(detail: &SessionSummary) -> String {
    let mut tools: Vec<(&String, &i64)> = detail.tool_usage.iter().collect();
    tools.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let top: Vec<String> = tools
        .iter()
        .take(5)
        .map(|(name, count)| format!("{name} x{count}"))
        .collect();

    let mut text = format!("{} activities", detail.total_activities);
    if !top.is_empty() {
        text.push_str(&format!(" ({})", top.join(", ")));
    }
    text.push_str(&format!(
        "; {} files modified; {} errors; {} memories created",
        detail.files_modified.len(),
        detail.errors.len(),
        detail.memories_created
    ));
    text
}

/// Activity-derived statistics for a session, ended or not.
pub fn session_summary(conn: &Connection, session_id: &str) -> TroveResult<SessionSummary> {
    let session = get_session(conn, session_id)?;

    let mut stmt = conn.prepare(
        "SELECT event_type, tool_name, tool_input, tool_output, success, error_message, file_path \
         FROM activities WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut total_activities = 0;
    let mut tool_usage: BTreeMap<String, i64> = BTreeMap::new();
    let mut seen_files = BTreeSet::new();
    let mut files_modified = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut key_decisions: Vec<String> = Vec::new();

    for (event_type, tool, input, output, success, error, file) in rows {
        total_activities += 1;
        let event_type = event_type.parse().unwrap_or(EventType::Observation);

        if let Some(tool) = &tool {
            if event_type != EventType::PreToolUse {
                *tool_usage.entry(tool.clone()).or_default() += 1;
            }
        }
        if let Some(file) = file {
            let read_only = tool.as_deref().is_some_and(|t| READ_ONLY_TOOLS.contains(&t));
            if success && !read_only && seen_files.insert(file.clone()) {
                files_modified.push(file);
            }
        }
        if !success {
            let message = error.unwrap_or_else(|| {
                format!("{} failed", tool.as_deref().unwrap_or("activity"))
            });
            if !errors.contains(&message) {
                errors.push(message);
            }
        }
        if event_type == EventType::Decision {
            if let Some(text) = input.or(output).filter(|t| !t.trim().is_empty()) {
                if !key_decisions.contains(&text) {
                    key_decisions.push(text);
                }
            }
        }
    }

    let memories_created: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE source_session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?;

    for decision in &session.key_decisions {
        if !key_decisions.contains(decision) {
            key_decisions.push(decision.clone());
        }
    }

    Ok(SessionSummary {
        session_id: session.id,
        project_path: session.project_path,
        started_at: session.started_at,
        ended_at: session.ended_at,
        summary: session.summary,
        total_activities,
        tool_usage,
        files_modified,
        errors,
        memories_created,
        key_learnings: session.key_learnings,
        key_decisions,
    })
}

/// Continuity text from the `depth` most recently ended sessions, newest
/// first. Empty when there is no history.
pub fn context_summary(
    conn: &Connection,
    project_path: Option<&str>,
    depth: usize,
    flags: ContextFlags,
) -> TroveResult<String> {
    let sessions = recent_sessions(conn, project_path, true, depth)?;
    let mut blocks = Vec::with_capacity(sessions.len());

    for session in sessions {
        let ended = session
            .ended_at
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_default();
        let mut lines = vec![format!("Session {} (ended {ended})", session.id)];
        if let Some(summary) = session.summary.as_deref().filter(|s| !s.is_empty()) {
            lines.push(format!("  Summary: {summary}"));
        }
        if flags.include_decisions && !session.key_decisions.is_empty() {
            lines.push(format!("  Decisions: {}", session.key_decisions.join("; ")));
        }
        if flags.include_errors && !session.errors_encountered.is_empty() {
            lines.push(format!("  Errors: {}", session.errors_encountered.join("; ")));
        }
        if flags.include_learnings && !session.key_learnings.is_empty() {
            lines.push(format!("  Learnings: {}", session.key_learnings.join("; ")));
        }
        blocks.push(lines.join("\n"));
    }

    Ok(blocks.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{log_activity, NewActivity};
    use crate::db::open_memory_connection;
    use crate::memory::store::create_memory;
    use crate::memory::types::NewMemory;
    use chrono::Duration;

    fn test_db() -> Connection {
        open_memory_connection(4).unwrap()
    }

    fn record(conn: &Connection, session: &str, tool: &str, file: Option<&str>, ok: bool) {
        let new = NewActivity {
            session_id: Some(session.to_string()),
            tool_name: Some(tool.to_string()),
            file_path: file.map(str::to_string),
            success: ok,
            error_message: (!ok).then(|| format!("{tool} exploded")),
            ..NewActivity::new(EventType::PostToolUse)
        };
        log_activity(conn, "/p", &new, 1_000, Utc::now()).unwrap();
    }

    #[test]
    fn start_generates_id_and_reuses_existing() {
        let conn = test_db();
        let now = Utc::now();
        let first = start_session(&conn, None, "/p", false, 3, now).unwrap();
        assert!(first.session.id.starts_with("sess_"));
        assert!(!first.resumed);
        assert!(first.context_summary.is_none());

        let named = start_session(&conn, Some("sess_hook"), "/p", false, 3, now).unwrap();
        assert_eq!(named.session.id, "sess_hook");
        let again = start_session(&conn, Some("sess_hook"), "/p", false, 3, now).unwrap();
        assert!(again.resumed);
        assert_eq!(again.session, named.session);
    }

    #[test]
    fn end_with_explicit_summary() {
        let conn = test_db();
        let now = Utc::now();
        start_session(&conn, Some("s1"), "/p", false, 3, now).unwrap();
        let learnings = vec!["Learning 1".to_string()];
        let ended = end_session(&conn, "s1", Some("Fixed login bug"), Some(&learnings), now).unwrap();

        assert!(ended.is_ended());
        assert_eq!(ended.summary.as_deref(), Some("Fixed login bug"));
        assert_eq!(ended.key_learnings, learnings);
    }

    #[test]
    fn second_end_is_a_noop() {
        let conn = test_db();
        let now = Utc::now();
        start_session(&conn, Some("s1"), "/p", false, 3, now).unwrap();
        let first = end_session(&conn, "s1", Some("first"), None, now).unwrap();
        let second =
            end_session(&conn, "s1", Some("second"), None, now + Duration::hours(1)).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.summary.as_deref(), Some("first"));
    }

    #[test]
    fn end_unknown_session_is_not_found() {
        let conn = test_db();
        let err = end_session(&conn, "missing", None, None, Utc::now()).unwrap_err();
        assert!(matches!(err, TroveError::NotFound { kind: "session", .. }));
    }

    #[test]
    fn derived_summary_reflects_activity() {
        let conn = test_db();
        let now = Utc::now();
        start_session(&conn, Some("s1"), "/p", false, 3, now).unwrap();
        record(&conn, "s1", "Read", Some("src/a.rs"), true);
        record(&conn, "s1", "Edit", Some("src/a.rs"), true);
        record(&conn, "s1", "Edit", Some("src/b.rs"), true);
        record(&conn, "s1", "Bash", None, false);
        create_memory(
            &conn,
            &NewMemory {
                source_session_id: Some("s1".into()),
                ..NewMemory::new("note")
            },
            4,
            now,
        )
        .unwrap();

        let detail = session_summary(&conn, "s1").unwrap();
        assert_eq!(detail.total_activities, 4);
        assert_eq!(detail.tool_usage["Edit"], 2);
        assert_eq!(detail.files_modified, vec!["src/a.rs", "src/b.rs"]);
        assert_eq!(detail.errors, vec!["Bash exploded"]);
        assert_eq!(detail.memories_created, 1);

        let ended = end_session(&conn, "s1", None, None, now).unwrap();
        assert_eq!(
            ended.summary.as_deref(),
            Some("4 activities (Edit x2, Bash x1, Read x1); 2 files modified; 1 errors; 1 memories created")
        );
        assert_eq!(ended.files_modified.len(), 2);
        assert_eq!(ended.errors_encountered, vec!["Bash exploded"]);
    }

    #[test]
    fn decisions_come_from_decision_events() {
        let conn = test_db();
        let now = Utc::now();
        start_session(&conn, Some("s1"), "/p", false, 3, now).unwrap();
        let decision = NewActivity {
            session_id: Some("s1".into()),
            tool_input: Some("Use WAL mode".into()),
            ..NewActivity::new(EventType::Decision)
        };
        log_activity(&conn, "/p", &decision, 1_000, now).unwrap();
        let ended = end_session(&conn, "s1", None, None, now).unwrap();
        assert_eq!(ended.key_decisions, vec!["Use WAL mode"]);
    }

    #[test]
    fn context_covers_recent_ended_sessions_newest_first() {
        let conn = test_db();
        let base = Utc::now() - Duration::days(3);
        for (i, summary) in ["oldest", "middle", "newest"].iter().enumerate() {
            let id = format!("s{i}");
            let at = base + Duration::hours(i as i64);
            start_session(&conn, Some(&id), "/p", false, 3, at).unwrap();
            end_session(&conn, &id, Some(summary), None, at).unwrap();
        }
        start_session(&conn, Some("other"), "/elsewhere", false, 3, base).unwrap();
        end_session(&conn, "other", Some("unrelated"), None, base).unwrap();

        let started = start_session(&conn, None, "/p", true, 2, Utc::now()).unwrap();
        let text = started.context_summary.unwrap();
        assert!(text.contains("newest"));
        assert!(text.contains("middle"));
        assert!(!text.contains("oldest"));
        assert!(!text.contains("unrelated"));
        assert!(text.find("newest") < text.find("middle"));
    }

    #[test]
    fn open_sessions_are_not_context() {
        let conn = test_db();
        start_session(&conn, Some("open"), "/p", false, 3, Utc::now()).unwrap();
        let text = context_summary(&conn, Some("/p"), 3, ContextFlags::default()).unwrap();
        assert!(text.is_empty());
        assert_eq!(recent_sessions(&conn, Some("/p"), false, 10).unwrap().len(), 1);
    }
}
