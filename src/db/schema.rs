//! SQL DDL for all trove tables.
//!
//! Defines `memories`, `memories_fts` (FTS5), `memories_vec` (vec0), `tags`,
//! `memory_tags`, `relationships`, `activities`, `sessions`, `global_index`
//! and `schema_meta`. All DDL uses `IF NOT EXISTS` for idempotent
//! initialization; later columns arrive through [`super::migrations`].

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Knowledge units
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL CHECK(length(content) > 0),
    context TEXT,
    type TEXT NOT NULL DEFAULT 'general' CHECK(type IN (
        'general','warning','tip','config','troubleshooting','code',
        'error','solution','command','concept','decision')),
    status TEXT NOT NULL DEFAULT 'fresh' CHECK(status IN ('fresh','needs_review','outdated','archived')),
    base_importance INTEGER NOT NULL DEFAULT 50,
    access_count INTEGER NOT NULL DEFAULT 0 CHECK(access_count >= 0),
    last_accessed_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    source_session_id TEXT,
    source_project TEXT,
    embedding_pending INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
CREATE INDEX IF NOT EXISTS idx_memories_last_accessed ON memories(last_accessed_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_memories_pending ON memories(embedding_pending);
CREATE INDEX IF NOT EXISTS idx_memories_project ON memories(source_project);

-- Lexical index (BM25). rowid mirrors memories.rowid.
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    context,
    tags,
    memory_id UNINDEXED,
    tokenize = 'porter unicode61'
);

-- Normalized tags; usage counts are derived from memory_tags
CREATE TABLE IF NOT EXISTS tags (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memory_tags (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    tag TEXT NOT NULL REFERENCES tags(name),
    PRIMARY KEY (memory_id, tag)
);

CREATE INDEX IF NOT EXISTS idx_memory_tags_tag ON memory_tags(tag);

-- Typed, directed edges between memories (pruned explicitly, no FK)
CREATE TABLE IF NOT EXISTS relationships (
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    type TEXT NOT NULL CHECK(type IN ('related_to','supersedes','derived_from','contradicts')),
    strength REAL NOT NULL DEFAULT 0.5 CHECK(strength >= 0.0 AND strength <= 1.0),
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id, type),
    CHECK(source_id <> target_id)
);

CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id);

-- Append-only audit trail
CREATE TABLE IF NOT EXISTS activities (
    id TEXT PRIMARY KEY,
    session_id TEXT,
    agent_id TEXT,
    event_type TEXT NOT NULL CHECK(event_type IN ('pre_tool_use','post_tool_use','decision','observation')),
    tool_name TEXT,
    tool_input TEXT,
    tool_output TEXT,
    success INTEGER NOT NULL DEFAULT 1,
    error_message TEXT,
    duration_ms INTEGER,
    file_path TEXT,
    project_path TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_activities_timestamp ON activities(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_activities_session ON activities(session_id);
CREATE INDEX IF NOT EXISTS idx_activities_tool ON activities(tool_name);

-- Units of work
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    project_path TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    summary TEXT,
    key_learnings TEXT NOT NULL DEFAULT '[]',
    key_decisions TEXT NOT NULL DEFAULT '[]',
    errors_encountered TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_path, ended_at DESC);

-- Global store only: (project, memory) -> local copy in memories
CREATE TABLE IF NOT EXISTS global_index (
    project_path TEXT NOT NULL,
    memory_id TEXT NOT NULL,
    entry_id TEXT NOT NULL UNIQUE REFERENCES memories(id) ON DELETE CASCADE,
    content_hash TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    PRIMARY KEY (project_path, memory_id)
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
fn vec_table_sql(dimensions: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(\n    \
         id TEXT PRIMARY KEY,\n    embedding FLOAT[{dimensions}]\n);"
    )
}

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(&vec_table_sql(dimensions))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('embedding_dimensions', ?1)",
        [dimensions.to_string()],
    )?;

    Ok(())
}

/// Dimension the vector table was created with.
pub fn stored_dimensions(conn: &Connection) -> rusqlite::Result<Option<usize>> {
    use rusqlite::OptionalExtension;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'embedding_dimensions'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|v| v.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 8).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "memories",
            "tags",
            "memory_tags",
            "relationships",
            "activities",
            "sessions",
            "global_index",
            "schema_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 8).unwrap();
        init_schema(&conn, 8).unwrap();
        assert_eq!(stored_dimensions(&conn).unwrap(), Some(8));
    }

    #[test]
    fn self_loop_relationship_rejected_by_schema() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 8).unwrap();
        let result = conn.execute(
            "INSERT INTO relationships (source_id, target_id, type, strength, created_at) \
             VALUES ('a', 'a', 'related_to', 0.5, '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }
}
