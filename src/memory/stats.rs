use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::TroveResult;

/// A tag and the number of memories carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagUsage {
    pub name: String,
    pub count: i64,
}

/// Counts for one project store.
#[derive(Debug, Serialize)]
pub struct ProjectStats {
    pub total_memories: i64,
    pub by_type: BTreeMap<String, i64>,
    pub by_status: BTreeMap<String, i64>,
    pub average_importance: f64,
    pub total_accesses: i64,
    pub pending_embeddings: i64,
    pub relationship_count: i64,
    pub activity_count: i64,
    pub session_count: i64,
    pub top_tags: Vec<TagUsage>,
    pub db_size_bytes: u64,
}

/// Number of tags reported in [`ProjectStats::top_tags`].
const TOP_TAGS: usize = 10;

/// Tags with at least `min_count` memories, most used first.
pub fn list_tags(conn: &Connection, min_count: i64, limit: usize) -> TroveResult<Vec<TagUsage>> {
    let mut stmt = conn.prepare(
        "SELECT t.name, COUNT(mt.memory_id) AS uses FROM tags t \
         LEFT JOIN memory_tags mt ON mt.tag = t.name \
         GROUP BY t.name HAVING uses >= ?1 \
         ORDER BY uses DESC, t.name ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![min_count.max(1), limit as i64], |row| {
            Ok(TagUsage {
                name: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn grouped_counts(conn: &Connection, column: &str) -> TroveResult<BTreeMap<String, i64>> {
    let sql = format!("SELECT {column}, COUNT(*) FROM memories GROUP BY {column}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

/// Compute statistics for a store. `db_path` is used for the file size;
/// pass `None` for in-memory databases.
pub fn project_stats(conn: &Connection, db_path: Option<&Path>) -> TroveResult<ProjectStats> {
    let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };

    let (total_memories, average_importance, total_accesses): (i64, f64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(AVG(base_importance), 0.0), COALESCE(SUM(access_count), 0) \
         FROM memories",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(ProjectStats {
        total_memories,
        by_type: grouped_counts(conn, "type")?,
        by_status: grouped_counts(conn, "status")?,
        average_importance,
        total_accesses,
        pending_embeddings: count("SELECT COUNT(*) FROM memories WHERE embedding_pending = 1")?,
        relationship_count: count("SELECT COUNT(*) FROM relationships")?,
        activity_count: count("SELECT COUNT(*) FROM activities")?,
        session_count: count("SELECT COUNT(*) FROM sessions")?,
        top_tags: list_tags(conn, 1, TOP_TAGS)?,
        db_size_bytes,
    })
}
