//! Memory persistence: CRUD, tag associations, index maintenance.
//!
//! Every function here takes a plain `&Connection` and assumes the caller
//! holds the write transaction ([`crate::db::Database::write`]) for mutating
//! calls, so a multi-step write is all-or-nothing. The lexical index is
//! updated synchronously with every change; the vector index only when an
//! embedding is supplied, otherwise the row is flagged `embedding_pending`.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashMap};

use crate::db::{format_ts, ts_column};
use crate::error::{TroveError, TroveResult};
use crate::memory::categorize::categorize;
use crate::memory::relations::{self, RelationType};
use crate::memory::types::{
    normalize_tags, resolve_importance, Memory, MemoryFilter, MemoryStatus, MemoryType,
    MemoryUpdate, NewMemory, SortOrder, MAX_IMPORTANCE, MIN_IMPORTANCE,
};
use crate::memory::{embedding_to_bytes, l2_normalize, new_id};

/// Strength given to edges created from `NewMemory::related_ids`.
const RELATED_ON_CREATE_STRENGTH: f64 = 0.5;

pub(crate) const MEMORY_SELECT: &str = "\
SELECT m.id, m.content, m.context, m.type, m.status, m.base_importance, m.access_count, \
       m.created_at, m.updated_at, m.last_accessed_at, m.source_session_id, m.source_project, \
       m.embedding_pending, \
       (SELECT group_concat(t.tag, ' ') FROM memory_tags t WHERE t.memory_id = m.id) \
FROM memories m";

pub(crate) fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let memory_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    let base_importance: i64 = row.get(5)?;
    let access_count: i64 = row.get(6)?;
    let tags: Option<String> = row.get(13)?;

    let mut tags: Vec<String> = tags
        .unwrap_or_default()
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    tags.sort();

    Ok(Memory {
        id: row.get(0)?,
        content: row.get(1)?,
        context: row.get(2)?,
        memory_type: MemoryType::from_input(&memory_type),
        status: status.parse().unwrap_or_default(),
        base_importance: base_importance.clamp(MIN_IMPORTANCE as i64, MAX_IMPORTANCE as i64)
            as u32,
        tags,
        access_count: access_count.clamp(0, u32::MAX as i64) as u32,
        created_at: ts_column(row, 7)?,
        updated_at: ts_column(row, 8)?,
        last_accessed_at: ts_column(row, 9)?,
        source_session_id: row.get(10)?,
        source_project: row.get(11)?,
        embedding_pending: row.get(12)?,
    })
}

/// Text fed to both the lexical index and the embedding provider.
pub fn embedding_text(content: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.is_empty() => format!("{content}\n{ctx}"),
        _ => content.to_string(),
    }
}

fn check_dimensions(embedding: &[f32], expected: usize) -> TroveResult<()> {
    if embedding.len() != expected {
        return Err(TroveError::validation(format!(
            "embedding has {} dimensions, store expects {expected}",
            embedding.len()
        )));
    }
    Ok(())
}

fn non_empty_content(content: &str) -> TroveResult<()> {
    if content.trim().is_empty() {
        return Err(TroveError::validation("content must not be empty"));
    }
    Ok(())
}

/// Create a memory: categorize, insert, index, and link `related_ids`.
///
/// Unknown `related_ids` fail the whole call with `NotFound`.
pub fn create_memory(
    conn: &Connection,
    new: &NewMemory,
    embedding_dim: usize,
    now: DateTime<Utc>,
) -> TroveResult<Memory> {
    non_empty_content(&new.content)?;
    let importance = resolve_importance(new.importance)?;
    if let Some(embedding) = &new.embedding {
        check_dimensions(embedding, embedding_dim)?;
    }

    let categorized = categorize(&new.content, new.memory_type, &new.tags);
    let id = new_id("mem");
    let ts = format_ts(&now);
    let context = new.context.as_deref().filter(|c| !c.is_empty());

    conn.execute(
        "INSERT INTO memories (id, content, context, type, status, base_importance, access_count, \
         last_accessed_at, created_at, updated_at, source_session_id, embedding_pending) \
         VALUES (?1, ?2, ?3, ?4, 'fresh', ?5, 0, ?6, ?6, ?6, ?7, ?8)",
        params![
            id,
            new.content,
            context,
            categorized.memory_type.as_str(),
            importance,
            ts,
            new.source_session_id,
            new.embedding.is_none(),
        ],
    )?;
    let rowid = conn.last_insert_rowid();

    replace_tags(conn, &id, &categorized.tags, now)?;
    insert_fts(conn, rowid, &new.content, context, &categorized.tags, &id)?;
    if let Some(embedding) = &new.embedding {
        upsert_vec(conn, &id, embedding)?;
    }

    for related in &new.related_ids {
        relations::link(
            conn,
            &id,
            related,
            RelationType::RelatedTo,
            Some(RELATED_ON_CREATE_STRENGTH),
            now,
        )?;
    }

    tracing::info!(
        memory_id = %id,
        memory_type = %categorized.memory_type,
        tags = categorized.tags.len(),
        embedding_pending = new.embedding.is_none(),
        "memory created"
    );
    get_memory(conn, &id)
}

/// Insert a fully-formed record (global-store copies). Keeps the caller's
/// timestamps and counters; the lexical index is built from it.
pub(crate) fn insert_copy(
    conn: &Connection,
    memory: &Memory,
    embedding: Option<&[f32]>,
) -> TroveResult<()> {
    conn.execute(
        "INSERT INTO memories (id, content, context, type, status, base_importance, access_count, \
         last_accessed_at, created_at, updated_at, source_session_id, source_project, embedding_pending) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            memory.id,
            memory.content,
            memory.context,
            memory.memory_type.as_str(),
            memory.status.as_str(),
            memory.base_importance,
            memory.access_count,
            format_ts(&memory.last_accessed_at),
            format_ts(&memory.created_at),
            format_ts(&memory.updated_at),
            memory.source_session_id,
            memory.source_project,
            embedding.is_none(),
        ],
    )?;
    let rowid = conn.last_insert_rowid();
    replace_tags(conn, &memory.id, &memory.tags, memory.updated_at)?;
    insert_fts(
        conn,
        rowid,
        &memory.content,
        memory.context.as_deref(),
        &memory.tags,
        &memory.id,
    )?;
    if let Some(embedding) = embedding {
        upsert_vec(conn, &memory.id, embedding)?;
    }
    Ok(())
}

/// Overwrite a global-store copy in place with fresh source data.
pub(crate) fn overwrite_copy(
    conn: &Connection,
    memory: &Memory,
    embedding: Option<&[f32]>,
) -> TroveResult<()> {
    let rowid = memory_rowid(conn, &memory.id)?;
    conn.execute(
        "UPDATE memories SET content = ?2, context = ?3, type = ?4, status = ?5, base_importance = ?6, \
         access_count = MAX(access_count, ?7), last_accessed_at = MAX(last_accessed_at, ?8), \
         updated_at = ?9, source_project = ?10, embedding_pending = ?11 WHERE id = ?1",
        params![
            memory.id,
            memory.content,
            memory.context,
            memory.memory_type.as_str(),
            memory.status.as_str(),
            memory.base_importance,
            memory.access_count,
            format_ts(&memory.last_accessed_at),
            format_ts(&memory.updated_at),
            memory.source_project,
            embedding.is_none(),
        ],
    )?;
    replace_tags(conn, &memory.id, &memory.tags, memory.updated_at)?;
    delete_fts(conn, rowid)?;
    insert_fts(
        conn,
        rowid,
        &memory.content,
        memory.context.as_deref(),
        &memory.tags,
        &memory.id,
    )?;
    match embedding {
        Some(embedding) => upsert_vec(conn, &memory.id, embedding)?,
        None => delete_vec(conn, &memory.id)?,
    }
    Ok(())
}

/// Get a memory by id.
pub fn get_memory(conn: &Connection, id: &str) -> TroveResult<Memory> {
    find_memory(conn, id)?.ok_or_else(|| TroveError::not_found("memory", id))
}

pub fn find_memory(conn: &Connection, id: &str) -> TroveResult<Option<Memory>> {
    let sql = format!("{MEMORY_SELECT} WHERE m.id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_memory).optional()?)
}

pub fn memory_exists(conn: &Connection, id: &str) -> TroveResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM memories WHERE id = ?1", [id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn memory_rowid(conn: &Connection, id: &str) -> TroveResult<i64> {
    conn.query_row("SELECT rowid FROM memories WHERE id = ?1", [id], |row| {
        row.get(0)
    })
    .optional()?
    .ok_or_else(|| TroveError::not_found("memory", id))
}

/// Apply a partial update. Text changes re-index the lexical row and, unless
/// a new embedding is supplied, drop the stale vector and flag the row pending.
pub fn update_memory(
    conn: &Connection,
    id: &str,
    update: &MemoryUpdate,
    embedding_dim: usize,
    now: DateTime<Utc>,
) -> TroveResult<Memory> {
    let existing = get_memory(conn, id)?;
    if update.is_empty() {
        return Ok(existing);
    }

    if let Some(content) = &update.content {
        non_empty_content(content)?;
    }
    let importance = match update.importance {
        Some(raw) => resolve_importance(Some(raw))?,
        None => existing.base_importance,
    };
    if let Some(embedding) = &update.embedding {
        check_dimensions(embedding, embedding_dim)?;
    }

    let content = update.content.as_deref().unwrap_or(&existing.content);
    let context = match update.context.as_deref() {
        Some("") => None,
        Some(ctx) => Some(ctx),
        None => existing.context.as_deref(),
    };
    let memory_type = update.memory_type.unwrap_or(existing.memory_type);
    let status = update.status.unwrap_or(existing.status);

    let mut tags: BTreeSet<String> = match &update.tags {
        Some(replacement) => normalize_tags(replacement).into_iter().collect(),
        None => existing.tags.iter().cloned().collect(),
    };
    tags.extend(normalize_tags(&update.add_tags));
    for removed in normalize_tags(&update.remove_tags) {
        tags.remove(&removed);
    }
    let tags: Vec<String> = tags.into_iter().collect();

    let fts_changed = update.touches_fts();
    let text_changed = update.touches_embedding_text();
    let pending = match (&update.embedding, text_changed) {
        (Some(_), _) => false,
        (None, true) => true,
        (None, false) => existing.embedding_pending,
    };

    conn.execute(
        "UPDATE memories SET content = ?2, context = ?3, type = ?4, status = ?5, \
         base_importance = ?6, updated_at = ?7, embedding_pending = ?8 WHERE id = ?1",
        params![
            id,
            content,
            context,
            memory_type.as_str(),
            status.as_str(),
            importance,
            format_ts(&now),
            pending,
        ],
    )?;

    if tags != existing.tags {
        replace_tags(conn, id, &tags, now)?;
    }
    if fts_changed {
        let rowid = memory_rowid(conn, id)?;
        delete_fts(conn, rowid)?;
        insert_fts(conn, rowid, content, context, &tags, id)?;
    }
    match &update.embedding {
        Some(embedding) => upsert_vec(conn, id, embedding)?,
        None if text_changed => delete_vec(conn, id)?,
        None => {}
    }

    tracing::info!(memory_id = %id, reindexed = fts_changed, re_embed = text_changed, "memory updated");
    get_memory(conn, id)
}

/// Set the status of several memories at once. Returns the number changed.
pub fn set_status(
    conn: &Connection,
    ids: &[String],
    status: MemoryStatus,
    now: DateTime<Utc>,
) -> TroveResult<usize> {
    let ts = format_ts(&now);
    let mut changed = 0;
    for id in ids {
        changed += conn.execute(
            "UPDATE memories SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), ts],
        )?;
    }
    Ok(changed)
}

/// Hard-delete a memory with its tag links, index rows and relationships.
pub fn delete_memory(conn: &Connection, id: &str) -> TroveResult<()> {
    let rowid = memory_rowid(conn, id)?;

    delete_fts(conn, rowid)?;
    delete_vec(conn, id)?;
    let edges = conn.execute(
        "DELETE FROM relationships WHERE source_id = ?1 OR target_id = ?1",
        [id],
    )?;
    conn.execute("DELETE FROM memory_tags WHERE memory_id = ?1", [id])?;
    conn.execute("DELETE FROM memories WHERE id = ?1", [id])?;

    tracing::info!(memory_id = %id, edges_removed = edges, "memory deleted");
    Ok(())
}

/// Record a recall: bump `access_count` and move `last_accessed_at` forward.
pub fn record_access(conn: &Connection, ids: &[String], now: DateTime<Utc>) -> TroveResult<()> {
    let ts = format_ts(&now);
    let mut stmt = conn.prepare_cached(
        "UPDATE memories SET access_count = access_count + 1, \
         last_accessed_at = MAX(last_accessed_at, ?2) WHERE id = ?1",
    )?;
    for id in ids {
        stmt.execute(params![id, ts])?;
    }
    Ok(())
}

/// List memories matching `filter` in the order given by `sort`.
pub fn list_memories(
    conn: &Connection,
    filter: &MemoryFilter,
    sort: SortOrder,
    limit: usize,
    offset: usize,
) -> TroveResult<Vec<Memory>> {
    let mut values = Vec::new();
    let clause = filter_clause(filter, &mut values);
    values.push(Value::Integer(limit as i64));
    values.push(Value::Integer(offset as i64));

    let sql = format!(
        "{MEMORY_SELECT} WHERE {clause} ORDER BY {} LIMIT ? OFFSET ?",
        sort.order_by()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), row_to_memory)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_memories(conn: &Connection, filter: &MemoryFilter) -> TroveResult<i64> {
    let mut values = Vec::new();
    let clause = filter_clause(filter, &mut values);
    let sql = format!("SELECT COUNT(*) FROM memories m WHERE {clause}");
    Ok(conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?)
}

/// Load the given ids that also satisfy `filter`, keyed by id.
pub fn fetch_filtered(
    conn: &Connection,
    ids: &[String],
    filter: &MemoryFilter,
) -> TroveResult<HashMap<String, Memory>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut values: Vec<Value> = ids.iter().map(|id| Value::Text(id.clone())).collect();
    let placeholders = vec!["?"; ids.len()].join(", ");
    let clause = filter_clause(filter, &mut values);
    let sql = format!("{MEMORY_SELECT} WHERE m.id IN ({placeholders}) AND {clause}");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), row_to_memory)?
        .map(|r| r.map(|m| (m.id.clone(), m)))
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

/// Build the `WHERE` body for a filter, appending positional values.
pub(crate) fn filter_clause(filter: &MemoryFilter, values: &mut Vec<Value>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let push_in = |column: &str, items: Vec<String>, values: &mut Vec<Value>| {
        let placeholders = vec!["?"; items.len()].join(", ");
        values.extend(items.into_iter().map(Value::Text));
        format!("{column} IN ({placeholders})")
    };

    if !filter.types.is_empty() {
        let items = filter.types.iter().map(|t| t.as_str().to_string()).collect();
        parts.push(push_in("m.type", items, values));
    }
    if !filter.statuses.is_empty() {
        let items = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        parts.push(push_in("m.status", items, values));
    }
    if !filter.include_archived && !filter.statuses.contains(&MemoryStatus::Archived) {
        parts.push("m.status <> 'archived'".to_string());
    }
    let tags = normalize_tags(&filter.tags);
    if !tags.is_empty() {
        let inner = push_in("t.tag", tags, values);
        parts.push(format!(
            "EXISTS (SELECT 1 FROM memory_tags t WHERE t.memory_id = m.id AND {inner})"
        ));
    }
    if let Some(min) = filter.min_importance {
        parts.push("m.base_importance >= ?".to_string());
        values.push(Value::Integer(min as i64));
    }
    if let Some(max) = filter.max_importance {
        parts.push("m.base_importance <= ?".to_string());
        values.push(Value::Integer(max as i64));
    }
    if let Some(after) = &filter.created_after {
        parts.push("m.created_at >= ?".to_string());
        values.push(Value::Text(format_ts(after)));
    }
    if let Some(before) = &filter.created_before {
        parts.push("m.created_at < ?".to_string());
        values.push(Value::Text(format_ts(before)));
    }
    if let Some(project) = filter.project.as_deref().filter(|p| !p.is_empty()) {
        parts.push("instr(m.source_project, ?) > 0".to_string());
        values.push(Value::Text(project.to_string()));
    }
    if let Some(session) = &filter.source_session_id {
        parts.push("m.source_session_id = ?".to_string());
        values.push(Value::Text(session.clone()));
    }

    if parts.is_empty() {
        "1 = 1".to_string()
    } else {
        parts.join(" AND ")
    }
}

/// Replace the tag set of a memory, registering new tag names.
fn replace_tags(
    conn: &Connection,
    memory_id: &str,
    tags: &[String],
    now: DateTime<Utc>,
) -> TroveResult<()> {
    conn.execute("DELETE FROM memory_tags WHERE memory_id = ?1", [memory_id])?;
    let ts = format_ts(&now);
    for tag in tags {
        conn.execute(
            "INSERT OR IGNORE INTO tags (name, created_at) VALUES (?1, ?2)",
            params![tag, ts],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO memory_tags (memory_id, tag) VALUES (?1, ?2)",
            params![memory_id, tag],
        )?;
    }
    Ok(())
}

/// Add a lexical index row. Must use the rowid of the `memories` row.
fn insert_fts(
    conn: &Connection,
    rowid: i64,
    content: &str,
    context: Option<&str>,
    tags: &[String],
    id: &str,
) -> TroveResult<()> {
    conn.execute(
        "INSERT INTO memories_fts (rowid, content, context, tags, memory_id) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![rowid, content, context.unwrap_or(""), tags.join(" "), id],
    )?;
    Ok(())
}

fn delete_fts(conn: &Connection, rowid: i64) -> TroveResult<()> {
    conn.execute("DELETE FROM memories_fts WHERE rowid = ?1", [rowid])?;
    Ok(())
}

/// Store a vector (L2-normalized) for a memory, replacing any previous one.
fn upsert_vec(conn: &Connection, id: &str, embedding: &[f32]) -> TroveResult<()> {
    let normalized = l2_normalize(embedding);
    // vec0 has no upsert
    delete_vec(conn, id)?;
    conn.execute(
        "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(&normalized)],
    )?;
    Ok(())
}

fn delete_vec(conn: &Connection, id: &str) -> TroveResult<()> {
    conn.execute("DELETE FROM memories_vec WHERE id = ?1", [id])?;
    Ok(())
}

/// Read back a stored (normalized) vector.
pub fn get_embedding(conn: &Connection, id: &str) -> TroveResult<Option<Vec<f32>>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM memories_vec WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(bytes.map(|b| {
        b.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }))
}

/// Memories still waiting for a vector, oldest first, with the text to embed.
pub fn pending_embeddings(conn: &Connection, limit: usize) -> TroveResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, content, context FROM memories WHERE embedding_pending = 1 \
         ORDER BY created_at ASC, id ASC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| {
            let content: String = row.get(1)?;
            let context: Option<String> = row.get(2)?;
            Ok((row.get(0)?, embedding_text(&content, context.as_deref())))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Store a background-computed vector if the memory still exists and its
/// text is unchanged since `text` was read. Returns whether it was applied.
pub fn apply_embedding(
    conn: &Connection,
    id: &str,
    text: &str,
    embedding: &[f32],
    embedding_dim: usize,
) -> TroveResult<bool> {
    check_dimensions(embedding, embedding_dim)?;
    let current: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT content, context FROM memories WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match current {
        Some((content, context)) if embedding_text(&content, context.as_deref()) == text => {
            upsert_vec(conn, id, embedding)?;
            conn.execute(
                "UPDATE memories SET embedding_pending = 0 WHERE id = ?1",
                [id],
            )?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
