//! Propagation of project memories into the global store.
//!
//! The global store is an ordinary store whose `memories` rows are copies
//! of project memories, plus a `global_index` table mapping
//! `(project_path, memory_id)` to the copy. Copies get their own ids so two
//! projects can never collide. A content hash makes re-syncing an unchanged
//! memory a no-op.
//!
//! There is no cross-store transaction: the project write commits first and
//! the global upsert runs afterwards in its own transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::db::{format_ts, opt_ts_column, Database};
use crate::error::{TroveError, TroveResult};
use crate::memory::new_id;
use crate::memory::store::{
    delete_memory, find_memory, get_embedding, insert_copy, list_memories, overwrite_copy,
};
use crate::memory::types::{Memory, MemoryFilter, SortOrder};

/// Page size for full-store scans.
const SYNC_PAGE: usize = 200;

/// Fingerprint of the synced fields of a memory.
pub fn content_hash(memory: &Memory) -> String {
    let mut hasher = Sha256::new();
    hasher.update(memory.content.as_bytes());
    hasher.update([0u8]);
    hasher.update(memory.context.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(memory.memory_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(memory.status.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(memory.base_importance.to_le_bytes());
    for tag in &memory.tags {
        hasher.update([0u8]);
        hasher.update(tag.as_bytes());
    }
    format!("sha256:{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// A `global_index` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalIndexEntry {
    pub project_path: String,
    pub memory_id: String,
    pub entry_id: String,
    pub content_hash: String,
    pub synced_at: DateTime<Utc>,
}

fn find_entry(
    conn: &Connection,
    project_path: &str,
    memory_id: &str,
) -> TroveResult<Option<GlobalIndexEntry>> {
    Ok(conn
        .query_row(
            "SELECT project_path, memory_id, entry_id, content_hash, synced_at FROM global_index \
             WHERE project_path = ?1 AND memory_id = ?2",
            params![project_path, memory_id],
            |row| {
                Ok(GlobalIndexEntry {
                    project_path: row.get(0)?,
                    memory_id: row.get(1)?,
                    entry_id: row.get(2)?,
                    content_hash: row.get(3)?,
                    synced_at: crate::db::ts_column(row, 4)?,
                })
            },
        )
        .optional()?)
}

fn conflict(project_path: &str, memory_id: &str, reason: impl Into<String>) -> TroveError {
    TroveError::SyncConflict {
        project_path: project_path.to_string(),
        memory_id: memory_id.to_string(),
        reason: reason.into(),
    }
}

/// Upsert the global copy of one committed project memory.
///
/// `embedding` is copied only when its width matches the global store.
/// Fails with [`TroveError::SyncConflict`] when the global copy is newer
/// than the memory being synced.
pub fn upsert_global_entry(
    global: &Connection,
    project_path: &str,
    memory: &Memory,
    embedding: Option<&[f32]>,
    global_dim: usize,
    now: DateTime<Utc>,
) -> TroveResult<SyncOutcome> {
    let hash = content_hash(memory);
    let embedding = embedding.filter(|e| e.len() == global_dim);
    let existing = find_entry(global, project_path, &memory.id)?;

    let outcome = match existing {
        Some(entry) if entry.content_hash == hash => {
            // Vectors land after the first sync; fill one in when it appears.
            let Some(vector) = embedding else {
                return Ok(SyncOutcome::Unchanged);
            };
            if get_embedding(global, &entry.entry_id)?.is_some() {
                return Ok(SyncOutcome::Unchanged);
            }
            let replacement = Memory {
                id: entry.entry_id.clone(),
                source_project: Some(project_path.to_string()),
                ..memory.clone()
            };
            overwrite_copy(global, &replacement, Some(vector))?;
            SyncOutcome::Updated
        }
        Some(entry) => {
            let copy = find_memory(global, &entry.entry_id)?.ok_or_else(|| {
                conflict(project_path, &memory.id, "index entry points at a missing copy")
            })?;
            if copy.updated_at > memory.updated_at {
                return Err(conflict(
                    project_path,
                    &memory.id,
                    "global copy is newer than the project memory",
                ));
            }
            let replacement = Memory {
                id: entry.entry_id.clone(),
                source_project: Some(project_path.to_string()),
                ..memory.clone()
            };
            overwrite_copy(global, &replacement, embedding)?;
            global.execute(
                "UPDATE global_index SET content_hash = ?3, synced_at = ?4 \
                 WHERE project_path = ?1 AND memory_id = ?2",
                params![project_path, memory.id, hash, format_ts(&now)],
            )?;
            SyncOutcome::Updated
        }
        None => {
            let copy = Memory {
                id: new_id("mem"),
                source_project: Some(project_path.to_string()),
                ..memory.clone()
            };
            insert_copy(global, &copy, embedding)?;
            global.execute(
                "INSERT INTO global_index (project_path, memory_id, entry_id, content_hash, synced_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![project_path, memory.id, copy.id, hash, format_ts(&now)],
            )?;
            SyncOutcome::Inserted
        }
    };

    tracing::debug!(project = project_path, memory_id = %memory.id, outcome = ?outcome, "memory synced");
    Ok(outcome)
}

/// Drop the global copy of a project memory. Returns whether one existed.
pub fn remove_global_entry(
    global: &Connection,
    project_path: &str,
    memory_id: &str,
) -> TroveResult<bool> {
    match find_entry(global, project_path, memory_id)? {
        Some(entry) => {
            // global_index row cascades with the copy
            delete_memory(global, &entry.entry_id)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Sync one memory across stores: read its vector from the project store,
/// then upsert in a global write transaction.
pub fn on_memory_committed(
    project: &Database,
    global: &Database,
    project_path: &str,
    memory: &Memory,
    now: DateTime<Utc>,
) -> TroveResult<SyncOutcome> {
    let embedding = project.read(|conn| get_embedding(conn, &memory.id))?;
    let dim = global.embedding_dim();
    global.write(|tx| upsert_global_entry(tx, project_path, memory, embedding.as_deref(), dim, now))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncConflictReport {
    pub memory_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub examined: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Global copies dropped because their source memory is gone.
    pub removed: usize,
    pub conflicts: Vec<SyncConflictReport>,
}

impl SyncReport {
    /// Memories whose global copy was written.
    pub fn synced(&self) -> usize {
        self.inserted + self.updated
    }
}

/// When each memory of a project last had its global copy written.
pub fn sync_marks(
    global: &Connection,
    project_path: &str,
) -> TroveResult<HashMap<String, DateTime<Utc>>> {
    let mut stmt =
        global.prepare("SELECT memory_id, synced_at FROM global_index WHERE project_path = ?1")?;
    let marks = stmt
        .query_map([project_path], |row| {
            Ok((row.get::<_, String>(0)?, crate::db::ts_column(row, 1)?))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(marks)
}

/// Record a per-item failure without stopping the batch.
fn skip(report: &mut SyncReport, project_path: &str, memory_id: &str, error: &TroveError) {
    tracing::warn!(project = project_path, memory_id, error = %error, "memory not synced");
    report.conflicts.push(SyncConflictReport {
        memory_id: memory_id.to_string(),
        reason: error.to_string(),
    });
}

/// Sync a whole project store.
///
/// With `full`, every memory is examined and global copies whose source no
/// longer exists are removed. Otherwise a memory is examined when it has no
/// global copy or changed after its own copy was written. Per-item failures,
/// a busy global store included, are reported and never fatal.
pub fn full_sync(
    project: &Database,
    global: &Database,
    project_path: &str,
    full: bool,
    now: DateTime<Utc>,
) -> TroveResult<SyncReport> {
    let marks = if full {
        HashMap::new()
    } else {
        global.read(|conn| sync_marks(conn, project_path))?
    };

    let mut report = SyncReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    let filter = MemoryFilter {
        include_archived: true,
        ..Default::default()
    };

    let mut offset = 0;
    loop {
        let page = project.read(|conn| {
            list_memories(conn, &filter, SortOrder::Created, SYNC_PAGE, offset)
        })?;
        if page.is_empty() {
            break;
        }
        offset += page.len();

        for memory in page {
            seen.insert(memory.id.clone());
            if marks.get(&memory.id).is_some_and(|at| memory.updated_at < *at) {
                continue;
            }
            report.examined += 1;
            match on_memory_committed(project, global, project_path, &memory, now) {
                Ok(SyncOutcome::Inserted) => report.inserted += 1,
                Ok(SyncOutcome::Updated) => report.updated += 1,
                Ok(SyncOutcome::Unchanged) => report.unchanged += 1,
                Err(e) => skip(&mut report, project_path, &memory.id, &e),
            }
        }
    }

    if full {
        let indexed: Vec<String> = global.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT memory_id FROM global_index WHERE project_path = ?1")?;
            let ids = stmt
                .query_map([project_path], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })?;
        for memory_id in indexed.into_iter().filter(|id| !seen.contains(id)) {
            match global.write(|tx| remove_global_entry(tx, project_path, &memory_id)) {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(e) => skip(&mut report, project_path, &memory_id, &e),
            }
        }
    }

    tracing::info!(
        project = project_path,
        full,
        examined = report.examined,
        synced = report.synced(),
        removed = report.removed,
        conflicts = report.conflicts.len(),
        "project synced"
    );
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub total_entries: i64,
    pub by_project: BTreeMap<String, i64>,
    pub by_type: BTreeMap<String, i64>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

pub fn global_stats(global: &Connection) -> TroveResult<GlobalStats> {
    let grouped = |sql: &str| -> TroveResult<BTreeMap<String, i64>> {
        let mut stmt = global.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(rows)
    };

    let by_project = grouped("SELECT project_path, COUNT(*) FROM global_index GROUP BY project_path")?;
    let by_type = grouped(
        "SELECT m.type, COUNT(*) FROM global_index g JOIN memories m ON m.id = g.entry_id \
         GROUP BY m.type",
    )?;
    let (total_entries, last_synced_at): (i64, Option<DateTime<Utc>>) = global.query_row(
        "SELECT COUNT(*), MAX(synced_at) FROM global_index",
        [],
        |row| Ok((row.get(0)?, opt_ts_column(row, 1)?)),
    )?;

    Ok(GlobalStats {
        total_entries,
        by_project,
        by_type,
        last_synced_at,
    })
}
