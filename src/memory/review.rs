//! Freshness review.
//!
//! Memories not touched for `freshness_review_days` move from `fresh` to
//! `needs_review`; a reviewer then confirms, outdates or archives them.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::format_ts;
use crate::error::TroveResult;
use crate::memory::store::{row_to_memory, MEMORY_SELECT};
use crate::memory::types::{Memory, MemoryStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    MarkFresh,
    MarkOutdated,
    MarkArchived,
}

impl ReviewAction {
    pub fn status(&self) -> MemoryStatus {
        match self {
            Self::MarkFresh => MemoryStatus::Fresh,
            Self::MarkOutdated => MemoryStatus::Outdated,
            Self::MarkArchived => MemoryStatus::Archived,
        }
    }
}

fn cutoff(freshness_days: u32, now: DateTime<Utc>) -> String {
    format_ts(&(now - Duration::days(freshness_days as i64)))
}

/// Flip stale `fresh` memories to `needs_review`. Returns how many changed.
pub fn mark_stale_for_review(
    conn: &Connection,
    freshness_days: u32,
    now: DateTime<Utc>,
) -> TroveResult<usize> {
    let changed = conn.execute(
        "UPDATE memories SET status = 'needs_review', updated_at = ?2 \
         WHERE status = 'fresh' AND last_accessed_at < ?1",
        params![cutoff(freshness_days, now), format_ts(&now)],
    )?;
    if changed > 0 {
        tracing::info!(changed, freshness_days, "memories flagged for review");
    }
    Ok(changed)
}

/// Memories awaiting review plus fresh ones past the window, stalest first.
pub fn review_candidates(
    conn: &Connection,
    freshness_days: u32,
    limit: usize,
    now: DateTime<Utc>,
) -> TroveResult<Vec<Memory>> {
    let sql = format!(
        "{MEMORY_SELECT} WHERE m.status = 'needs_review' \
            OR (m.status = 'fresh' AND m.last_accessed_at < ?1) \
         ORDER BY m.last_accessed_at ASC, m.id ASC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![cutoff(freshness_days, now), limit as i64],
            row_to_memory,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Apply a review decision. Confirming a memory as fresh also restarts its
/// freshness window. Returns the number of memories changed.
pub fn apply_review(
    conn: &Connection,
    ids: &[String],
    action: ReviewAction,
    now: DateTime<Utc>,
) -> TroveResult<usize> {
    let ts = format_ts(&now);
    let mut stmt = conn.prepare_cached(
        "UPDATE memories SET status = ?2, updated_at = ?3, \
         last_accessed_at = CASE WHEN ?4 THEN MAX(last_accessed_at, ?3) ELSE last_accessed_at END \
         WHERE id = ?1",
    )?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![
            id,
            action.status().as_str(),
            ts,
            action == ReviewAction::MarkFresh
        ])?;
    }
    tracing::info!(action = ?action, changed, "review applied");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_connection;
    use crate::memory::store::{create_memory, get_memory};
    use crate::memory::types::NewMemory;

    fn test_db() -> Connection {
        open_memory_connection(4).unwrap()
    }

    #[test]
    fn stale_memories_are_flagged() {
        let conn = test_db();
        let now = Utc::now();
        let old = create_memory(&conn, &NewMemory::new("old"), 4, now - Duration::days(45)).unwrap();
        let recent = create_memory(&conn, &NewMemory::new("recent"), 4, now - Duration::days(2)).unwrap();

        assert_eq!(review_candidates(&conn, 30, 10, now).unwrap().len(), 1);
        assert_eq!(mark_stale_for_review(&conn, 30, now).unwrap(), 1);

        assert_eq!(get_memory(&conn, &old.id).unwrap().status, MemoryStatus::NeedsReview);
        assert_eq!(get_memory(&conn, &recent.id).unwrap().status, MemoryStatus::Fresh);
        // Idempotent
        assert_eq!(mark_stale_for_review(&conn, 30, now).unwrap(), 0);
    }

    #[test]
    fn mark_fresh_restarts_window() {
        let conn = test_db();
        let now = Utc::now();
        let old = create_memory(&conn, &NewMemory::new("old"), 4, now - Duration::days(45)).unwrap();
        mark_stale_for_review(&conn, 30, now).unwrap();

        apply_review(&conn, &[old.id.clone()], ReviewAction::MarkFresh, now).unwrap();
        let memory = get_memory(&conn, &old.id).unwrap();
        assert_eq!(memory.status, MemoryStatus::Fresh);
        assert!(review_candidates(&conn, 30, 10, now).unwrap().is_empty());
    }

    #[test]
    fn archive_and_outdate_set_status() {
        let conn = test_db();
        let now = Utc::now();
        let a = create_memory(&conn, &NewMemory::new("a"), 4, now).unwrap();
        let b = create_memory(&conn, &NewMemory::new("b"), 4, now).unwrap();

        apply_review(&conn, &[a.id.clone()], ReviewAction::MarkArchived, now).unwrap();
        apply_review(&conn, &[b.id.clone()], ReviewAction::MarkOutdated, now).unwrap();

        assert_eq!(get_memory(&conn, &a.id).unwrap().status, MemoryStatus::Archived);
        let b = get_memory(&conn, &b.id).unwrap();
        assert_eq!(b.status, MemoryStatus::Outdated);
        assert_eq!(b.last_accessed_at, a.last_accessed_at);
    }
}
