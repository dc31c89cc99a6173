//! Typed, directed edges between memories.
//!
//! Edges are stored as id pairs in `relationships`; there are no in-memory
//! node references, so cycles are harmless and traversal stays cycle-safe
//! through a visited set. Edges whose endpoint no longer exists are never
//! returned and can be swept with [`prune_dangling`].

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::db::{format_ts, ts_column};
use crate::error::{TroveError, TroveResult};
use crate::memory::store::memory_exists;

pub const DEFAULT_STRENGTH: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    RelatedTo,
    Supersedes,
    DerivedFrom,
    Contradicts,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RelatedTo => "related_to",
            Self::Supersedes => "supersedes",
            Self::DerivedFrom => "derived_from",
            Self::Contradicts => "contradicts",
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "related_to" => Ok(Self::RelatedTo),
            "supersedes" => Ok(Self::Supersedes),
            "derived_from" => Ok(Self::DerivedFrom),
            "contradicts" => Ok(Self::Contradicts),
            _ => Err(format!("unknown relationship type: {s}")),
        }
    }
}

/// A stored edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

/// Which way an edge points relative to the node it was reached from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A memory reached by traversal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub memory_id: String,
    /// The already-visited memory this one was reached from.
    pub via: String,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    pub strength: f64,
    pub direction: Direction,
    /// 1 for direct neighbors.
    pub depth: usize,
}

/// Create or refresh an edge. Rejects self-loops, unknown endpoints and
/// strengths outside `[0, 1]`. Linking the same triple again overwrites its
/// strength.
pub fn link(
    conn: &Connection,
    source_id: &str,
    target_id: &str,
    relation_type: RelationType,
    strength: Option<f64>,
    now: DateTime<Utc>,
) -> TroveResult<Relationship> {
    if source_id == target_id {
        return Err(TroveError::validation(format!(
            "a memory cannot be related to itself: {source_id}"
        )));
    }
    let strength = strength.unwrap_or(DEFAULT_STRENGTH);
    if !(0.0..=1.0).contains(&strength) {
        return Err(TroveError::validation(format!(
            "relationship strength must be within [0, 1], got {strength}"
        )));
    }
    for id in [source_id, target_id] {
        if !memory_exists(conn, id)? {
            return Err(TroveError::not_found("memory", id));
        }
    }

    conn.execute(
        "INSERT INTO relationships (source_id, target_id, type, strength, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(source_id, target_id, type) DO UPDATE SET strength = excluded.strength",
        params![
            source_id,
            target_id,
            relation_type.as_str(),
            strength,
            format_ts(&now)
        ],
    )?;
    tracing::debug!(source_id, target_id, relation = %relation_type, strength, "linked");

    conn.query_row(
        "SELECT source_id, target_id, type, strength, created_at FROM relationships \
         WHERE source_id = ?1 AND target_id = ?2 AND type = ?3",
        params![source_id, target_id, relation_type.as_str()],
        row_to_relationship,
    )
    .map_err(Into::into)
}

/// Remove one edge. Returns whether it existed.
pub fn unlink(
    conn: &Connection,
    source_id: &str,
    target_id: &str,
    relation_type: RelationType,
) -> TroveResult<bool> {
    let removed = conn.execute(
        "DELETE FROM relationships WHERE source_id = ?1 AND target_id = ?2 AND type = ?3",
        params![source_id, target_id, relation_type.as_str()],
    )?;
    Ok(removed > 0)
}

fn row_to_relationship(row: &rusqlite::Row<'_>) -> rusqlite::Result<Relationship> {
    let relation_type: String = row.get(2)?;
    Ok(Relationship {
        source_id: row.get(0)?,
        target_id: row.get(1)?,
        relation_type: relation_type.parse().unwrap_or(RelationType::RelatedTo),
        strength: row.get::<_, f64>(3)?.clamp(0.0, 1.0),
        created_at: ts_column(row, 4)?,
    })
}

/// Edges touching a memory in either direction whose far end still exists.
pub fn edges_for(conn: &Connection, memory_id: &str) -> TroveResult<Vec<Relationship>> {
    let mut stmt = conn.prepare(
        "SELECT r.source_id, r.target_id, r.type, r.strength, r.created_at \
         FROM relationships r \
         JOIN memories s ON s.id = r.source_id \
         JOIN memories t ON t.id = r.target_id \
         WHERE r.source_id = ?1 OR r.target_id = ?1 \
         ORDER BY r.strength DESC, r.created_at ASC",
    )?;
    let rows = stmt
        .query_map([memory_id], row_to_relationship)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Live edges adjacent to one node, strongest first.
fn adjacent(conn: &Connection, node: &str) -> TroveResult<Vec<(String, RelationType, f64, Direction)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT r.target_id, r.type, r.strength, 0 FROM relationships r \
           JOIN memories m ON m.id = r.target_id WHERE r.source_id = ?1 \
         UNION ALL \
         SELECT r.source_id, r.type, r.strength, 1 FROM relationships r \
           JOIN memories m ON m.id = r.source_id WHERE r.target_id = ?1 \
         ORDER BY 3 DESC, 1 ASC",
    )?;
    let rows = stmt
        .query_map([node], |row| {
            let relation_type: String = row.get(1)?;
            let incoming: bool = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                relation_type.parse().unwrap_or(RelationType::RelatedTo),
                row.get::<_, f64>(2)?,
                if incoming {
                    Direction::Incoming
                } else {
                    Direction::Outgoing
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Breadth-first traversal in both edge directions up to `max_depth`.
///
/// Each memory is reported once, at the depth it was first reached. Stops
/// early when a level discovers nothing new.
pub fn neighbors(conn: &Connection, memory_id: &str, max_depth: usize) -> TroveResult<Vec<Neighbor>> {
    if !memory_exists(conn, memory_id)? {
        return Err(TroveError::not_found("memory", memory_id));
    }

    let mut visited: HashSet<String> = HashSet::from([memory_id.to_string()]);
    let mut frontier = vec![memory_id.to_string()];
    let mut found = Vec::new();

    for depth in 1..=max_depth {
        let mut next = Vec::new();
        for node in &frontier {
            for (other, relation_type, strength, direction) in adjacent(conn, node)? {
                if !visited.insert(other.clone()) {
                    continue;
                }
                found.push(Neighbor {
                    memory_id: other.clone(),
                    via: node.clone(),
                    relation_type,
                    strength,
                    direction,
                    depth,
                });
                next.push(other);
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    Ok(found)
}

/// Delete edges whose source or target no longer exists.
pub fn prune_dangling(conn: &Connection) -> TroveResult<usize> {
    let removed = conn.execute(
        "DELETE FROM relationships \
         WHERE source_id NOT IN (SELECT id FROM memories) \
            OR target_id NOT IN (SELECT id FROM memories)",
        [],
    )?;
    if removed > 0 {
        tracing::info!(removed, "pruned dangling relationships");
    }
    Ok(removed)
}
