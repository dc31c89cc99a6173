//! Search coordinator: the single read path for recall.
//!
//! Lexical candidates come from FTS5 (BM25), semantic candidates from the
//! sqlite-vec KNN index. Each signal is normalized to `[0, 1]` before the
//! ranking engine combines it with recency and derived importance, so raw
//! BM25 and cosine values are never compared directly.
//!
//! Access bumps are not done here; the caller records them after the read.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::{RankingConfig, ScoreWeights, SearchSettings};
use crate::error::{TroveError, TroveResult};
use crate::memory::ranking::{self, ScoreBreakdown, Signals};
use crate::memory::relations::{self, Direction, RelationType};
use crate::memory::store::{fetch_filtered, filter_clause};
use crate::memory::types::{Memory, MemoryFilter};
use crate::memory::{embedding_to_bytes, l2_normalize, l2_to_cosine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    #[serde(alias = "lexical")]
    Keyword,
    Semantic,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword" | "lexical" => Ok(Self::Keyword),
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(format!("unknown search mode: {s}")),
        }
    }
}

/// The query embedding, or why there is none.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryVector {
    Ready(Vec<f32>),
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub filter: MemoryFilter,
    /// 0 uses the configured default.
    pub limit: usize,
    /// Relationship hops to follow from each hit; 0 disables expansion.
    pub expand_depth: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, mode: SearchMode) -> Self {
        Self {
            query: query.into(),
            mode,
            filter: MemoryFilter::default(),
            limit: 0,
            expand_depth: 0,
        }
    }
}

/// A direct match.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub memory: Memory,
    pub score: ScoreBreakdown,
}

/// A memory pulled in through the relationship graph, not by the query.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedHit {
    pub memory: Memory,
    pub via: String,
    #[serde(rename = "relation")]
    pub relation_type: RelationType,
    pub direction: Direction,
    pub depth: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub related: Vec<RelatedHit>,
    /// The mode actually executed.
    pub mode: SearchMode,
    /// Hybrid fell back to lexical-only because no query vector was available.
    pub degraded: bool,
}

impl SearchResponse {
    pub fn hit_ids(&self) -> Vec<String> {
        self.hits.iter().map(|h| h.memory.id.clone()).collect()
    }
}

/// Run a search against one store.
pub fn search(
    conn: &Connection,
    request: &SearchRequest,
    query_vector: &QueryVector,
    ranking: &RankingConfig,
    settings: &SearchSettings,
    now: DateTime<Utc>,
) -> TroveResult<SearchResponse> {
    if request.query.trim().is_empty() {
        return Err(TroveError::validation("search query must not be empty"));
    }

    let limit = if request.limit == 0 {
        settings.default_limit
    } else {
        request.limit
    };
    let candidates = limit.saturating_mul(settings.candidate_multiplier.max(1));

    let vector = match query_vector {
        QueryVector::Ready(v) => Some(v.as_slice()),
        QueryVector::Unavailable(_) => None,
    };

    let (mode, degraded, weights): (SearchMode, bool, &ScoreWeights) = match (request.mode, vector) {
        (SearchMode::Keyword, _) => (SearchMode::Keyword, false, &ranking.keyword_weights),
        (SearchMode::Semantic, Some(_)) => (SearchMode::Semantic, false, &ranking.semantic_weights),
        (SearchMode::Semantic, None) => {
            let reason = match query_vector {
                QueryVector::Unavailable(reason) => reason.clone(),
                QueryVector::Ready(_) => String::new(),
            };
            return Err(TroveError::EmbeddingUnavailable(reason));
        }
        (SearchMode::Hybrid, Some(_)) => (SearchMode::Hybrid, false, &ranking.hybrid_weights),
        (SearchMode::Hybrid, None) => {
            tracing::warn!(query = %request.query, "no query embedding, hybrid search degraded to keyword");
            (SearchMode::Keyword, true, &ranking.keyword_weights)
        }
    };

    let lexical = if mode == SearchMode::Semantic {
        Vec::new()
    } else {
        lexical_candidates(conn, &request.query, &request.filter, candidates)?
    };
    let semantic = match (mode, vector) {
        (SearchMode::Semantic | SearchMode::Hybrid, Some(v)) => {
            vector_candidates(conn, v, &request.filter, candidates)?
        }
        _ => Vec::new(),
    };
    tracing::debug!(
        mode = %mode,
        lexical = lexical.len(),
        semantic = semantic.len(),
        limit,
        "search candidates"
    );

    let lexical_scores: HashMap<String, f64> = {
        let raw: Vec<f64> = lexical.iter().map(|(_, s)| *s).collect();
        lexical
            .iter()
            .map(|(id, _)| id.clone())
            .zip(ranking::normalize_by_max(&raw))
            .collect()
    };
    let semantic_scores: HashMap<String, f64> = semantic
        .iter()
        .map(|(id, distance)| (id.clone(), ranking::normalize_cosine(l2_to_cosine(*distance))))
        .collect();

    let mut ids: Vec<String> = lexical.iter().map(|(id, _)| id.clone()).collect();
    let mut seen: HashSet<String> = ids.iter().cloned().collect();
    for (id, _) in &semantic {
        if seen.insert(id.clone()) {
            ids.push(id.clone());
        }
    }

    let memories = fetch_filtered(conn, &ids, &request.filter)?;
    let mut scored: Vec<(ScoreBreakdown, &Memory)> = memories
        .values()
        .map(|memory| {
            let signals = Signals {
                lexical: lexical_scores.get(&memory.id).copied(),
                semantic: semantic_scores.get(&memory.id).copied(),
            };
            (ranking::score(memory, signals, weights, ranking, now), memory)
        })
        .collect();
    scored.sort_by(|a, b| ranking::compare_ranked((a.0.total, a.1), (b.0.total, b.1)));
    scored.truncate(limit);

    let hits: Vec<SearchHit> = scored
        .into_iter()
        .map(|(score, memory)| SearchHit {
            memory: memory.clone(),
            score,
        })
        .collect();

    let related = if request.expand_depth > 0 {
        expand_related(conn, &hits, request.expand_depth, &request.filter)?
    } else {
        Vec::new()
    };

    Ok(SearchResponse {
        hits,
        related,
        mode,
        degraded,
    })
}

/// Graph neighbors of the hits that pass the filter and are not hits themselves.
fn expand_related(
    conn: &Connection,
    hits: &[SearchHit],
    depth: usize,
    filter: &MemoryFilter,
) -> TroveResult<Vec<RelatedHit>> {
    let mut seen: HashSet<String> = hits.iter().map(|h| h.memory.id.clone()).collect();
    let mut found = Vec::new();
    for hit in hits {
        for neighbor in relations::neighbors(conn, &hit.memory.id, depth)? {
            if seen.insert(neighbor.memory_id.clone()) {
                found.push(neighbor);
            }
        }
    }

    let ids: Vec<String> = found.iter().map(|n| n.memory_id.clone()).collect();
    let mut memories = fetch_filtered(conn, &ids, filter)?;
    Ok(found
        .into_iter()
        .filter_map(|n| {
            memories.remove(&n.memory_id).map(|memory| RelatedHit {
                memory,
                via: n.via,
                relation_type: n.relation_type,
                direction: n.direction,
                depth: n.depth,
            })
        })
        .collect())
}

/// FTS5 BM25 candidates that satisfy `filter`, best first.
///
/// Returns `(id, score)` with score positive (FTS5 `rank` is negative, more
/// negative = better).
fn lexical_candidates(
    conn: &Connection,
    query: &str,
    filter: &MemoryFilter,
    limit: usize,
) -> TroveResult<Vec<(String, f64)>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }

    let mut values = vec![Value::Text(escaped)];
    let clause = filter_clause(filter, &mut values);
    values.push(Value::Integer(limit as i64));

    let sql = format!(
        "SELECT m.id, memories_fts.rank FROM memories_fts \
         JOIN memories m ON m.rowid = memories_fts.rowid \
         WHERE memories_fts MATCH ? AND {clause} \
         ORDER BY memories_fts.rank LIMIT ?"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            Ok((row.get::<_, String>(0)?, -row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Largest `k` sqlite-vec accepts in a KNN query.
const KNN_MAX_K: usize = 4096;

/// Nearest neighbors by L2 distance over unit vectors, restricted to
/// memories that satisfy `filter`.
///
/// The KNN window widens until `limit` neighbors pass the filter or the
/// index runs out. Past the KNN cap the filtered rows are scanned directly.
fn vector_candidates(
    conn: &Connection,
    embedding: &[f32],
    filter: &MemoryFilter,
    limit: usize,
) -> TroveResult<Vec<(String, f64)>> {
    let normalized = l2_normalize(embedding);
    let query = embedding_to_bytes(&normalized);
    let limit = limit.max(1);

    let mut k = limit;
    loop {
        let window = k.min(KNN_MAX_K);
        let neighbors = knn(conn, query, window)?;
        let exhausted = neighbors.len() < window;

        let ids: Vec<String> = neighbors.iter().map(|(id, _)| id.clone()).collect();
        let passing = matching_ids(conn, &ids, filter)?;
        let kept: Vec<(String, f64)> = neighbors
            .into_iter()
            .filter(|(id, _)| passing.contains(id))
            .take(limit)
            .collect();

        if kept.len() >= limit || exhausted {
            return Ok(kept);
        }
        if window == KNN_MAX_K {
            tracing::debug!(limit, "knn window capped, scanning filtered vectors");
            return filtered_vector_scan(conn, query, filter, limit);
        }
        k = k.saturating_mul(4);
    }
}

fn knn(conn: &Connection, query: &[u8], k: usize) -> TroveResult<Vec<(String, f64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, distance FROM memories_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![query, k as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The subset of `ids` whose memories satisfy `filter`.
fn matching_ids(
    conn: &Connection,
    ids: &[String],
    filter: &MemoryFilter,
) -> TroveResult<HashSet<String>> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }
    let mut values: Vec<Value> = ids.iter().map(|id| Value::Text(id.clone())).collect();
    let placeholders = vec!["?"; ids.len()].join(", ");
    let clause = filter_clause(filter, &mut values);
    let sql = format!("SELECT m.id FROM memories m WHERE m.id IN ({placeholders}) AND {clause}");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(rows)
}

/// Exact distances over every vector whose memory satisfies `filter`.
fn filtered_vector_scan(
    conn: &Connection,
    query: &[u8],
    filter: &MemoryFilter,
    limit: usize,
) -> TroveResult<Vec<(String, f64)>> {
    let mut values = vec![Value::Blob(query.to_vec())];
    let clause = filter_clause(filter, &mut values);
    values.push(Value::Integer(limit as i64));

    let sql = format!(
        "SELECT m.id, vec_distance_l2(v.embedding, ?) AS distance FROM memories m \
         JOIN memories_vec v ON v.id = m.id \
         WHERE {clause} ORDER BY distance LIMIT ?"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Each whitespace-delimited word is quoted (so operators and punctuation are
/// literal) and the words are OR-joined: a memory matching any word is a
/// candidate, and BM25 rewards those matching more of them.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .map(|word| format!("\"{word}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}
