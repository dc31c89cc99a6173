//! Importance decay and composite relevance scoring.
//!
//! Nothing here touches the database: every function is a pure function of
//! stored fields, the ranking configuration, and an explicit `now`.
//!
//! Derived importance:
//!
//! ```text
//! idle_days = max(0, now - last_accessed_at) in days
//! boost     = access_boost_max * (1 - exp(-access_count / access_boost_scale))
//! derived   = clamp(base - decay_rate_per_day * idle_days + boost, floor, 100)
//! ```
//!
//! The boost saturates at `access_boost_max`, so frequent use slows decay
//! without growing without bound. Recency is an exponential half-life on the
//! same idle time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

use crate::config::{RankingConfig, ScoreWeights};
use crate::memory::types::{Memory, MAX_IMPORTANCE, MIN_IMPORTANCE};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Per-signal inputs for one candidate, already normalized to `[0, 1]`.
/// `None` means the signal was not computed for this query.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Signals {
    pub lexical: Option<f64>,
    pub semantic: Option<f64>,
}

/// How a final score was composed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub lexical: f64,
    pub semantic: f64,
    pub recency: f64,
    /// Derived importance on the 0–100 scale.
    pub importance: f64,
    pub total: f64,
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Days since `since`, never negative.
pub fn idle_days(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let secs = (now - since).num_milliseconds() as f64 / 1000.0;
    (secs / SECONDS_PER_DAY).max(0.0)
}

/// Saturating boost for `access_count` recalls.
pub fn access_boost(access_count: u32, config: &RankingConfig) -> f64 {
    let max = finite_or(config.access_boost_max, 0.0).max(0.0);
    let scale = finite_or(config.access_boost_scale, 0.0);
    if scale <= 0.0 {
        return 0.0;
    }
    max * (1.0 - (-(access_count as f64) / scale).exp())
}

/// Current importance of a memory, in `[importance_floor, 100]`.
pub fn derived_importance(
    base_importance: u32,
    last_accessed_at: DateTime<Utc>,
    access_count: u32,
    config: &RankingConfig,
    now: DateTime<Utc>,
) -> f64 {
    let ceiling = MAX_IMPORTANCE as f64;
    let floor = finite_or(config.importance_floor, 0.0).clamp(0.0, ceiling);
    let base = (base_importance as f64).clamp(MIN_IMPORTANCE as f64, ceiling);
    let rate = finite_or(config.decay_rate_per_day, 0.0).max(0.0);

    let decayed = base - rate * idle_days(last_accessed_at, now);
    (decayed + access_boost(access_count, config)).clamp(floor, ceiling)
}

/// Convenience wrapper over [`derived_importance`] for a full record.
pub fn memory_importance(memory: &Memory, config: &RankingConfig, now: DateTime<Utc>) -> f64 {
    derived_importance(
        memory.base_importance,
        memory.last_accessed_at,
        memory.access_count,
        config,
        now,
    )
}

/// `1.0` for just-touched memories, halving every `recency_half_life_days`.
pub fn recency(last_accessed_at: DateTime<Utc>, config: &RankingConfig, now: DateTime<Utc>) -> f64 {
    let half_life = finite_or(config.recency_half_life_days, 0.0);
    if half_life <= 0.0 {
        return 0.0;
    }
    let days = idle_days(last_accessed_at, now);
    (-std::f64::consts::LN_2 * days / half_life).exp()
}

/// Weighted sum of all signals for one memory.
pub fn score(
    memory: &Memory,
    signals: Signals,
    weights: &ScoreWeights,
    config: &RankingConfig,
    now: DateTime<Utc>,
) -> ScoreBreakdown {
    let lexical = signals.lexical.map(|v| finite_or(v, 0.0).clamp(0.0, 1.0)).unwrap_or(0.0);
    let semantic = signals.semantic.map(|v| finite_or(v, 0.0).clamp(0.0, 1.0)).unwrap_or(0.0);
    let recency = recency(memory.last_accessed_at, config, now);
    let importance = memory_importance(memory, config, now);

    let total = weights.lexical * lexical
        + weights.semantic * semantic
        + weights.recency * recency
        + weights.importance * (importance / MAX_IMPORTANCE as f64);

    ScoreBreakdown {
        lexical,
        semantic,
        recency,
        importance,
        total: finite_or(total, 0.0),
    }
}

/// Scale raw scores into `[0, 1]` by dividing by the maximum.
///
/// Non-positive or non-finite inputs map to 0. Used for BM25, whose raw scale
/// depends on the corpus and query.
pub fn normalize_by_max(raw: &[f64]) -> Vec<f64> {
    let max = raw
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v > 0.0)
        .fold(0.0_f64, f64::max);
    raw.iter()
        .map(|v| {
            if max > 0.0 && v.is_finite() && *v > 0.0 {
                v / max
            } else {
                0.0
            }
        })
        .collect()
}

/// Map cosine similarity `[-1, 1]` onto `[0, 1]`; opposite vectors score 0.
pub fn normalize_cosine(cosine: f64) -> f64 {
    finite_or(cosine, 0.0).clamp(0.0, 1.0)
}

/// Final ordering: score descending, then newest `created_at`, then id.
pub fn compare_ranked(a: (f64, &Memory), b: (f64, &Memory)) -> Ordering {
    b.0.total_cmp(&a.0)
        .then_with(|| b.1.created_at.cmp(&a.1.created_at))
        .then_with(|| b.1.id.cmp(&a.1.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{MemoryStatus, MemoryType};
    use chrono::Duration;

    fn config() -> RankingConfig {
        RankingConfig::default()
    }

    fn memory(id: &str, created_at: DateTime<Utc>) -> Memory {
        Memory {
            id: id.into(),
            content: "x".into(),
            context: None,
            memory_type: MemoryType::General,
            status: MemoryStatus::Fresh,
            base_importance: 50,
            tags: vec![],
            access_count: 0,
            created_at,
            updated_at: created_at,
            last_accessed_at: created_at,
            source_session_id: None,
            source_project: None,
            embedding_pending: false,
        }
    }

    #[test]
    fn ten_idle_days_at_rate_one_drops_below_base() {
        let now = Utc::now();
        let config = RankingConfig {
            decay_rate_per_day: 1.0,
            ..config()
        };
        let value = derived_importance(50, now - Duration::days(10), 0, &config, now);
        assert!(value < 50.0);
        assert!(value >= config.importance_floor);
        assert!((value - 40.0).abs() < 1e-6);
    }

    #[test]
    fn decay_is_monotonic_in_idle_time() {
        let now = Utc::now();
        let config = config();
        let last = now - Duration::days(1);
        let mut previous = f64::INFINITY;
        for day in 0..400 {
            let at = last + Duration::days(day);
            let value = derived_importance(70, last, 3, &config, at);
            assert!(value <= previous, "importance rose on day {day}");
            previous = value;
        }
        assert_eq!(previous, config.importance_floor);
    }

    #[test]
    fn access_never_lowers_importance() {
        let now = Utc::now();
        let config = config();
        let last = now - Duration::days(20);
        for count in 0..50 {
            let fewer = derived_importance(40, last, count, &config, now);
            let more = derived_importance(40, last, count + 1, &config, now);
            assert!(more >= fewer);
        }
        // A recall also moves last_accessed_at forward.
        let untouched = derived_importance(40, last, 0, &config, now);
        let recalled = derived_importance(40, now, 1, &config, now);
        assert!(recalled >= untouched);
    }

    #[test]
    fn boost_saturates() {
        let config = config();
        let huge = access_boost(u32::MAX, &config);
        assert!(huge <= config.access_boost_max);
        assert!(derived_importance(100, Utc::now(), u32::MAX, &config, Utc::now()) <= 100.0);
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        let now = Utc::now();
        let config = config();
        // Future access time counts as zero idle days.
        let future = derived_importance(50, now + Duration::days(5), 0, &config, now);
        assert_eq!(future, 50.0);
        assert_eq!(derived_importance(500, now, 0, &config, now), 100.0);
        assert!(derived_importance(0, now, 0, &config, now) >= 1.0);
    }

    #[test]
    fn recency_halves_each_half_life() {
        let now = Utc::now();
        let config = config();
        let half = recency(now - Duration::days(14), &config, now);
        assert!((half - 0.5).abs() < 1e-3);
        assert!((recency(now, &config, now) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_signals_contribute_zero() {
        let now = Utc::now();
        let m = memory("mem_a", now);
        let weights = ScoreWeights {
            lexical: 1.0,
            semantic: 1.0,
            recency: 0.0,
            importance: 0.0,
        };
        let lexical_only = score(
            &m,
            Signals {
                lexical: Some(0.7),
                semantic: None,
            },
            &weights,
            &config(),
            now,
        );
        assert!((lexical_only.total - 0.7).abs() < 1e-9);
    }

    #[test]
    fn max_normalization_bounds_scores() {
        let scaled = normalize_by_max(&[2.0, 8.0, 0.0, -1.0, f64::NAN]);
        assert_eq!(scaled, vec![0.25, 1.0, 0.0, 0.0, 0.0]);
        assert!(normalize_by_max(&[]).is_empty());
        assert_eq!(normalize_cosine(-0.3), 0.0);
    }

    #[test]
    fn ties_break_by_newest_created_then_id() {
        let now = Utc::now();
        let older = memory("mem_b", now - Duration::hours(1));
        let newer = memory("mem_a", now);
        let twin = memory("mem_c", now);

        let mut ranked = vec![(0.5, &older), (0.5, &newer), (0.5, &twin)];
        ranked.sort_by(|a, b| compare_ranked(*a, *b));
        let ids: Vec<_> = ranked.iter().map(|(_, m)| m.id.as_str()).collect();
        assert_eq!(ids, vec!["mem_c", "mem_a", "mem_b"]);
    }
}
