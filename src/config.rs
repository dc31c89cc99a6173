use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TroveConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub ranking: RankingConfig,
    pub search: SearchSettings,
    pub session: SessionConfig,
    pub activity: ActivityConfig,
    pub sync: SyncConfig,
    pub review: ReviewConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory created inside each project root to hold its store.
    pub project_dir_name: String,
    pub db_file_name: String,
    pub global_db_path: String,
    /// Bounded wait for the per-store write lock before `StoreBusy`.
    pub write_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub embedding_enabled: bool,
    /// Provider name; only `"local"` (ONNX, `local-embeddings` feature) ships.
    pub provider: String,
    /// Model identifier recorded in each store.
    pub model: String,
    /// Directory holding `model.onnx` and `tokenizer.json`.
    pub cache_dir: String,
    pub dimensions: usize,
    pub workers: usize,
    pub queue_capacity: usize,
}

/// Weight vector applied by the scorer. Missing signals contribute zero.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub lexical: f64,
    pub semantic: f64,
    pub recency: f64,
    pub importance: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RankingConfig {
    /// Importance points lost per idle day.
    pub decay_rate_per_day: f64,
    pub importance_floor: f64,
    /// Upper bound of the access-frequency boost (importance points).
    pub access_boost_max: f64,
    /// Access count at which the boost reaches ~63% of its maximum.
    pub access_boost_scale: f64,
    pub recency_half_life_days: f64,
    pub keyword_weights: ScoreWeights,
    pub semantic_weights: ScoreWeights,
    pub hybrid_weights: ScoreWeights,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchSettings {
    pub default_search_mode: crate::memory::search::SearchMode,
    pub default_limit: usize,
    pub timeout_ms: u64,
    /// Candidates fetched per index = limit * multiplier (before filtering).
    pub candidate_multiplier: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub context_depth: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ActivityConfig {
    pub max_output_truncation: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub global_sync_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReviewConfig {
    pub freshness_review_days: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let global_db_path = default_trove_dir()
            .join("global.db")
            .to_string_lossy()
            .into_owned();
        Self {
            project_dir_name: ".trove".into(),
            db_file_name: "memory.db".into(),
            global_db_path,
            write_timeout_ms: 5000,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_trove_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            embedding_enabled: false,
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            dimensions: 384,
            workers: 2,
            queue_capacity: 256,
        }
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            lexical: 0.35,
            semantic: 0.35,
            recency: 0.1,
            importance: 0.2,
        }
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            decay_rate_per_day: 0.5,
            importance_floor: 5.0,
            access_boost_max: 20.0,
            access_boost_scale: 10.0,
            recency_half_life_days: 14.0,
            keyword_weights: ScoreWeights {
                lexical: 0.6,
                semantic: 0.0,
                recency: 0.15,
                importance: 0.25,
            },
            semantic_weights: ScoreWeights {
                lexical: 0.0,
                semantic: 0.6,
                recency: 0.15,
                importance: 0.25,
            },
            hybrid_weights: ScoreWeights::default(),
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_search_mode: crate::memory::search::SearchMode::Hybrid,
            default_limit: 10,
            timeout_ms: 2000,
            candidate_multiplier: 5,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { context_depth: 3 }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            max_output_truncation: 10_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            global_sync_enabled: true,
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            freshness_review_days: 30,
        }
    }
}

/// Returns `~/.trove/`, or `$TROVE_HOME` when set.
pub fn default_trove_dir() -> PathBuf {
    if let Ok(home) = std::env::var("TROVE_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".trove")
}

/// Returns the default config file path: `~/.trove/config.toml`
pub fn default_config_path() -> PathBuf {
    default_trove_dir().join("config.toml")
}

impl TroveConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            TroveConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (TROVE_GLOBAL_DB, TROVE_LOG_LEVEL, TROVE_EMBEDDING_ENABLED).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TROVE_GLOBAL_DB") {
            self.storage.global_db_path = val;
        }
        if let Ok(val) = std::env::var("TROVE_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("TROVE_EMBEDDING_ENABLED") {
            self.embedding.embedding_enabled = matches!(val.as_str(), "1" | "true" | "yes");
        }
    }

    /// Store location for a project: `<project>/.trove/memory.db`.
    pub fn project_db_path(&self, project_path: impl AsRef<Path>) -> PathBuf {
        project_path
            .as_ref()
            .join(&self.storage.project_dir_name)
            .join(&self.storage.db_file_name)
    }

    /// Resolve the global database path, expanding `~` if needed.
    pub fn resolved_global_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.global_db_path)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.write_timeout_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search.timeout_ms)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::search::SearchMode;

    #[test]
    fn default_config_is_valid() {
        let config = TroveConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert!(!config.embedding.embedding_enabled);
        assert_eq!(config.ranking.decay_rate_per_day, 0.5);
        assert_eq!(config.review.freshness_review_days, 30);
        assert_eq!(config.search.default_search_mode, SearchMode::Hybrid);
        assert!(config.sync.global_sync_enabled);
        assert_eq!(config.session.context_depth, 3);
        assert_eq!(config.activity.max_output_truncation, 10_000);
        assert!(config.storage.global_db_path.ends_with("global.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[ranking]
decay_rate_per_day = 1.0

[ranking.hybrid_weights]
lexical = 0.5
semantic = 0.5

[search]
default_search_mode = "keyword"

[sync]
global_sync_enabled = false
"#;
        let config: TroveConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.ranking.decay_rate_per_day, 1.0);
        assert_eq!(config.ranking.hybrid_weights.lexical, 0.5);
        assert_eq!(config.search.default_search_mode, SearchMode::Keyword);
        assert!(!config.sync.global_sync_enabled);
        // defaults still apply for unset fields
        assert_eq!(config.ranking.importance_floor, 5.0);
        assert_eq!(config.search.default_limit, 10);
    }

    #[test]
    fn project_db_path_is_scoped_to_project() {
        let config = TroveConfig::default();
        let path = config.project_db_path("/work/app");
        assert_eq!(path, PathBuf::from("/work/app/.trove/memory.db"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = TroveConfig::default();
        std::env::set_var("TROVE_GLOBAL_DB", "/tmp/override-global.db");
        std::env::set_var("TROVE_LOG_LEVEL", "trace");
        std::env::set_var("TROVE_EMBEDDING_ENABLED", "true");

        config.apply_env_overrides();

        assert_eq!(config.storage.global_db_path, "/tmp/override-global.db");
        assert_eq!(config.server.log_level, "trace");
        assert!(config.embedding.embedding_enabled);

        std::env::remove_var("TROVE_GLOBAL_DB");
        std::env::remove_var("TROVE_LOG_LEVEL");
        std::env::remove_var("TROVE_EMBEDDING_ENABLED");
    }
}
