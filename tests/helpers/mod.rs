#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use trove::config::TroveConfig;
use trove::db::{Database, StoreOptions};
use trove::embedding::EmbeddingProvider;
use trove::{Trove, TroveResult};

/// Vector width used by every test store.
pub const DIM: usize = 8;

/// Config whose global store lives under `home`.
pub fn test_config(home: &Path) -> TroveConfig {
    let mut config = TroveConfig::default();
    config.storage.global_db_path = home.join("global.db").to_string_lossy().into_owned();
    config.storage.write_timeout_ms = 500;
    config.embedding.dimensions = DIM;
    config
}

/// File-backed project store plus global store, no embeddings.
pub fn open_trove(home: &Path, project: &Path) -> Trove {
    Trove::open(test_config(home), project).unwrap()
}

/// Same as [`open_trove`] with [`WordBucketProvider`] wired in.
/// Must run inside a tokio runtime for the worker pool to start.
pub fn open_trove_with_embeddings(home: &Path, project: &Path) -> Trove {
    let config = test_config(home);
    let options = StoreOptions::from_config(&config);
    let project_db = Database::open(config.project_db_path(project), options.clone()).unwrap();
    let global_db = Database::open(config.resolved_global_db_path(), options).unwrap();
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(WordBucketProvider);
    Trove::with_stores(config, project, project_db, Some(global_db), Some(provider)).unwrap()
}

/// Deterministic vector with a spike at `seed`.
pub fn spike_embedding(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    v[seed % DIM] = 1.0;
    v
}

/// The vector [`WordBucketProvider`] produces for `text`.
pub fn word_vector(text: &str) -> Vec<f32> {
    WordBucketProvider.embed(text).unwrap()
}

/// A vector pointing near, but not along, `v`.
pub fn blurred(v: &[f32]) -> Vec<f32> {
    v.iter().map(|x| x + 1.0).collect()
}

/// Word-count vector: each lowercase word is hashed into one of `DIM`
/// buckets. Texts sharing words point the same way.
pub struct WordBucketProvider;

impl EmbeddingProvider for WordBucketProvider {
    fn embed(&self, text: &str) -> TroveResult<Vec<f32>> {
        let mut v = vec![0.0f32; DIM];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
            v[bucket % DIM] += 1.0;
        }
        if v.iter().all(|x| *x == 0.0) {
            v[0] = 1.0;
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        DIM
    }

    fn model_name(&self) -> &str {
        "word-bucket-test"
    }
}
