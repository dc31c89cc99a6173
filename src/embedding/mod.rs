//! Text-to-vector embedding.
//!
//! Stores never embed inline: writes flag a memory `embedding_pending` and
//! the [`worker::EmbeddingWorkers`] pool fills the vector in later. The only
//! inline call is embedding a search query, which the engine bounds with the
//! search timeout.

#[cfg(feature = "local-embeddings")]
pub mod local;
pub mod worker;

use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::{TroveError, TroveResult};

/// Produces fixed-length vectors for text.
///
/// Methods are synchronous; async callers go through
/// `tokio::task::spawn_blocking`. Failures should be reported as
/// [`TroveError::EmbeddingUnavailable`].
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> TroveResult<Vec<f32>>;

    /// Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> TroveResult<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize;

    /// Identifier recorded in each store so a model switch can be detected.
    fn model_name(&self) -> &str;
}

/// Build the configured provider, or `None` when embeddings are disabled.
pub fn create_provider(config: &EmbeddingConfig) -> TroveResult<Option<Arc<dyn EmbeddingProvider>>> {
    if !config.embedding_enabled {
        return Ok(None);
    }
    match config.provider.as_str() {
        #[cfg(feature = "local-embeddings")]
        "local" => {
            let provider = local::LocalEmbeddingProvider::new(config)?;
            Ok(Some(Arc::new(provider)))
        }
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(TroveError::EmbeddingUnavailable(
            "built without the local-embeddings feature".into(),
        )),
        other => Err(TroveError::EmbeddingUnavailable(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic provider: a letter-frequency histogram folded into
    /// `dim` buckets. Texts sharing words land close together.
    pub struct HistogramProvider {
        pub dim: usize,
        pub calls: AtomicUsize,
    }

    impl HistogramProvider {
        pub fn new(dim: usize) -> Self {
            Self {
                dim,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl EmbeddingProvider for HistogramProvider {
        fn embed(&self, text: &str) -> TroveResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut v = vec![0.0f32; self.dim];
            for b in text.to_lowercase().bytes().filter(u8::is_ascii_alphabetic) {
                v[(b - b'a') as usize % self.dim] += 1.0;
            }
            if v.iter().all(|x| *x == 0.0) {
                v[0] = 1.0;
            }
            Ok(v)
        }

        fn dimensions(&self) -> usize {
            self.dim
        }

        fn model_name(&self) -> &str {
            "histogram-test"
        }
    }

    #[test]
    fn disabled_config_yields_no_provider() {
        let config = EmbeddingConfig::default();
        assert!(create_provider(&config).unwrap().is_none());
    }

    #[test]
    fn unknown_provider_is_unavailable() {
        let config = EmbeddingConfig {
            embedding_enabled: true,
            provider: "cloud".into(),
            ..Default::default()
        };
        assert!(matches!(
            create_provider(&config),
            Err(TroveError::EmbeddingUnavailable(_))
        ));
    }
}
