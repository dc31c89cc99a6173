//! ONNX Runtime provider for sentence-transformer models.
//!
//! Tokenizes, runs the model, mean-pools token states under the attention
//! mask. The store normalizes vectors on insert, so no normalization here.

use std::sync::Mutex;

use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::EmbeddingProvider;
use crate::config::{expand_tilde, EmbeddingConfig};
use crate::error::{TroveError, TroveResult};

/// Longest token sequence fed to the model.
const MAX_SEQ_LEN: usize = 256;

pub struct LocalEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    model: String,
    dimensions: usize,
}

fn unavailable(e: impl std::fmt::Display) -> TroveError {
    TroveError::EmbeddingUnavailable(e.to_string())
}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> TroveResult<Self> {
        let cache_dir = expand_tilde(&config.cache_dir);
        let model_path = cache_dir.join("model.onnx");
        let tokenizer_path = cache_dir.join("tokenizer.json");

        for required in [&model_path, &tokenizer_path] {
            if !required.exists() {
                return Err(unavailable(format!("missing {}", required.display())));
            }
        }

        let session = Session::builder()
            .map_err(unavailable)?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(unavailable)?
            .with_intra_threads(4)
            .map_err(unavailable)?
            .commit_from_file(&model_path)
            .map_err(unavailable)?;
        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(unavailable)?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(unavailable)?;
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn embed(&self, text: &str) -> TroveResult<Vec<f32>> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| unavailable("model returned no output"))
    }

    fn embed_batch(&self, texts: &[&str]) -> TroveResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(unavailable)?;
        let batch = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for encoding in &encodings {
            ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            mask.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
        }

        let shape = vec![batch as i64, seq_len as i64];
        let ids_tensor =
            Tensor::from_array((shape.clone(), ids.into_boxed_slice())).map_err(unavailable)?;
        let mask_tensor = Tensor::from_array((shape.clone(), mask.clone().into_boxed_slice()))
            .map_err(unavailable)?;
        let type_tensor =
            Tensor::from_array((shape, vec![0i64; batch * seq_len].into_boxed_slice()))
                .map_err(unavailable)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| unavailable("inference session poisoned"))?;
        let outputs = session
            .run(ort::inputs! {
                "input_ids" => ids_tensor,
                "attention_mask" => mask_tensor,
                "token_type_ids" => type_tensor,
            })
            .map_err(unavailable)?;

        let hidden = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (dims, data) = hidden.try_extract_tensor::<f32>().map_err(unavailable)?;
        let dims: &[i64] = dims;
        if dims.len() != 3 || dims[2] as usize != self.dimensions {
            return Err(unavailable(format!(
                "unexpected output shape {dims:?}, expected [batch, seq, {}]",
                self.dimensions
            )));
        }
        let width = self.dimensions;
        let out_seq = dims[1] as usize;

        let mut pooled = Vec::with_capacity(batch);
        for b in 0..batch {
            let mut sum = vec![0.0f32; width];
            let mut count = 0.0f32;
            for s in 0..out_seq.min(seq_len) {
                if mask[b * seq_len + s] == 0 {
                    continue;
                }
                let offset = (b * out_seq + s) * width;
                for (acc, value) in sum.iter_mut().zip(&data[offset..offset + width]) {
                    *acc += value;
                }
                count += 1.0;
            }
            if count > 0.0 {
                sum.iter_mut().for_each(|v| *v /= count);
            }
            pooled.push(sum);
        }
        Ok(pooled)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_files_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            embedding_enabled: true,
            cache_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert!(matches!(
            LocalEmbeddingProvider::new(&config),
            Err(TroveError::EmbeddingUnavailable(_))
        ));
    }

    #[test]
    #[ignore] // needs model files in the default cache dir
    fn embeds_to_configured_width() {
        let config = EmbeddingConfig {
            embedding_enabled: true,
            ..Default::default()
        };
        let provider = LocalEmbeddingProvider::new(&config).unwrap();
        let vectors = provider.embed_batch(&["first", "second sentence"]).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 384));
    }
}
