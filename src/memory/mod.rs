pub mod categorize;
pub mod ranking;
pub mod relations;
pub mod review;
pub mod search;
pub mod stats;
pub mod store;
pub mod types;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Scale a vector to unit length. A zero vector is returned unchanged.
pub fn l2_normalize(embedding: &[f32]) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return embedding.to_vec();
    }
    embedding.iter().map(|x| x / norm).collect()
}

/// Cosine similarity from the L2 distance between two unit vectors.
///
/// For unit vectors `|a - b|² = 2 - 2·cos`, so `cos = 1 - d²/2`.
pub fn l2_to_cosine(distance: f64) -> f64 {
    (1.0 - distance * distance / 2.0).clamp(-1.0, 1.0)
}

/// Time-ordered identifier with a record-kind prefix, e.g. `mem_0192...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::now_v7().simple())
}
