//! Text-to-vector embedding pipeline.
//!
//! The memory graph treats embeddings as an opaque pure function `text -> [f32; 384]`.
//! Two providers exist: a local ONNX model (all-MiniLM-L6-v2) and a deterministic
//! feature-hashing provider that needs no model files.

pub mod hashing;
pub mod local;

use anyhow::Result;

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`EMBEDDING_DIM`] dimensions
/// and must return vectors within a small tolerance for identical input.
/// All methods are synchronous; callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Identifier recorded in `schema_meta` so model switches can be detected.
    fn model_id(&self) -> &str;
}

/// Create an embedding provider from config.
///
/// `"local"` needs the ONNX model on disk (`cairn model download`); `"hash"` is self-contained.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(local::LocalEmbeddingProvider::new(config)?)),
        "hash" => Ok(Box::new(hashing::HashingEmbeddingProvider::new())),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, hash"),
    }
}

/// Model id the configured provider stamps on its vectors, without loading it.
pub fn configured_model_id(config: &crate::config::EmbeddingConfig) -> Result<String> {
    match config.provider.as_str() {
        "local" => Ok(config.model.clone()),
        "hash" => Ok(hashing::MODEL_ID.to_string()),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, hash"),
    }
}

/// L2-normalize a vector. Returns the input unchanged if its norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Cosine similarity of two vectors; 0.0 when either is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}
