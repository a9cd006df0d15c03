//! Deterministic feature-hashing embedding provider.
//!
//! Tokens (lower-cased alphanumeric runs) and adjacent token pairs are hashed
//! with SHA-256 into [`EMBEDDING_DIM`] signed buckets, then L2-normalized.
//! Texts sharing vocabulary land close together; identical text always
//! yields the identical vector.

use anyhow::Result;
use sha2::{Digest, Sha256};

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};

pub const MODEL_ID: &str = "hash-384";

/// Bigram features count for half as much as unigrams.
const BIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Default, Clone, Copy)]
pub struct HashingEmbeddingProvider;

impl HashingEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }

    fn bucket(feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let idx = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
            % EMBEDDING_DIM;
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        (idx, sign)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

impl EmbeddingProvider for HashingEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = tokenize(text);
        let mut v = vec![0.0f32; EMBEDDING_DIM];

        for token in &tokens {
            let (idx, sign) = Self::bucket(token);
            v[idx] += sign;
        }
        for pair in tokens.windows(2) {
            let (idx, sign) = Self::bucket(&format!("{} {}", pair[0], pair[1]));
            v[idx] += sign * BIGRAM_WEIGHT;
        }

        Ok(l2_normalize(&v))
    }

    fn model_id(&self) -> &str {
        MODEL_ID
    }
}
