//! Local ONNX Runtime embedding provider (all-MiniLM-L6-v2).

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Encoding, Tokenizer};

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};
use crate::config::EmbeddingConfig;

/// all-MiniLM-L6-v2 was trained with 256-token sequences.
const MAX_SEQ_LEN: usize = 256;

pub struct LocalEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    model: String,
}

// Safety: Tokenizer is Send+Sync and the Session is only reached through the Mutex.
unsafe impl Send for LocalEmbeddingProvider {}
unsafe impl Sync for LocalEmbeddingProvider {}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let cache_dir = crate::config::expand_tilde(&config.cache_dir);
        let model_path = cache_dir.join("model.onnx");
        let tokenizer_path = cache_dir.join("tokenizer.json");

        for required in [&model_path, &tokenizer_path] {
            anyhow::ensure!(
                required.exists(),
                "{} not found. Run `cairn model download` first.",
                required.display()
            );
        }

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;
        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        let tokenizer = load_tokenizer(&tokenizer_path)?;
        tracing::info!(tokenizer = %tokenizer_path.display(), "tokenizer loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model: config.model.clone(),
        })
    }
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::from_file(path)
        .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
    tokenizer
        .with_truncation(Some(tokenizers::TruncationParams {
            max_length: MAX_SEQ_LEN,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
    tokenizer.with_padding(Some(tokenizers::PaddingParams {
        strategy: tokenizers::PaddingStrategy::BatchLongest,
        ..Default::default()
    }));
    Ok(tokenizer)
}

/// Flatten a padded batch into row-major `i64` id and mask buffers.
fn flatten_batch(encodings: &[Encoding]) -> (Vec<i64>, Vec<i64>) {
    let ids = encodings
        .iter()
        .flat_map(|e| e.get_ids().iter().map(|&id| id as i64))
        .collect();
    let mask = encodings
        .iter()
        .flat_map(|e| e.get_attention_mask().iter().map(|&m| m as i64))
        .collect();
    (ids, mask)
}

/// Attention-masked mean over the token axis of a `[batch, seq, dim]` tensor.
fn mean_pool(
    data: &[f32],
    mask: &[i64],
    batch: usize,
    mask_seq_len: usize,
    out_seq_len: usize,
    dim: usize,
) -> Vec<Vec<f32>> {
    (0..batch)
        .map(|b| {
            let mut sum = vec![0.0f32; dim];
            let mut weight = 0.0f32;
            for s in 0..out_seq_len {
                let m = mask[b * mask_seq_len + s] as f32;
                if m == 0.0 {
                    continue;
                }
                let offset = (b * out_seq_len + s) * dim;
                for (acc, value) in sum.iter_mut().zip(&data[offset..offset + dim]) {
                    *acc += value * m;
                }
                weight += m;
            }
            if weight > 0.0 {
                sum.iter_mut().for_each(|x| *x /= weight);
            }
            l2_normalize(&sum)
        })
        .collect()
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .context("embedding batch returned no vectors")
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
        let batch = encodings.len();
        let seq_len = encodings[0].get_ids().len();
        let (ids, mask) = flatten_batch(&encodings);

        let shape = vec![batch as i64, seq_len as i64];
        let ids_tensor = Tensor::from_array((shape.clone(), ids.into_boxed_slice()))?;
        let mask_tensor = Tensor::from_array((shape.clone(), mask.clone().into_boxed_slice()))?;
        // single-segment input
        let type_ids = vec![0i64; batch * seq_len];
        let type_tensor = Tensor::from_array((shape, type_ids.into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => ids_tensor,
            "attention_mask" => mask_tensor,
            "token_type_ids" => type_tensor,
        })?;

        // Output naming differs between ONNX exports.
        let hidden = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (out_shape, data) = hidden
            .try_extract_tensor::<f32>()
            .context("failed to extract token embeddings")?;

        let dims: &[i64] = &out_shape;
        anyhow::ensure!(
            dims.len() == 3 && dims[2] == EMBEDDING_DIM as i64,
            "unexpected token embedding shape {dims:?}, expected [batch, seq, {EMBEDDING_DIM}]"
        );

        Ok(mean_pool(
            data,
            &mask,
            batch,
            seq_len,
            dims[1] as usize,
            dims[2] as usize,
        ))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
