//! The shared agent memory graph.
//!
//! [`service::SharedMemory`] is the entry point. Underneath it:
//!
//! - [`store`]: hybrid store over the SQLite graph, the sqlite-vec index and a hot cache
//! - [`quality`]: composite quality scores, feedback blending and time decay
//! - [`fingerprint`]: context fingerprints and their similarity
//! - [`temporal`]: validity windows, supersession and archival
//! - [`conflict`]: detection, classification and resolution of contradictions
//! - [`reputation`]: per-contributor weighting
//! - [`retrieval`]: candidate generation, filtering and ranking

pub mod conflict;
pub mod error;
pub mod fingerprint;
pub mod maintenance;
pub mod oracle;
pub mod quality;
pub mod reputation;
pub mod retrieval;
pub mod service;
pub mod stats;
pub mod store;
pub mod temporal;
pub mod types;

pub use error::{MemoryError, Result};
pub use fingerprint::ContextFingerprint;
pub use retrieval::{RetrievalRequest, RetrievalResult, RetrievalWarning};
pub use service::SharedMemory;
pub use types::{FeedbackOutcome, FragmentContent, KnowledgeKind, MemoryFragment, NewFragment, Scope};

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Inverse of [`embedding_to_bytes`]; trailing partial floats are dropped.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
