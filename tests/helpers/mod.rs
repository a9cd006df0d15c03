#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cairn::config::CairnConfig;
use cairn::embedding::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};
use cairn::memory::oracle::{DebateOracle, DebateRequest, DebateVerdict, UnavailableOracle};
use cairn::memory::{
    ContextFingerprint, FragmentContent, KnowledgeKind, NewFragment, SharedMemory,
};

pub const AGENT: &str = "backend-architect";

/// Keyword to embedding dimension. Texts sharing a topic embed close together.
const TOPICS: &[(&str, usize)] = &[
    ("error", 0),
    ("exception", 0),
    ("retry", 1),
    ("cache", 2),
    ("deploy", 3),
    ("schema", 4),
    ("logging", 5),
];

/// Deterministic topic embedder: one dimension per topic keyword plus a
/// small shared baseline so no text embeds to the zero vector.
pub struct TopicEmbedder;

impl EmbeddingProvider for TopicEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let text = text.to_lowercase();
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for (keyword, dim) in TOPICS {
            if text.contains(keyword) {
                v[*dim] += 1.0;
            }
        }
        v[EMBEDDING_DIM - 1] += 0.1;
        Ok(l2_normalize(&v))
    }

    fn model_id(&self) -> &str {
        "topic-test"
    }
}

/// Returns a fixed verdict and counts calls.
pub struct ScriptedOracle {
    verdict: Mutex<Option<DebateVerdict>>,
    pub calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new(verdict: DebateVerdict) -> Self {
        Self {
            verdict: Mutex::new(Some(verdict)),
            calls: AtomicUsize::new(0),
        }
    }

    /// No verdict yet; debates fail until [`ScriptedOracle::answer`] is called.
    pub fn pending() -> Self {
        Self {
            verdict: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn answer(&self, verdict: DebateVerdict) {
        *self.verdict.lock().unwrap() = Some(verdict);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DebateOracle for ScriptedOracle {
    async fn debate(&self, request: DebateRequest) -> anyhow::Result<DebateVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let verdict = self.verdict.lock().unwrap().clone();
        verdict.ok_or_else(|| anyhow::anyhow!("no verdict for {}", request.conflict_id))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Never answers in time.
pub struct SlowOracle(pub Duration);

#[async_trait]
impl DebateOracle for SlowOracle {
    async fn debate(&self, _request: DebateRequest) -> anyhow::Result<DebateVerdict> {
        tokio::time::sleep(self.0).await;
        anyhow::bail!("too late")
    }

    fn name(&self) -> &str {
        "slow"
    }
}

pub fn test_config() -> CairnConfig {
    let mut config = CairnConfig::default();
    config.conflict.oracle_timeout_secs = 1;
    config
}

pub fn memory_with(oracle: Arc<dyn DebateOracle>, config: CairnConfig) -> SharedMemory {
    let conn = cairn::db::open_memory_database().unwrap();
    SharedMemory::new(conn, Arc::new(TopicEmbedder), oracle, config)
}

pub fn memory() -> SharedMemory {
    memory_with(Arc::new(UnavailableOracle), test_config())
}

/// The `{python, sync}` context shared by most scenarios.
pub fn python_sync() -> ContextFingerprint {
    ContextFingerprint::builder()
        .technologies(["python", "sync"])
        .build()
}

/// Procedural error-handling submission in the python/sync context.
pub fn error_handling(instance: &str, pattern: &str, quality: f64) -> NewFragment {
    NewFragment::new(
        AGENT,
        instance,
        KnowledgeKind::Procedural,
        FragmentContent::new(pattern, "worked in production").with_situation("error handling"),
    )
    .with_fingerprint(python_sync())
    .with_initial_quality(quality)
}
