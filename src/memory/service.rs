//! [`SharedMemory`]: the one handle agents use to reach the memory graph.
//!
//! Every public operation is async. Blocking SQLite and embedding work runs on
//! the blocking pool, and conflict processing for a new fragment runs as a
//! background task that [`SharedMemory::settle`] can wait for.

use std::sync::Arc;

use chrono::Duration;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::conflict::{self, ConflictEngine, RecommendationComparator, StructuredComparator};
use super::error::{MemoryError, Result};
use super::fingerprint::ContextFingerprint;
use super::maintenance::{self, DecayReport, SweepReport};
use super::oracle::DebateOracle;
use super::quality::QualityScorer;
use super::reputation;
use super::retrieval::{RetrievalRanker, RetrievalRequest, RetrievalResult};
use super::stats::{self, Stats};
use super::store::{self, HybridStore, LogEntry, QualitySnapshot};
use super::temporal::{ArchivalPolicy, TemporalManager};
use super::types::{now, Conflict, EdgeType, FeedbackOutcome, FragmentId, MemoryFragment, NewFragment};
use crate::config::CairnConfig;
use crate::embedding::EmbeddingProvider;

/// Full picture of one fragment for inspection.
#[derive(Debug, Serialize)]
pub struct Inspection {
    pub fragment: MemoryFragment,
    pub snapshots: Vec<QualitySnapshot>,
    pub log: Vec<LogEntry>,
    pub conflicts: Vec<Conflict>,
}

#[derive(Clone)]
pub struct SharedMemory {
    store: Arc<HybridStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    engine: ConflictEngine,
    scorer: QualityScorer,
    temporal: TemporalManager,
    ranker: RetrievalRanker,
    config: Arc<CairnConfig>,
    pending: Arc<Mutex<JoinSet<()>>>,
}

impl SharedMemory {
    pub fn new(
        conn: Connection,
        embedder: Arc<dyn EmbeddingProvider>,
        oracle: Arc<dyn DebateOracle>,
        config: CairnConfig,
    ) -> Self {
        let comparator = Arc::new(StructuredComparator::new(config.conflict.exclusivity_threshold));
        Self::with_comparator(conn, embedder, oracle, comparator, config)
    }

    pub fn with_comparator(
        conn: Connection,
        embedder: Arc<dyn EmbeddingProvider>,
        oracle: Arc<dyn DebateOracle>,
        comparator: Arc<dyn RecommendationComparator>,
        config: CairnConfig,
    ) -> Self {
        let store = Arc::new(HybridStore::new(conn, config.storage.cache_capacity));
        let engine = ConflictEngine::new(
            store.clone(),
            embedder.clone(),
            oracle,
            comparator,
            &config,
        );
        Self {
            scorer: QualityScorer::new(&config.quality),
            temporal: TemporalManager::new(&config.temporal),
            ranker: RetrievalRanker::new(&config.retrieval),
            store,
            embedder,
            engine,
            config: Arc::new(config),
            pending: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<HybridStore> {
        &self.store
    }

    pub fn conflicts(&self) -> &ConflictEngine {
        &self.engine
    }

    pub fn config(&self) -> &CairnConfig {
        &self.config
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SharedMemory) -> Result<T> + Send + 'static,
    {
        let memory = self.clone();
        tokio::task::spawn_blocking(move || f(&memory))
            .await
            .map_err(|e| MemoryError::StorageUnavailable(format!("memory task failed: {e}")))?
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder
            .embed(text)
            .map_err(|e| MemoryError::Embedding(format!("{e:#}")))
    }

    /// Validate, score and persist a submission; conflict detection follows
    /// in the background.
    pub async fn store_memory(&self, new: NewFragment) -> Result<FragmentId> {
        new.validate()?;

        let id = self
            .blocking(move |memory| {
                let embedding = memory.embed(&new.content.embedding_text())?;
                let reputations = memory
                    .store
                    .read(|conn| reputation::reputations_of(conn, &new.all_contributors()))?;
                let (quality, score) = memory.scorer.initial(&new, &reputations);
                let fragment = MemoryFragment::from_submission(
                    Uuid::now_v7().to_string(),
                    &new,
                    quality,
                    score,
                    now(),
                );
                memory.store.put(&fragment, &embedding)
            })
            .await?;

        tracing::info!(id = %id, "memory stored");
        self.schedule_conflict_check(id.clone()).await;
        Ok(id)
    }

    async fn schedule_conflict_check(&self, id: FragmentId) {
        let engine = self.engine.clone();
        let mut pending = self.pending.lock().await;
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            if let Err(e) = engine.process(&id).await {
                tracing::warn!(id = %id, error = %e, "conflict processing failed");
            }
        });
    }

    /// Re-queue conflict checks that never completed, e.g. after a crash.
    ///
    /// Meant for startup, before any fragment is stored: debates an earlier
    /// run left open are reopened first.
    pub async fn resume_pending_checks(&self) -> Result<usize> {
        let ids = self
            .blocking(|memory| {
                memory.engine.reopen_interrupted_debates()?;
                memory.engine.unchecked_fragments()
            })
            .await?;
        let count = ids.len();
        for id in ids {
            self.schedule_conflict_check(id).await;
        }
        if count > 0 {
            tracing::info!(count, "resumed pending conflict checks");
        }
        Ok(count)
    }

    /// Wait until background conflict processing has finished.
    pub async fn settle(&self) {
        let mut pending = self.pending.lock().await;
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "conflict task panicked or was cancelled");
            }
        }
    }

    pub async fn retrieve_relevant(
        &self,
        query: &str,
        agent_type: &str,
        context: &ContextFingerprint,
        limit: Option<usize>,
    ) -> Result<RetrievalResult> {
        let mut request = RetrievalRequest::new(query, agent_type, context.clone());
        request.limit = limit;
        self.retrieve(request).await
    }

    pub async fn retrieve(&self, request: RetrievalRequest) -> Result<RetrievalResult> {
        if request.agent_type.trim().is_empty() {
            return Err(MemoryError::Validation("agent_type is required".into()));
        }
        self.blocking(move |memory| {
            let embedding = memory.embed(&request.query)?;
            memory
                .ranker
                .rank(&memory.store, &memory.temporal, &embedding, &request, now())
        })
        .await
    }

    /// Apply feedback and return the new composite score.
    ///
    /// Contributors other than the reporting instance receive the reputation
    /// signal; the reporting instance is linked with a `VALIDATED_BY` edge.
    pub async fn record_feedback(
        &self,
        fragment_id: &str,
        instance_id: &str,
        outcome: FeedbackOutcome,
    ) -> Result<f64> {
        if instance_id.trim().is_empty() {
            return Err(MemoryError::Validation("agent_instance_id is required".into()));
        }
        let (id, instance) = (fragment_id.to_string(), instance_id.trim().to_string());

        let score = self
            .blocking(move |memory| {
                let retries = memory.config.quality.max_update_retries;
                let at = now();
                let updated = memory
                    .store
                    .update_quality_with(
                        &id,
                        retries,
                        |f| Some(memory.scorer.update_on_feedback(f, outcome, at)),
                        |tx, f| {
                            store::register_instance(tx, &instance, &f.agent_type, &at)?;
                            store::insert_edge(
                                tx,
                                EdgeType::ValidatedBy,
                                &f.id,
                                &instance,
                                Some(outcome.as_str()),
                                &at,
                            )?;
                            for contributor in f.contributors.iter().filter(|c| **c != instance) {
                                reputation::record_signal(tx, contributor, outcome.reputation_signal(), at)?;
                            }
                            Ok(())
                        },
                    )?
                    .ok_or_else(|| MemoryError::NotFound(format!("fragment {id}")))?;
                Ok(updated.quality_score)
            })
            .await?;

        tracing::info!(id = fragment_id, outcome = %outcome, score, "feedback recorded");
        Ok(score)
    }

    pub async fn get_statistics(&self, agent_type: &str, project_id: Option<&str>) -> Result<Stats> {
        let (agent_type, project_id) = (agent_type.to_string(), project_id.map(String::from));
        self.blocking(move |memory| {
            memory.store.read(|conn| {
                stats::get_statistics(conn, &memory.temporal, &agent_type, project_id.as_deref(), now())
            })
        })
        .await
    }

    /// Archive fragments unvalidated for `max_age` that score below `min_quality`
    /// and were rarely applied.
    pub async fn archive_sweep(&self, max_age: Duration, min_quality: f64) -> Result<Vec<FragmentId>> {
        if !min_quality.is_finite() || max_age < Duration::zero() {
            return Err(MemoryError::Validation(
                "max_age must be non-negative and min_quality finite".into(),
            ));
        }
        self.blocking(move |memory| {
            let policy = ArchivalPolicy {
                max_age,
                min_quality,
                max_uses: memory.config.maintenance.archive_max_uses,
            };
            memory.temporal.sweep_for_archival(&memory.store, policy, now())
        })
        .await
    }

    /// Configured archival plus orphaned vector cleanup.
    pub async fn maintenance_sweep(&self) -> Result<SweepReport> {
        self.blocking(|memory| {
            let policy = ArchivalPolicy::from(&memory.config.maintenance);
            maintenance::sweep(&memory.store, &memory.temporal, policy, now())
        })
        .await
    }

    pub async fn apply_time_decay(&self, agent_type: Option<&str>) -> Result<DecayReport> {
        let agent_type = agent_type.map(String::from);
        self.blocking(move |memory| {
            maintenance::apply_time_decay(
                &memory.store,
                &memory.scorer,
                agent_type.as_deref(),
                now(),
                memory.config.quality.max_update_retries,
            )
        })
        .await
    }

    pub async fn get_fragment(&self, id: &str) -> Result<MemoryFragment> {
        let id = id.to_string();
        self.blocking(move |memory| memory.store.get(&id)).await
    }

    pub async fn inspect(&self, id: &str) -> Result<Inspection> {
        let id = id.to_string();
        self.blocking(move |memory| {
            let fragment = memory.store.get_fresh(&id)?;
            let conflicts = memory.store.read(|conn| {
                fragment
                    .conflicts
                    .iter()
                    .filter_map(|link| conflict::load_conflict(conn, &link.conflict_id).transpose())
                    .collect::<Result<Vec<_>>>()
            })?;
            Ok(Inspection {
                snapshots: memory.store.snapshots(&id)?,
                log: memory.store.audit_log(&id)?,
                conflicts,
                fragment,
            })
        })
        .await
    }
}
