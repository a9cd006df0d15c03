//! Retrieval ranking: vector candidates, structural filter, bodies, ranking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{MemoryError, Result};
use super::fingerprint::ContextFingerprint;
use super::store::{HybridStore, StructuralQuery};
use super::temporal::TemporalManager;
use super::types::{ConflictStatus, FragmentId, MemoryFragment};
use crate::config::RetrievalConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    pub agent_type: String,
    #[serde(default)]
    pub context: ContextFingerprint,
    /// Caller's project; unlocks fragments scoped to it.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Defaults to the configured limit.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Include expired, stale, superseded and archived fragments.
    #[serde(default)]
    pub include_historical: bool,
}

impl RetrievalRequest {
    pub fn new(
        query: impl Into<String>,
        agent_type: impl Into<String>,
        context: ContextFingerprint,
    ) -> Self {
        Self {
            query: query.into(),
            agent_type: agent_type.into(),
            context,
            project_id: None,
            limit: None,
            include_historical: false,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn historical(mut self) -> Self {
        self.include_historical = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedFragment {
    pub fragment: MemoryFragment,
    pub score: f64,
    /// `None` for universally scoped fragments.
    pub context_similarity: Option<f64>,
    pub semantic_similarity: f64,
    pub recency_factor: f64,
}

/// Non-fatal annotations on a retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetrievalWarning {
    /// An escalated conflict involves a returned fragment.
    ConflictUnresolved {
        fragment_id: FragmentId,
        conflict_id: String,
        other: FragmentId,
    },
    /// A candidate failed structural validation and was left out.
    Corrupted { fragment_id: FragmentId, reason: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub fragments: Vec<RankedFragment>,
    pub warnings: Vec<RetrievalWarning>,
}

impl RetrievalResult {
    pub fn ids(&self) -> Vec<&str> {
        self.fragments.iter().map(|r| r.fragment.id.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalRanker {
    config: RetrievalConfig,
}

impl RetrievalRanker {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn default_limit(&self) -> usize {
        self.config.default_limit
    }

    /// `1 / (1 + days_since_validation / horizon)`.
    pub fn recency_factor(&self, last_validated: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let days = ((now - last_validated).num_seconds() as f64 / 86_400.0).max(0.0);
        let horizon = if self.config.recency_horizon_days > 0.0 {
            self.config.recency_horizon_days
        } else {
            90.0
        };
        1.0 / (1.0 + days / horizon)
    }

    /// Rank fragments for an already embedded query.
    ///
    /// An empty result is a success. Corrupted candidates and unresolved
    /// conflicts come back as warnings.
    pub fn rank(
        &self,
        store: &HybridStore,
        temporal: &TemporalManager,
        query_embedding: &[f32],
        request: &RetrievalRequest,
        now: DateTime<Utc>,
    ) -> Result<RetrievalResult> {
        let limit = request.limit.unwrap_or(self.config.default_limit);
        if limit == 0 {
            return Ok(RetrievalResult::default());
        }

        let pool = self.config.candidate_pool.max(limit);
        let candidates = store.candidates_by_embedding(query_embedding, &request.agent_type, pool)?;
        let ids: Vec<FragmentId> = candidates.iter().map(|c| c.id.clone()).collect();

        let query = StructuralQuery {
            agent_type: &request.agent_type,
            context: &request.context,
            project_id: request.project_id.as_deref(),
            validity_at: now,
            include_historical: request.include_historical,
            similarity_threshold: self.config.similarity_threshold,
        };
        let filtered = store.filter_by_structure(&ids, &query, temporal)?;

        let mut warnings: Vec<RetrievalWarning> = filtered
            .corrupted
            .into_iter()
            .map(|(fragment_id, reason)| RetrievalWarning::Corrupted { fragment_id, reason })
            .collect();

        let mut ranked = Vec::with_capacity(filtered.matches.len());
        for m in filtered.matches {
            let fragment = match store.get(&m.id) {
                Ok(fragment) => fragment,
                Err(MemoryError::Corrupted { id, reason }) => {
                    tracing::warn!(%id, %reason, "corrupted fragment left out of retrieval");
                    warnings.push(RetrievalWarning::Corrupted {
                        fragment_id: id,
                        reason,
                    });
                    continue;
                }
                // removed between the filter and the fetch
                Err(MemoryError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            let semantic_similarity = candidates
                .iter()
                .find(|c| c.id == m.id)
                .map(|c| c.similarity)
                .unwrap_or(0.0);
            let context_weight = m
                .context_similarity
                .unwrap_or(self.config.universal_match_weight);
            let recency_factor = self.recency_factor(fragment.temporal.last_validated_at, now);
            let score = fragment.quality_score * context_weight * recency_factor;

            ranked.push(RankedFragment {
                fragment,
                score,
                context_similarity: m.context_similarity,
                semantic_similarity,
                recency_factor,
            });
        }

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| {
                    b.fragment
                        .usage
                        .validation_count
                        .cmp(&a.fragment.usage.validation_count)
                })
                .then_with(|| {
                    b.fragment
                        .temporal
                        .last_validated_at
                        .cmp(&a.fragment.temporal.last_validated_at)
                })
        });
        ranked.truncate(limit);

        for r in &ranked {
            for link in &r.fragment.conflicts {
                if link.status == ConflictStatus::Escalated {
                    warnings.push(RetrievalWarning::ConflictUnresolved {
                        fragment_id: r.fragment.id.clone(),
                        conflict_id: link.conflict_id.clone(),
                        other: link.other.clone(),
                    });
                }
            }
        }

        tracing::debug!(
            agent_type = %request.agent_type,
            candidates = candidates.len(),
            returned = ranked.len(),
            warnings = warnings.len(),
            "retrieval ranked"
        );
        Ok(RetrievalResult {
            fragments: ranked,
            warnings,
        })
    }
}
