//! Conflict detection, classification and resolution.
//!
//! Every stored fragment is compared against live fragments of its agent type
//! that share its context and topic. Pairs whose recommendations are mutually
//! exclusive become a [`Conflict`] and move through
//! `detected -> classified -> {auto_resolved | debate_requested -> resolved | escalated}`.
//! Every step is appended to the per-agent-type `conflict_ledger`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use super::error::{MemoryError, Result};
use super::oracle::{DebateOracle, DebateRequest, DebateVerdict};
use super::quality::QualityScorer;
use super::reputation;
use super::store::{self, HybridStore};
use super::temporal::{link_supersession, TemporalManager};
use super::types::{
    now, parse_ts, ts, Conflict, ConflictOutcome, ConflictStatus, ConflictType, EdgeType,
    FragmentContent, FragmentId, MemoryFragment, NewFragment, ResolutionMethod, Scope,
};
use crate::config::{CairnConfig, ConflictConfig};
use crate::embedding::EmbeddingProvider;

/// Reputation credited to the contributors of a winning fragment.
const WINNER_SIGNAL: f64 = 0.5;
/// Reputation debited from the contributors of a losing fragment.
const LOSER_SIGNAL: f64 = -0.5;

const CONFLICT_COLUMNS: &str = "id, agent_type, fragment_a, fragment_b, conflict_type, status, \
    resolution_method, outcome, rationale, detected_at, resolved_at";

/// Decides whether two recommendations cannot both be followed.
pub trait RecommendationComparator: Send + Sync {
    fn mutually_exclusive(&self, a: &FragmentContent, b: &FragmentContent) -> bool;
}

/// Compares the structured fields of two fragments.
///
/// Recommendations are exclusive when either lists the other's pattern as an
/// alternative, or when their patterns differ and their pattern plus approach
/// vocabularies overlap less than `threshold`.
#[derive(Debug, Clone)]
pub struct StructuredComparator {
    threshold: f64,
}

impl StructuredComparator {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }
}

impl RecommendationComparator for StructuredComparator {
    fn mutually_exclusive(&self, a: &FragmentContent, b: &FragmentContent) -> bool {
        let pattern_a = normalize(&a.pattern);
        let pattern_b = normalize(&b.pattern);
        if pattern_a == pattern_b {
            return false;
        }

        let lists = |content: &FragmentContent, pattern: &str| {
            content.alternatives.iter().any(|alt| normalize(alt) == pattern)
        };
        if lists(a, &pattern_b) || lists(b, &pattern_a) {
            return true;
        }

        let words_a = tokens(&format!("{} {}", a.pattern, a.approach));
        let words_b = tokens(&format!("{} {}", b.pattern, b.approach));
        let union = words_a.union(&words_b).count();
        if union == 0 {
            return false;
        }
        let overlap = words_a.intersection(&words_b).count() as f64 / union as f64;
        overlap < self.threshold
    }
}

fn tokens(text: &str) -> std::collections::BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn normalize(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// One append-only ledger row.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub conflict_id: String,
    pub event: String,
    pub details: Option<serde_json::Value>,
    pub created_at: String,
}

/// The write a resolution path decided on, committed in one transaction.
struct Resolution {
    status: ConflictStatus,
    method: ResolutionMethod,
    outcome: ConflictOutcome,
    rationale: String,
    /// Ledger events to append, in order.
    events: Vec<&'static str>,
    /// (superseder, superseded)
    links: Vec<(FragmentId, FragmentId)>,
    consensus: Option<(MemoryFragment, Vec<f32>)>,
    /// (instance id, reputation signal)
    signals: Vec<(String, f64)>,
}

impl Resolution {
    fn retained(
        status: ConflictStatus,
        method: ResolutionMethod,
        rationale: String,
        events: Vec<&'static str>,
    ) -> Self {
        Self {
            status,
            method,
            outcome: ConflictOutcome::BothRetained,
            rationale,
            events,
            links: Vec::new(),
            consensus: None,
            signals: Vec::new(),
        }
    }

    fn escalation(rationale: String, mut events: Vec<&'static str>) -> Self {
        events.push("escalated");
        Self::retained(
            ConflictStatus::Escalated,
            ResolutionMethod::Escalation,
            rationale,
            events,
        )
    }

    fn winner(
        winner: &MemoryFragment,
        loser: &MemoryFragment,
        status: ConflictStatus,
        method: ResolutionMethod,
        rationale: String,
        event: &'static str,
    ) -> Self {
        let signals = winner
            .contributors
            .iter()
            .map(|c| (c.clone(), WINNER_SIGNAL))
            .chain(loser.contributors.iter().map(|c| (c.clone(), LOSER_SIGNAL)))
            .collect();
        Self {
            status,
            method,
            outcome: ConflictOutcome::Winner {
                survivor: winner.id.clone(),
                superseded: loser.id.clone(),
            },
            rationale,
            events: vec![event],
            links: vec![(winner.id.clone(), loser.id.clone())],
            consensus: None,
            signals,
        }
    }
}

/// Detects and resolves conflicts for one store.
#[derive(Clone)]
pub struct ConflictEngine {
    store: Arc<HybridStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    oracle: Arc<dyn DebateOracle>,
    comparator: Arc<dyn RecommendationComparator>,
    scorer: QualityScorer,
    temporal: TemporalManager,
    config: ConflictConfig,
    candidate_pool: usize,
}

impl ConflictEngine {
    pub fn new(
        store: Arc<HybridStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        oracle: Arc<dyn DebateOracle>,
        comparator: Arc<dyn RecommendationComparator>,
        config: &CairnConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            oracle,
            comparator,
            scorer: QualityScorer::new(&config.quality),
            temporal: TemporalManager::new(&config.temporal),
            config: config.conflict.clone(),
            candidate_pool: config.retrieval.candidate_pool.max(1),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ConflictEngine) -> Result<T> + Send + 'static,
    {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| MemoryError::StorageUnavailable(format!("conflict task failed: {e}")))?
    }

    /// Detect and resolve conflicts for a freshly stored fragment.
    ///
    /// Follows the surviving fragment of each resolution for up to
    /// `max_resolution_rounds`, so N-way conflicts converge through repeated
    /// pairwise resolution. Returns every conflict it resolved or escalated.
    pub async fn process(&self, id: &str) -> Result<Vec<Conflict>> {
        let rounds = self.config.max_resolution_rounds.max(1);
        let mut handled = Vec::new();
        let mut current = id.to_string();

        for round in 0..rounds {
            let detected = self
                .blocking({
                    let id = current.clone();
                    move |engine| engine.detect(&id, now())
                })
                .await?;
            tracing::debug!(id = %current, round, detected = detected.len(), "conflict round");

            let mut next = None;
            for conflict in detected {
                let done = self.resolve(conflict).await?;
                if let Some(survivor) = done.outcome.as_ref().and_then(ConflictOutcome::survivor) {
                    if survivor != current {
                        next = Some(survivor.to_string());
                    }
                }
                handled.push(done);
            }

            self.blocking({
                let id = current.clone();
                move |engine| engine.mark_checked(&id, now())
            })
            .await?;

            match next {
                Some(survivor) => current = survivor,
                None => break,
            }
        }
        Ok(handled)
    }

    /// Record conflicts between `id` and the live fragments it contradicts.
    ///
    /// Returns new conflicts plus existing open ones for the same pairs.
    /// Running it twice without intervening writes creates no new records.
    pub fn detect(&self, id: &str, now: DateTime<Utc>) -> Result<Vec<Conflict>> {
        let fragment = self.store.get_fresh(id)?;
        if fragment.is_archived()
            || fragment.is_superseded()
            || !self.temporal.is_valid(&fragment, now)
        {
            return Ok(Vec::new());
        }

        let embedding = self
            .store
            .embedding_of(id)?
            .ok_or_else(|| MemoryError::Corrupted {
                id: id.to_string(),
                reason: "missing embedding".into(),
            })?;

        let mut semantic: HashMap<FragmentId, f64> = HashMap::new();
        let mut order: Vec<FragmentId> = Vec::new();
        let candidates =
            self.store
                .candidates_by_embedding(&embedding, &fragment.agent_type, self.candidate_pool)?;
        for candidate in candidates {
            if candidate.id != fragment.id {
                order.push(candidate.id.clone());
                semantic.insert(candidate.id, candidate.similarity);
            }
        }
        if let Some(target) = &fragment.replaces {
            if !semantic.contains_key(target) {
                order.push(target.clone());
            }
        }

        let mut found = Vec::new();
        for other_id in order {
            let declared = fragment.replaces.as_deref() == Some(other_id.as_str());
            let other = match self.store.get(&other_id) {
                Ok(other) => other,
                Err(MemoryError::NotFound(_)) => continue,
                Err(MemoryError::Corrupted { id, reason }) => {
                    tracing::warn!(%id, %reason, "skipping corrupted conflict candidate");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if other.agent_type != fragment.agent_type
                || other.is_archived()
                || other.is_superseded()
                || !self.temporal.is_valid(&other, now)
            {
                continue;
            }

            let context = context_overlap(&fragment, &other);
            if !declared {
                let Some(context) = context else { continue };
                let similarity = semantic.get(&other.id).copied().unwrap_or(0.0);
                if other.kind != fragment.kind
                    || context < self.config.detection_threshold
                    || similarity < self.config.semantic_overlap
                    || !self.comparator.mutually_exclusive(&fragment.content, &other.content)
                {
                    continue;
                }
            }

            let (newer, older) = by_age(&fragment, &other);
            let conflict_type = self.classify(newer, older, context.unwrap_or(0.0));
            if let Some(conflict) = self.record(newer, older, conflict_type, context, now)? {
                found.push(conflict);
            }
        }

        if !found.is_empty() {
            tracing::info!(id, count = found.len(), "conflicts detected");
        }
        Ok(found)
    }

    /// Temporal when the newer fragment declares it replaces the older one or
    /// takes over at the end of its validity window; contextual when contexts
    /// differ enough for both to hold; direct otherwise.
    pub fn classify(
        &self,
        newer: &MemoryFragment,
        older: &MemoryFragment,
        context_similarity: f64,
    ) -> ConflictType {
        if newer.replaces.as_deref() == Some(older.id.as_str()) {
            return ConflictType::Temporal;
        }
        if let Some(until) = older.temporal.valid_until {
            let window = chrono::Duration::days(self.config.temporal_window_days.max(0));
            if (newer.temporal.valid_from - until).abs() <= window {
                return ConflictType::Temporal;
            }
        }
        if context_similarity < self.config.direct_similarity {
            ConflictType::Contextual
        } else {
            ConflictType::Direct
        }
    }

    fn record(
        &self,
        newer: &MemoryFragment,
        older: &MemoryFragment,
        conflict_type: ConflictType,
        context: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<Conflict>> {
        let (a, b) = if newer.id < older.id {
            (&newer.id, &older.id)
        } else {
            (&older.id, &newer.id)
        };

        let conflict = self.store.write(|tx| {
            let conflict_id = Uuid::now_v7().to_string();
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO conflicts \
                     (id, agent_type, fragment_a, fragment_b, conflict_type, status, detected_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'detected', ?6)",
                params![conflict_id, newer.agent_type, a, b, conflict_type.as_str(), ts(&now)],
            )?;
            if inserted == 0 {
                let existing = conflict_between(tx, a, b)?;
                return Ok(existing.filter(|c| !c.status.is_terminal()));
            }

            let rationale = format!(
                "{} contradicts {} ({})",
                newer.content.pattern, older.content.pattern, conflict_type
            );
            store::insert_edge(tx, EdgeType::ConflictsWith, &newer.id, &older.id, Some(&rationale), &now)?;
            append_ledger(
                tx,
                &newer.agent_type,
                &conflict_id,
                "detected",
                &serde_json::json!({
                    "fragment_a": a,
                    "fragment_b": b,
                    "context_similarity": context,
                }),
                &now,
            )?;
            tx.execute(
                "UPDATE conflicts SET status = 'classified' WHERE id = ?1",
                params![conflict_id],
            )?;
            append_ledger(
                tx,
                &newer.agent_type,
                &conflict_id,
                "classified",
                &serde_json::json!({ "conflict_type": conflict_type }),
                &now,
            )?;
            load_conflict(tx, &conflict_id)
        })?;

        self.store.evict(&[a, b]);
        Ok(conflict)
    }

    /// Drive one conflict to a terminal status.
    ///
    /// Safe to call with a stale copy: every commit is conditional on the
    /// status this copy carries, so a conflict another task already settled or
    /// claimed for debate is returned as stored, untouched.
    pub async fn resolve(&self, conflict: Conflict) -> Result<Conflict> {
        if conflict.status.is_terminal() {
            return Ok(conflict);
        }
        if conflict.status == ConflictStatus::DebateRequested {
            tracing::debug!(conflict = %conflict.id, "debate already in flight");
            return Ok(conflict);
        }

        let (a, b) = self
            .blocking({
                let (a, b) = (conflict.fragment_a.clone(), conflict.fragment_b.clone());
                move |engine| Ok((engine.store.get_fresh(&a)?, engine.store.get_fresh(&b)?))
            })
            .await?;

        if let Some(gone) = [&a, &b].into_iter().find(|f| f.is_superseded() || f.is_archived()) {
            let resolution = Resolution::retained(
                ConflictStatus::AutoResolved,
                ResolutionMethod::Obsolete,
                format!("{} left the active set before resolution", gone.id),
                vec!["auto_resolved"],
            );
            return self.commit_blocking(conflict, resolution).await;
        }

        let (newer, older) = by_age(&a, &b);
        let resolution = match conflict.conflict_type {
            ConflictType::Contextual => Some(Resolution::retained(
                ConflictStatus::AutoResolved,
                ResolutionMethod::ScopeSeparation,
                "contexts differ; both apply in their own scope".into(),
                vec!["auto_resolved"],
            )),
            ConflictType::Temporal => {
                if newer.quality_score >= older.quality_score - self.config.temporal_tolerance {
                    Some(Resolution::winner(
                        newer,
                        older,
                        ConflictStatus::AutoResolved,
                        ResolutionMethod::Supersession,
                        format!("{} replaces {}", newer.id, older.id),
                        "auto_resolved",
                    ))
                } else {
                    None
                }
            }
            ConflictType::Direct => {
                let gap = (a.quality_score - b.quality_score).abs();
                if gap > self.config.quality_gap {
                    let (winner, loser) = if a.quality_score > b.quality_score {
                        (&a, &b)
                    } else {
                        (&b, &a)
                    };
                    Some(Resolution::winner(
                        winner,
                        loser,
                        ConflictStatus::AutoResolved,
                        ResolutionMethod::QualityGap,
                        format!("quality gap {gap:.2} exceeds {:.2}", self.config.quality_gap),
                        "auto_resolved",
                    ))
                } else {
                    None
                }
            }
        };

        match resolution {
            Some(resolution) => self.commit_blocking(conflict, resolution).await,
            None => {
                let (newer, older) = (newer.clone(), older.clone());
                self.debate(conflict, newer, older).await
            }
        }
    }

    async fn debate(
        &self,
        conflict: Conflict,
        newer: MemoryFragment,
        older: MemoryFragment,
    ) -> Result<Conflict> {
        let (claimed, conflict) = self
            .blocking({
                let conflict = conflict.clone();
                move |engine| engine.claim_debate(&conflict, now())
            })
            .await?;
        if !claimed {
            tracing::debug!(conflict = %conflict.id, status = %conflict.status, "debate claimed elsewhere");
            return Ok(conflict);
        }

        let (fragment_a, fragment_b) = if newer.id == conflict.fragment_a {
            (newer.clone(), older.clone())
        } else {
            (older.clone(), newer.clone())
        };
        let request = DebateRequest {
            conflict_id: conflict.id.clone(),
            agent_type: conflict.agent_type.clone(),
            conflict_type: conflict.conflict_type,
            fragment_a,
            fragment_b,
            context: newer.fingerprint.clone(),
        };

        let secs = self.config.oracle_timeout_secs;
        let verdict =
            match tokio::time::timeout(Duration::from_secs(secs), self.oracle.debate(request)).await {
                Ok(Ok(verdict)) => Ok(verdict),
                Ok(Err(e)) => Err(("oracle_failed", format!("debate oracle failed: {e:#}"))),
                Err(_) => Err(("oracle_timeout", MemoryError::OracleTimeout(secs).to_string())),
            };

        let resolution = match verdict {
            Ok(DebateVerdict::Winner { fragment_id }) => {
                let pair = if fragment_id == newer.id {
                    Some((&newer, &older))
                } else if fragment_id == older.id {
                    Some((&older, &newer))
                } else {
                    None
                };
                match pair {
                    Some((winner, loser)) => Resolution::winner(
                        winner,
                        loser,
                        ConflictStatus::Resolved,
                        ResolutionMethod::OracleWinner,
                        format!("oracle chose {}", winner.id),
                        "debate_resolved",
                    ),
                    None => Resolution::escalation(
                        format!("oracle named unknown fragment {fragment_id}"),
                        Vec::new(),
                    ),
                }
            }
            Ok(DebateVerdict::Consensus { fragment }) => {
                let built = self
                    .blocking({
                        let (a, b) = (newer.clone(), older.clone());
                        move |engine| engine.consensus_fragment(fragment, &a, &b, now())
                    })
                    .await;
                match built {
                    Ok((consensus, embedding)) => {
                        let rationale = format!(
                            "oracle synthesized {} from {} and {}",
                            consensus.id, newer.id, older.id
                        );
                        Resolution {
                            status: ConflictStatus::Resolved,
                            method: ResolutionMethod::OracleConsensus,
                            outcome: ConflictOutcome::Consensus {
                                fragment: consensus.id.clone(),
                                superseded: vec![conflict.fragment_a.clone(), conflict.fragment_b.clone()],
                            },
                            rationale,
                            events: vec!["debate_resolved"],
                            links: vec![
                                (consensus.id.clone(), conflict.fragment_a.clone()),
                                (consensus.id.clone(), conflict.fragment_b.clone()),
                            ],
                            consensus: Some((consensus, embedding)),
                            signals: Vec::new(),
                        }
                    }
                    Err(e) => Resolution::escalation(format!("consensus fragment rejected: {e}"), Vec::new()),
                }
            }
            Err((event, reason)) => {
                tracing::warn!(conflict = %conflict.id, %reason, "debate failed, escalating");
                Resolution::escalation(reason, vec![event])
            }
        };

        self.commit_blocking(conflict, resolution).await
    }

    /// Move a classified conflict to `debate_requested`. Only one caller wins;
    /// the others get `false` and the conflict as stored.
    pub(crate) fn claim_debate(&self, conflict: &Conflict, now: DateTime<Utc>) -> Result<(bool, Conflict)> {
        self.store.write(|tx| {
            let claimed = tx.execute(
                "UPDATE conflicts SET status = 'debate_requested' \
                 WHERE id = ?1 AND status = 'classified'",
                params![conflict.id],
            )? == 1;
            if claimed {
                append_ledger(
                    tx,
                    &conflict.agent_type,
                    &conflict.id,
                    "debate_requested",
                    &serde_json::json!({ "oracle": self.oracle.name() }),
                    &now,
                )?;
            }
            let stored = load_conflict(tx, &conflict.id)?
                .ok_or_else(|| MemoryError::NotFound(format!("conflict {}", conflict.id)))?;
            Ok((claimed, stored))
        })
    }

    fn consensus_fragment(
        &self,
        mut new: NewFragment,
        a: &MemoryFragment,
        b: &MemoryFragment,
        now: DateTime<Utc>,
    ) -> Result<(MemoryFragment, Vec<f32>)> {
        new.agent_type = a.agent_type.clone();
        new.replaces = None;
        if new.instance_id.trim().is_empty() {
            new.instance_id = format!("oracle:{}", self.oracle.name());
        }
        new.contributors.extend(a.contributors.iter().cloned());
        new.contributors.extend(b.contributors.iter().cloned());
        new.validate()?;

        let reputations = self
            .store
            .read(|conn| reputation::reputations_of(conn, &new.all_contributors()))?;
        let (quality, score) = self.scorer.initial(&new, &reputations);
        let fragment =
            MemoryFragment::from_submission(Uuid::now_v7().to_string(), &new, quality, score, now);
        let embedding = self
            .embedder
            .embed(&fragment.content.embedding_text())
            .map_err(|e| MemoryError::Embedding(format!("{e:#}")))?;
        Ok((fragment, embedding))
    }

    async fn commit_blocking(&self, conflict: Conflict, resolution: Resolution) -> Result<Conflict> {
        self.blocking(move |engine| engine.commit(&conflict, resolution, now()))
            .await
    }

    /// Apply a resolution atomically; a supersession that would close a cycle
    /// turns the resolution into an escalation.
    ///
    /// The write only lands while the stored status still equals
    /// `conflict.status`; otherwise nothing is written and the stored conflict
    /// is returned.
    fn commit(&self, conflict: &Conflict, resolution: Resolution, now: DateTime<Utc>) -> Result<Conflict> {
        let mut touched = vec![conflict.fragment_a.clone(), conflict.fragment_b.clone()];
        if let Some((fragment, _)) = &resolution.consensus {
            touched.push(fragment.id.clone());
        }

        let result = self.store.write(|tx| {
            let resolved_at = resolution.status.is_terminal().then(|| ts(&now));
            let changed = tx.execute(
                "UPDATE conflicts SET status = ?1, resolution_method = ?2, outcome = ?3, \
                     rationale = ?4, resolved_at = ?5 \
                 WHERE id = ?6 AND status = ?7",
                params![
                    resolution.status.as_str(),
                    resolution.method.as_str(),
                    serde_json::to_string(&resolution.outcome)?,
                    resolution.rationale,
                    resolved_at,
                    conflict.id,
                    conflict.status.as_str(),
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }

            if let Some((fragment, embedding)) = &resolution.consensus {
                store::insert_fragment(tx, fragment, embedding)?;
            }
            for (newer, older) in &resolution.links {
                link_supersession(tx, newer, older, &resolution.rationale, now)?;
            }
            for (instance, signal) in &resolution.signals {
                reputation::record_signal(tx, instance, *signal, now)?;
            }

            let details = serde_json::json!({
                "method": resolution.method,
                "outcome": resolution.outcome,
                "rationale": resolution.rationale,
            });
            for event in &resolution.events {
                append_ledger(tx, &conflict.agent_type, &conflict.id, event, &details, &now)?;
            }
            load_conflict(tx, &conflict.id)?
                .ok_or_else(|| MemoryError::NotFound(format!("conflict {}", conflict.id)))
                .map(Some)
        });

        self.store.evict(&touched);
        match result {
            Ok(None) => {
                let stored = self
                    .store
                    .read(|conn| load_conflict(conn, &conflict.id))?
                    .ok_or_else(|| MemoryError::NotFound(format!("conflict {}", conflict.id)))?;
                tracing::debug!(
                    conflict = %stored.id,
                    expected = %conflict.status,
                    status = %stored.status,
                    "conflict moved on before commit, leaving it as stored"
                );
                Ok(stored)
            }
            Ok(Some(done)) => {
                tracing::info!(
                    conflict = %done.id,
                    status = %done.status,
                    method = ?done.resolution_method,
                    "conflict resolved"
                );
                Ok(done)
            }
            Err(MemoryError::SupersessionCycle { new_id, old_id }) => {
                let fallback = Resolution::escalation(
                    format!("superseding {old_id} with {new_id} would create a cycle"),
                    Vec::new(),
                );
                self.commit(conflict, fallback, now)
            }
            Err(e) => Err(e),
        }
    }

    fn mark_checked(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.store.write(|tx| {
            tx.execute(
                "UPDATE fragments SET conflict_checked_at = ?1 WHERE id = ?2",
                params![ts(&now), id],
            )?;
            Ok(())
        })
    }

    /// Return debates left in `debate_requested` by an interrupted run to
    /// `classified` and mark both fragments unchecked so they are picked up
    /// again. Only call while no conflict processing is in flight.
    pub fn reopen_interrupted_debates(&self) -> Result<usize> {
        let at = now();
        let reopened = self.store.write(|tx| {
            let stranded: Vec<(String, String, String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, agent_type, fragment_a, fragment_b FROM conflicts \
                     WHERE status = 'debate_requested' ORDER BY detected_at, id",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            for (id, agent_type, a, b) in &stranded {
                tx.execute(
                    "UPDATE conflicts SET status = 'classified' WHERE id = ?1",
                    params![id],
                )?;
                tx.execute(
                    "UPDATE fragments SET conflict_checked_at = NULL WHERE id IN (?1, ?2)",
                    params![a, b],
                )?;
                append_ledger(tx, agent_type, id, "debate_reopened", &serde_json::json!({}), &at)?;
            }
            Ok(stranded.len())
        })?;
        if reopened > 0 {
            tracing::info!(count = reopened, "reopened interrupted debates");
        }
        Ok(reopened)
    }

    /// Live fragments whose conflict check never completed, oldest first.
    pub fn unchecked_fragments(&self) -> Result<Vec<FragmentId>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM fragments \
                 WHERE conflict_checked_at IS NULL AND archived_at IS NULL AND superseded_by IS NULL \
                 ORDER BY created_at, id",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    pub fn conflicts_for(&self, agent_type: &str, status: Option<ConflictStatus>) -> Result<Vec<Conflict>> {
        self.store.read(|conn| list_conflicts(conn, agent_type, status))
    }
}

/// Fingerprint overlap used for detection; `None` when scopes keep the pair apart.
fn context_overlap(a: &MemoryFragment, b: &MemoryFragment) -> Option<f64> {
    match (&a.scope, &b.scope) {
        (Scope::Project(x), Scope::Project(y)) if x != y => None,
        (Scope::Universal, _) | (_, Scope::Universal) => Some(1.0),
        _ => Some(a.fingerprint.similarity(&b.fingerprint)),
    }
}

/// `(newer, older)` by creation time, then id.
fn by_age<'a>(x: &'a MemoryFragment, y: &'a MemoryFragment) -> (&'a MemoryFragment, &'a MemoryFragment) {
    let x_newer = (x.temporal.created_at, &x.id) > (y.temporal.created_at, &y.id);
    if x_newer {
        (x, y)
    } else {
        (y, x)
    }
}

struct ConflictRow {
    id: String,
    agent_type: String,
    fragment_a: String,
    fragment_b: String,
    conflict_type: String,
    status: String,
    resolution_method: Option<String>,
    outcome: Option<String>,
    rationale: Option<String>,
    detected_at: String,
    resolved_at: Option<String>,
}

impl ConflictRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_type: row.get(1)?,
            fragment_a: row.get(2)?,
            fragment_b: row.get(3)?,
            conflict_type: row.get(4)?,
            status: row.get(5)?,
            resolution_method: row.get(6)?,
            outcome: row.get(7)?,
            rationale: row.get(8)?,
            detected_at: row.get(9)?,
            resolved_at: row.get(10)?,
        })
    }

    fn decode(self) -> Result<Conflict> {
        let id = self.id.clone();
        let corrupted = |reason: String| MemoryError::Corrupted {
            id: id.clone(),
            reason,
        };
        let timestamp = |name: &str, v: &str| {
            parse_ts(v).ok_or_else(|| corrupted(format!("{name} is not a timestamp: {v}")))
        };

        Ok(Conflict {
            conflict_type: self.conflict_type.parse().map_err(corrupted)?,
            status: self.status.parse().map_err(corrupted)?,
            resolution_method: self
                .resolution_method
                .map(|m| m.parse::<ResolutionMethod>())
                .transpose()
                .map_err(corrupted)?,
            outcome: self
                .outcome
                .map(|o| serde_json::from_str::<ConflictOutcome>(&o))
                .transpose()
                .map_err(|e| corrupted(format!("outcome: {e}")))?,
            detected_at: timestamp("detected_at", &self.detected_at)?,
            resolved_at: self
                .resolved_at
                .as_deref()
                .map(|v| timestamp("resolved_at", v))
                .transpose()?,
            rationale: self.rationale,
            agent_type: self.agent_type,
            fragment_a: self.fragment_a,
            fragment_b: self.fragment_b,
            id: self.id,
        })
    }
}

pub(crate) fn load_conflict(conn: &Connection, id: &str) -> Result<Option<Conflict>> {
    let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1");
    conn.query_row(&sql, params![id], ConflictRow::from_row)
        .optional()?
        .map(ConflictRow::decode)
        .transpose()
}

fn conflict_between(conn: &Connection, a: &str, b: &str) -> Result<Option<Conflict>> {
    let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE fragment_a = ?1 AND fragment_b = ?2");
    conn.query_row(&sql, params![a, b], ConflictRow::from_row)
        .optional()?
        .map(ConflictRow::decode)
        .transpose()
}

/// Conflicts of an agent type, oldest first.
pub fn list_conflicts(
    conn: &Connection,
    agent_type: &str,
    status: Option<ConflictStatus>,
) -> Result<Vec<Conflict>> {
    let sql = format!(
        "SELECT {CONFLICT_COLUMNS} FROM conflicts \
         WHERE agent_type = ?1 AND (?2 IS NULL OR status = ?2) \
         ORDER BY detected_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![agent_type, status.map(|s| s.as_str())], ConflictRow::from_row)?;
    let conflicts = rows
        .map(|row| row.map_err(MemoryError::from).and_then(ConflictRow::decode))
        .collect::<Result<Vec<_>>>()?;
    Ok(conflicts)
}

pub(crate) fn append_ledger(
    conn: &Connection,
    agent_type: &str,
    conflict_id: &str,
    event: &str,
    details: &serde_json::Value,
    at: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO conflict_ledger (agent_type, conflict_id, event, details, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![agent_type, conflict_id, event, details.to_string(), ts(at)],
    )?;
    Ok(())
}

/// Ledger of an agent type in append order.
pub fn ledger(conn: &Connection, agent_type: &str) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT conflict_id, event, details, created_at FROM conflict_ledger \
         WHERE agent_type = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![agent_type], |row| {
        let details: Option<String> = row.get(2)?;
        Ok(LedgerEntry {
            conflict_id: row.get(0)?,
            event: row.get(1)?,
            details: details.and_then(|d| serde_json::from_str(&d).ok()),
            created_at: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::hashing::HashingEmbeddingProvider;
    use crate::embedding::EMBEDDING_DIM;
    use crate::memory::fingerprint::ContextFingerprint;
    use crate::memory::oracle::UnavailableOracle;
    use crate::memory::types::{KnowledgeKind, QualityScores, TemporalMetadata, UsageStats};

    fn engine_with(store: Arc<HybridStore>, oracle: Arc<dyn DebateOracle>) -> ConflictEngine {
        let config = CairnConfig::default();
        ConflictEngine::new(
            store,
            Arc::new(HashingEmbeddingProvider::new()),
            oracle,
            Arc::new(StructuredComparator::new(config.conflict.exclusivity_threshold)),
            &config,
        )
    }

    fn setup() -> (Arc<HybridStore>, ConflictEngine) {
        let store = Arc::new(HybridStore::new(crate::db::open_memory_database().unwrap(), 16));
        let engine = engine_with(store.clone(), Arc::new(UnavailableOracle));
        (store, engine)
    }

    fn python() -> ContextFingerprint {
        ContextFingerprint::builder().technologies(["python", "sync"]).build()
    }

    fn fragment(id: &str, pattern: &str, quality: f64, contributor: &str) -> MemoryFragment {
        let t = now();
        MemoryFragment {
            id: id.into(),
            agent_type: "architect".into(),
            kind: KnowledgeKind::Procedural,
            content: FragmentContent::new(pattern, "it worked").with_situation("error handling"),
            quality_score: quality,
            quality: QualityScores {
                confidence: 0.7,
                validation: 0.0,
                recency: 1.0,
                consensus: 0.25,
                context_specificity: 0.4,
                impact: 0.5,
            },
            fingerprint: python(),
            usage: UsageStats::default(),
            contributors: vec![contributor.into()],
            temporal: TemporalMetadata {
                created_at: t,
                last_validated_at: t,
                valid_from: t,
                valid_until: None,
                deprecated_at: None,
            },
            supersedes: vec![],
            superseded_by: None,
            replaces: None,
            conflicts: vec![],
            scope: Scope::Contextual,
            cross_type_refs: vec![],
            archived_at: None,
            version: 1,
        }
    }

    fn topic() -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[0] = 1.0;
        v
    }

    fn conflict_rows(store: &HybridStore) -> i64 {
        store
            .read(|c| Ok(c.query_row("SELECT COUNT(*) FROM conflicts", [], |r| r.get(0))?))
            .unwrap()
    }

    #[test]
    fn comparator_flags_opposing_patterns_only() {
        let cmp = StructuredComparator::new(0.5);
        let exceptions = FragmentContent::new("Use exceptions", "r");
        let results = FragmentContent::new("use result types", "r");
        assert!(cmp.mutually_exclusive(&exceptions, &results));
        assert!(!cmp.mutually_exclusive(&exceptions, &FragmentContent::new("use  EXCEPTIONS", "r")));

        let close = FragmentContent::new("use result types for errors", "r");
        assert!(!cmp.mutually_exclusive(&results, &close));

        let listed = FragmentContent::new("use result types for errors", "r")
            .with_alternatives(["use result types"]);
        assert!(cmp.mutually_exclusive(&results, &listed));
    }

    #[test]
    fn identical_context_without_handoff_is_direct() {
        let (_, engine) = setup();
        let older = fragment("a", "use exceptions", 0.7, "i1");
        let mut newer = fragment("b", "use result types", 0.72, "i2");
        newer.temporal.created_at = older.temporal.created_at + chrono::Duration::days(30);
        newer.temporal.valid_from = newer.temporal.created_at;

        assert_eq!(engine.classify(&newer, &older, 1.0), ConflictType::Direct);
        assert_eq!(engine.classify(&newer, &older, 0.85), ConflictType::Contextual);

        newer.replaces = Some("a".into());
        assert_eq!(engine.classify(&newer, &older, 1.0), ConflictType::Temporal);
    }

    #[test]
    fn validity_handoff_is_temporal() {
        let (_, engine) = setup();
        let mut older = fragment("a", "pin version 1", 0.7, "i1");
        let mut newer = fragment("b", "pin version 2", 0.7, "i2");
        let handoff = now() + chrono::Duration::days(10);
        older.temporal.valid_until = Some(handoff);
        newer.temporal.valid_from = handoff - chrono::Duration::days(2);
        assert_eq!(engine.classify(&newer, &older, 1.0), ConflictType::Temporal);
    }

    #[test]
    fn detection_is_idempotent() {
        let (store, engine) = setup();
        store.put(&fragment("a", "use exceptions", 0.7, "i1"), &topic()).unwrap();
        store.put(&fragment("b", "use result types", 0.72, "i2"), &topic()).unwrap();

        let first = engine.detect("b", now()).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].conflict_type, ConflictType::Direct);
        assert_eq!(first[0].status, ConflictStatus::Classified);
        assert_eq!((first[0].fragment_a.as_str(), first[0].fragment_b.as_str()), ("a", "b"));

        let again = engine.detect("b", now()).unwrap();
        assert_eq!(again, first);
        engine.detect("a", now()).unwrap();
        assert_eq!(conflict_rows(&store), 1);

        let events: Vec<String> = store
            .read(|c| ledger(c, "architect"))
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["detected", "classified"]);
    }

    #[test]
    fn agreeing_or_distant_fragments_do_not_conflict() {
        let (store, engine) = setup();
        store.put(&fragment("a", "use result types", 0.7, "i1"), &topic()).unwrap();
        store.put(&fragment("b", "use result types", 0.7, "i2"), &topic()).unwrap();

        let mut go = fragment("c", "use exceptions", 0.7, "i3");
        go.fingerprint = ContextFingerprint::builder().technologies(["go"]).build();
        store.put(&go, &topic()).unwrap();

        let other_topic = fragment("d", "use exceptions", 0.7, "i4");
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[7] = 1.0;
        store.put(&other_topic, &v).unwrap();

        assert!(engine.detect("b", now()).unwrap().is_empty());
        assert!(engine.detect("c", now()).unwrap().is_empty());
        assert!(engine.detect("d", now()).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn large_quality_gap_resolves_automatically() {
        let (store, engine) = setup();
        store.put(&fragment("a", "use exceptions", 0.5, "i1"), &topic()).unwrap();
        store.put(&fragment("b", "use result types", 0.8, "i2"), &topic()).unwrap();

        let handled = engine.process("b").await.unwrap();
        assert_eq!(handled.len(), 1);
        let done = &handled[0];
        assert_eq!(done.status, ConflictStatus::AutoResolved);
        assert_eq!(done.resolution_method, Some(ResolutionMethod::QualityGap));
        assert_eq!(done.outcome.as_ref().and_then(|o| o.survivor()), Some("b"));

        assert_eq!(store.get("a").unwrap().superseded_by.as_deref(), Some("b"));
        let winner = store.read(|c| reputation::reputation_of(c, "i2")).unwrap();
        let loser = store.read(|c| reputation::reputation_of(c, "i1")).unwrap();
        assert!(winner > reputation::DEFAULT_REPUTATION);
        assert!(loser < reputation::DEFAULT_REPUTATION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn declared_replacement_supersedes_when_not_worse() {
        let (store, engine) = setup();
        store.put(&fragment("a", "pin version 1", 0.6, "i1"), &topic()).unwrap();
        let mut newer = fragment("b", "pin version 2", 0.58, "i1");
        newer.replaces = Some("a".into());
        store.put(&newer, &topic()).unwrap();

        let handled = engine.process("b").await.unwrap();
        assert_eq!(handled[0].conflict_type, ConflictType::Temporal);
        assert_eq!(handled[0].resolution_method, Some(ResolutionMethod::Supersession));
        assert!(store.get("a").unwrap().is_superseded());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_oracle_escalates_and_keeps_both() {
        let (store, engine) = setup();
        store.put(&fragment("a", "use exceptions", 0.70, "i1"), &topic()).unwrap();
        store.put(&fragment("b", "use result types", 0.72, "i2"), &topic()).unwrap();

        let handled = engine.process("b").await.unwrap();
        assert_eq!(handled[0].status, ConflictStatus::Escalated);
        assert!(handled[0].resolved_at.is_some());
        assert!(!store.get("a").unwrap().is_superseded());
        assert!(!store.get("b").unwrap().is_superseded());

        let events: Vec<String> = store
            .read(|c| ledger(c, "architect"))
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec!["detected", "classified", "debate_requested", "oracle_failed", "escalated"]
        );

        // escalated conflicts are not reopened
        assert!(engine.detect("b", now()).unwrap().is_empty());
        assert_eq!(conflict_rows(&store), 1);
        let escalated = engine
            .conflicts_for("architect", Some(ConflictStatus::Escalated))
            .unwrap();
        assert_eq!(escalated.len(), 1);
    }

    fn ledger_events(store: &HybridStore) -> Vec<String> {
        store
            .read(|c| ledger(c, "architect"))
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_copy_leaves_settled_conflict_alone() {
        let (store, engine) = setup();
        store.put(&fragment("a", "use exceptions", 0.5, "i1"), &topic()).unwrap();
        store.put(&fragment("b", "use result types", 0.8, "i2"), &topic()).unwrap();

        let stale = engine.detect("b", now()).unwrap().remove(0);
        assert_eq!(stale.status, ConflictStatus::Classified);
        engine.process("b").await.unwrap();

        let again = engine.resolve(stale).await.unwrap();
        assert_eq!(again.status, ConflictStatus::AutoResolved);
        assert_eq!(again.resolution_method, Some(ResolutionMethod::QualityGap));
        assert_eq!(ledger_events(&store), vec!["detected", "classified", "auto_resolved"]);

        for instance in ["i1", "i2"] {
            let record = store
                .read(|c| reputation::get_record(c, instance))
                .unwrap()
                .unwrap();
            assert_eq!(record.events, 1, "{instance} signalled more than once");
        }
    }

    #[test]
    fn debate_claim_is_exclusive_and_reopens_after_interruption() {
        let (store, engine) = setup();
        store.put(&fragment("a", "use exceptions", 0.70, "i1"), &topic()).unwrap();
        store.put(&fragment("b", "use result types", 0.72, "i2"), &topic()).unwrap();

        let conflict = engine.detect("b", now()).unwrap().remove(0);
        let (first, claimed) = engine.claim_debate(&conflict, now()).unwrap();
        assert!(first);
        assert_eq!(claimed.status, ConflictStatus::DebateRequested);
        let (second, stored) = engine.claim_debate(&conflict, now()).unwrap();
        assert!(!second);
        assert_eq!(stored.status, ConflictStatus::DebateRequested);

        engine.mark_checked("a", now()).unwrap();
        engine.mark_checked("b", now()).unwrap();
        assert!(engine.unchecked_fragments().unwrap().is_empty());

        assert_eq!(engine.reopen_interrupted_debates().unwrap(), 1);
        let reopened = store.read(|c| load_conflict(c, &conflict.id)).unwrap().unwrap();
        assert_eq!(reopened.status, ConflictStatus::Classified);
        assert_eq!(engine.unchecked_fragments().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            ledger_events(&store),
            vec!["detected", "classified", "debate_requested", "debate_reopened"]
        );
        assert_eq!(engine.reopen_interrupted_debates().unwrap(), 0);
    }
}
