use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::error::{MemoryError, Result};
use super::quality::QualityScorer;
use super::store::{self, HybridStore};
use super::temporal::{ArchivalPolicy, TemporalManager};
use super::types::FragmentId;
use crate::config::MaintenanceConfig;

// ── Result types ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
pub struct DecayReport {
    pub examined: usize,
    pub decayed: usize,
    /// Fragments whose update lost every optimistic retry.
    pub contended: Vec<FragmentId>,
    /// Fragments that failed validation on read and were left untouched.
    pub corrupted: Vec<FragmentId>,
}

#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub archived: Vec<FragmentId>,
    pub orphaned_vectors: Vec<FragmentId>,
}

impl From<&MaintenanceConfig> for ArchivalPolicy {
    fn from(config: &MaintenanceConfig) -> Self {
        Self {
            max_age: Duration::days(config.archive_max_age_days.max(0)),
            min_quality: config.archive_min_quality,
            max_uses: config.archive_max_uses,
        }
    }
}

// ── Operations ───────────────────────────────────────────────────────────────

/// Lower the recency sub-score of every live fragment by its age.
///
/// Each fragment is a separate versioned update, so concurrent feedback is
/// never overwritten. Contention and corruption are reported per fragment.
pub fn apply_time_decay(
    store: &HybridStore,
    scorer: &QualityScorer,
    agent_type: Option<&str>,
    now: DateTime<Utc>,
    max_attempts: u32,
) -> Result<DecayReport> {
    let ids = store.read(|conn| store::live_fragment_ids(conn, agent_type))?;
    let mut report = DecayReport {
        examined: ids.len(),
        ..Default::default()
    };

    for id in ids {
        match store.update_quality(&id, max_attempts, |f| scorer.update_on_time_decay(f, now)) {
            Ok(Some(_)) => report.decayed += 1,
            Ok(None) => {}
            Err(MemoryError::Contention { .. }) => report.contended.push(id),
            Err(MemoryError::Corrupted { reason, .. }) => {
                tracing::warn!(%id, %reason, "skipping corrupted fragment during decay");
                report.corrupted.push(id);
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        examined = report.examined,
        decayed = report.decayed,
        contended = report.contended.len(),
        "time decay applied"
    );
    Ok(report)
}

/// Archive stale, low-quality, rarely used fragments and drop orphaned vectors.
pub fn sweep(
    store: &HybridStore,
    temporal: &TemporalManager,
    policy: ArchivalPolicy,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let archived = temporal.sweep_for_archival(store, policy, now)?;
    let orphaned_vectors = store.sweep_orphans()?;
    Ok(SweepReport {
        archived,
        orphaned_vectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QualityConfig, TemporalConfig};
    use crate::embedding::EMBEDDING_DIM;
    use crate::memory::fingerprint::ContextFingerprint;
    use crate::memory::types::{
        now, FragmentContent, KnowledgeKind, MemoryFragment, QualityScores, Scope,
        TemporalMetadata, UsageStats,
    };

    fn fragment(id: &str, validated_days_ago: i64) -> MemoryFragment {
        let t = now();
        let validated = t - Duration::days(validated_days_ago);
        MemoryFragment {
            id: id.into(),
            agent_type: "architect".into(),
            kind: KnowledgeKind::Meta,
            content: FragmentContent::new(format!("pattern {id}"), "reason"),
            quality_score: 0.5,
            quality: QualityScores {
                confidence: 0.5,
                validation: 0.0,
                recency: 1.0,
                consensus: 0.25,
                context_specificity: 0.2,
                impact: 0.5,
            },
            fingerprint: ContextFingerprint::builder().categories(["web"]).build(),
            usage: UsageStats::default(),
            contributors: vec!["i1".into()],
            temporal: TemporalMetadata {
                created_at: validated,
                last_validated_at: validated,
                valid_from: validated,
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

    fn spike(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim] = 1.0;
        v
    }

    #[test]
    fn decay_touches_only_aged_fragments_once() {
        let store = HybridStore::new(crate::db::open_memory_database().unwrap(), 8);
        let scorer = QualityScorer::new(&QualityConfig::default());
        store.put(&fragment("fresh", 0), &spike(0)).unwrap();
        store.put(&fragment("aged", 90), &spike(1)).unwrap();

        let t = now();
        let report = apply_time_decay(&store, &scorer, Some("architect"), t, 3).unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.decayed, 1);

        let aged = store.get("aged").unwrap();
        assert!(aged.quality.recency < 1.0);
        assert!(aged.quality_score < 0.5);
        assert_eq!(aged.version, 2);

        // a second pass at the same instant changes nothing
        let again = apply_time_decay(&store, &scorer, None, t, 3).unwrap();
        assert_eq!(again.decayed, 0);
    }

    #[test]
    fn sweep_archives_and_clears_orphans() {
        let store = HybridStore::new(crate::db::open_memory_database().unwrap(), 8);
        let temporal = TemporalManager::new(&TemporalConfig::default());
        let mut weak = fragment("weak", 400);
        weak.quality_score = 0.1;
        store.put(&weak, &spike(0)).unwrap();
        store.put(&fragment("fine", 1), &spike(1)).unwrap();

        let policy = ArchivalPolicy::from(&MaintenanceConfig::default());
        let report = sweep(&store, &temporal, policy, now()).unwrap();
        assert_eq!(report.archived, vec!["weak".to_string()]);
        assert!(report.orphaned_vectors.is_empty());
    }
}
