//! Validity windows, staleness, supersession and archival.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::error::{MemoryError, Result};
use super::store::{self, HybridStore};
use super::types::{ts, EdgeType, FragmentId, MemoryFragment, TemporalMetadata};
use crate::config::TemporalConfig;

/// Archival thresholds for one sweep.
#[derive(Debug, Clone, Copy)]
pub struct ArchivalPolicy {
    /// Fragments not validated or used within this window are stale.
    pub max_age: Duration,
    /// Fragments scoring below this are low quality.
    pub min_quality: f64,
    /// Fragments applied fewer times than this are rarely used.
    pub max_uses: u32,
}

#[derive(Debug, Clone)]
pub struct TemporalManager {
    revalidation_interval: Duration,
}

impl TemporalManager {
    pub fn new(config: &TemporalConfig) -> Self {
        Self {
            revalidation_interval: Duration::days(config.revalidation_interval_days.max(0)),
        }
    }

    pub fn revalidation_interval(&self) -> Duration {
        self.revalidation_interval
    }

    /// Whether the fragment belongs in default candidate sets at `now`.
    pub fn is_valid(&self, fragment: &MemoryFragment, now: DateTime<Utc>) -> bool {
        self.window_is_valid(&fragment.temporal, now)
    }

    /// Not before `valid_from`, not at or past `valid_until` or deprecation,
    /// and validated within the revalidation interval.
    pub fn window_is_valid(&self, t: &TemporalMetadata, now: DateTime<Utc>) -> bool {
        if now < t.valid_from {
            return false;
        }
        if matches!(t.valid_until, Some(until) if now >= until) {
            return false;
        }
        if matches!(t.deprecated_at, Some(deprecated) if now >= deprecated) {
            return false;
        }
        now - t.last_validated_at <= self.revalidation_interval
    }

    /// Record that `new_id` supersedes `old_id` and close `old_id`'s window.
    ///
    /// Rejected with [`MemoryError::SupersessionCycle`] when `old_id` already
    /// (transitively) supersedes `new_id`; the graph is left unchanged.
    pub fn supersede(
        &self,
        store: &HybridStore,
        new_id: &str,
        old_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        store.write(|tx| link_supersession(tx, new_id, old_id, reason, now))?;
        store.evict(&[new_id, old_id]);
        tracing::info!(new = %new_id, old = %old_id, reason, "fragment superseded");
        Ok(())
    }

    /// Archive fragments that are stale, low quality and rarely used.
    ///
    /// Archived fragments leave default retrieval but stay in the graph.
    pub fn sweep_for_archival(
        &self,
        store: &HybridStore,
        policy: ArchivalPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<FragmentId>> {
        let cutoff = ts(&(now - policy.max_age));
        let archived = store.write(|tx| {
            let ids: Vec<FragmentId> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM fragments \
                     WHERE archived_at IS NULL \
                       AND quality_score < ?1 \
                       AND application_count < ?2 \
                       AND last_validated_at < ?3 \
                       AND (last_used_at IS NULL OR last_used_at < ?3) \
                     ORDER BY id",
                )?;
                let rows = stmt.query_map(
                    params![policy.min_quality, policy.max_uses, cutoff],
                    |row| row.get(0),
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            for id in &ids {
                tx.execute(
                    "UPDATE fragments SET archived_at = ?1, version = version + 1 WHERE id = ?2",
                    params![ts(&now), id],
                )?;
                store::write_log(
                    tx,
                    "archive",
                    id,
                    Some(&serde_json::json!({
                        "max_age_days": policy.max_age.num_days(),
                        "min_quality": policy.min_quality,
                    })),
                )?;
            }
            Ok(ids)
        })?;

        store.evict(&archived);
        tracing::info!(count = archived.len(), "archival sweep complete");
        Ok(archived)
    }
}

/// Supersession inside an open transaction, for callers batching other writes.
pub(crate) fn link_supersession(
    conn: &Connection,
    new_id: &str,
    old_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let cycle = || MemoryError::SupersessionCycle {
        new_id: new_id.to_string(),
        old_id: old_id.to_string(),
    };
    if new_id == old_id {
        return Err(cycle());
    }

    let lookup = |id: &str| -> Result<(String, Option<String>)> {
        conn.query_row(
            "SELECT agent_type, superseded_by FROM fragments WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| MemoryError::NotFound(format!("fragment {id}")))
    };
    let (new_type, _) = lookup(new_id)?;
    let (old_type, old_superseded_by) = lookup(old_id)?;

    if new_type != old_type {
        return Err(MemoryError::Validation(format!(
            "cannot supersede across agent types ({new_type} -> {old_type})"
        )));
    }
    match old_superseded_by.as_deref() {
        Some(existing) if existing == new_id => return Ok(()),
        Some(existing) => {
            return Err(MemoryError::Validation(format!(
                "fragment {old_id} is already superseded by {existing}"
            )))
        }
        None => {}
    }

    let adjacency = store::supersession_adjacency(conn, &new_type)?;
    if store::reachable(&adjacency, old_id, new_id) {
        return Err(cycle());
    }

    let now_ts = ts(&now);
    conn.execute(
        "UPDATE fragments SET superseded_by = ?1, \
             valid_until = CASE WHEN valid_until IS NULL OR valid_until > ?2 THEN ?2 ELSE valid_until END, \
             version = version + 1 \
         WHERE id = ?3",
        params![new_id, now_ts, old_id],
    )?;
    store::insert_edge(conn, EdgeType::Supersedes, new_id, old_id, Some(reason), &now)?;
    store::write_log(
        conn,
        "supersede",
        old_id,
        Some(&serde_json::json!({ "superseded_by": new_id, "reason": reason })),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fingerprint::ContextFingerprint;
    use crate::memory::types::{
        now, FragmentContent, KnowledgeKind, QualityScores, Scope, UsageStats,
    };

    fn manager() -> TemporalManager {
        TemporalManager::new(&TemporalConfig::default())
    }

    fn store() -> HybridStore {
        HybridStore::new(crate::db::open_memory_database().unwrap(), 16)
    }

    fn fragment(id: &str, quality: f64) -> MemoryFragment {
        let t = now();
        MemoryFragment {
            id: id.into(),
            agent_type: "architect".into(),
            kind: KnowledgeKind::Declarative,
            content: FragmentContent::new(format!("pattern {id}"), "reason"),
            quality_score: quality,
            quality: QualityScores {
                confidence: 0.5,
                validation: 0.0,
                recency: 1.0,
                consensus: 0.25,
                context_specificity: 0.2,
                impact: 0.5,
            },
            fingerprint: ContextFingerprint::builder().technologies(["rust"]).build(),
            usage: UsageStats::default(),
            contributors: vec!["a1".into()],
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

    fn put(store: &HybridStore, f: &MemoryFragment) {
        let mut v = vec![0.0f32; crate::embedding::EMBEDDING_DIM];
        v[0] = 1.0;
        store.put(f, &v).unwrap();
    }

    fn edge_count(store: &HybridStore) -> i64 {
        store
            .read(|c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM graph_edges WHERE edge_type = 'SUPERSEDES'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap()
    }

    #[test]
    fn expired_and_stale_fragments_are_invalid() {
        let m = manager();
        let t = now() + Duration::seconds(1);
        let mut f = fragment("f", 0.5);
        assert!(m.is_valid(&f, t));

        f.temporal.valid_until = Some(t - Duration::days(1));
        assert!(!m.is_valid(&f, t));

        let mut stale = fragment("s", 0.5);
        stale.temporal.last_validated_at = t - Duration::days(181);
        assert!(!m.is_valid(&stale, t));

        let mut future = fragment("u", 0.5);
        future.temporal.valid_from = t + Duration::days(1);
        assert!(!m.is_valid(&future, t));
    }

    #[test]
    fn supersede_closes_old_window() {
        let store = store();
        let m = manager();
        put(&store, &fragment("old", 0.5));
        put(&store, &fragment("new", 0.6));

        let t = now();
        m.supersede(&store, "new", "old", "newer guidance", t).unwrap();

        let old = store.get("old").unwrap();
        assert_eq!(old.superseded_by.as_deref(), Some("new"));
        assert_eq!(old.temporal.valid_until, Some(t));
        assert!(!m.is_valid(&old, t));
        assert_eq!(store.get("new").unwrap().supersedes, vec!["old".to_string()]);

        // repeating the same link is a no-op
        m.supersede(&store, "new", "old", "again", t).unwrap();
        assert_eq!(edge_count(&store), 1);
    }

    #[test]
    fn cycles_are_rejected_without_changes() {
        let store = store();
        let m = manager();
        for id in ["a", "b", "c"] {
            put(&store, &fragment(id, 0.5));
        }
        m.supersede(&store, "a", "b", "r", now()).unwrap();
        m.supersede(&store, "b", "c", "r", now()).unwrap();
        let before = edge_count(&store);

        let err = m.supersede(&store, "c", "a", "r", now()).unwrap_err();
        assert!(matches!(err, MemoryError::SupersessionCycle { .. }));
        assert_eq!(edge_count(&store), before);
        assert!(store.get("a").unwrap().superseded_by.is_none());

        let err = m.supersede(&store, "a", "a", "r", now()).unwrap_err();
        assert!(matches!(err, MemoryError::SupersessionCycle { .. }));
    }

    #[test]
    fn a_fragment_has_at_most_one_superseder() {
        let store = store();
        let m = manager();
        for id in ["x", "y", "z"] {
            put(&store, &fragment(id, 0.5));
        }
        m.supersede(&store, "x", "z", "r", now()).unwrap();
        let err = m.supersede(&store, "y", "z", "r", now()).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn archival_needs_stale_low_quality_and_rare_use() {
        let store = store();
        let m = manager();
        let t = now();
        let old = t - Duration::days(400);

        let mut candidate = fragment("candidate", 0.1);
        candidate.temporal.last_validated_at = old;
        put(&store, &candidate);

        let mut good = fragment("good", 0.8);
        good.temporal.last_validated_at = old;
        put(&store, &good);

        put(&store, &fragment("fresh", 0.1));

        let mut busy = fragment("busy", 0.1);
        busy.temporal.last_validated_at = old;
        busy.usage.application_count = 10;
        put(&store, &busy);

        let policy = ArchivalPolicy {
            max_age: Duration::days(180),
            min_quality: 0.3,
            max_uses: 3,
        };
        let archived = m.sweep_for_archival(&store, policy, t).unwrap();
        assert_eq!(archived, vec!["candidate".to_string()]);

        // archived, not deleted
        let f = store.get("candidate").unwrap();
        assert_eq!(f.archived_at, Some(t));
        assert!(m.sweep_for_archival(&store, policy, t).unwrap().is_empty());
    }
}
