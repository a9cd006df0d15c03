use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::error::Result;
use super::temporal::TemporalManager;
use super::types::ts;

/// Per-agent-type statistics.
///
/// Counts cover every fragment the agent type owns, historical ones included.
/// With a project, fragments scoped to other projects are left out.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub agent_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub total_fragments: u64,
    /// Valid now and neither superseded nor archived.
    pub active_fragments: u64,
    /// Expired, stale, deprecated or superseded, but not archived.
    pub historical_fragments: u64,
    pub superseded_fragments: u64,
    pub archived_fragments: u64,
    /// Mean composite over non-archived fragments; 0 when there are none.
    pub average_quality: f64,
    pub by_kind: BTreeMap<String, u64>,
    pub conflicts: BTreeMap<String, u64>,
    pub ledger_events: u64,
    pub contributors: u64,
}

/// Compute statistics for one agent type at `now`.
pub fn get_statistics(
    conn: &Connection,
    temporal: &TemporalManager,
    agent_type: &str,
    project_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Stats> {
    let now_ts = ts(&now);
    let stale_cutoff = ts(&(now - temporal.revalidation_interval()));

    // ?1 agent type, ?2 project filter
    const SCOPE: &str = "agent_type = ?1 AND (?2 IS NULL OR project_id IS NULL OR project_id = ?2)";

    let (total, superseded, archived, average): (i64, i64, i64, Option<f64>) = conn.query_row(
        &format!(
            "SELECT COUNT(*), \
                    COALESCE(SUM(superseded_by IS NOT NULL AND archived_at IS NULL), 0), \
                    COALESCE(SUM(archived_at IS NOT NULL), 0), \
                    AVG(CASE WHEN archived_at IS NULL THEN quality_score END) \
             FROM fragments WHERE {SCOPE}"
        ),
        params![agent_type, project_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    let active: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM fragments WHERE {SCOPE} \
               AND archived_at IS NULL AND superseded_by IS NULL \
               AND valid_from <= ?3 \
               AND (valid_until IS NULL OR valid_until > ?3) \
               AND (deprecated_at IS NULL OR deprecated_at > ?3) \
               AND last_validated_at >= ?4"
        ),
        params![agent_type, project_id, now_ts, stale_cutoff],
        |row| row.get(0),
    )?;

    let by_kind = grouped(
        conn,
        &format!("SELECT kind, COUNT(*) FROM fragments WHERE {SCOPE} GROUP BY kind"),
        agent_type,
        project_id,
    )?;

    let conflicts = grouped(
        conn,
        "SELECT c.status, COUNT(*) FROM conflicts c \
         JOIN fragments f ON f.id = c.fragment_a \
         WHERE c.agent_type = ?1 AND (?2 IS NULL OR f.project_id IS NULL OR f.project_id = ?2) \
         GROUP BY c.status",
        agent_type,
        project_id,
    )?;

    let ledger_events: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conflict_ledger WHERE agent_type = ?1",
        params![agent_type],
        |row| row.get(0),
    )?;

    let contributors: i64 = conn.query_row(
        "SELECT COUNT(*) FROM agent_instances WHERE agent_type = ?1",
        params![agent_type],
        |row| row.get(0),
    )?;

    let live = total - archived;
    Ok(Stats {
        agent_type: agent_type.to_string(),
        project_id: project_id.map(String::from),
        total_fragments: total as u64,
        active_fragments: active as u64,
        historical_fragments: (live - active).max(0) as u64,
        superseded_fragments: superseded as u64,
        archived_fragments: archived as u64,
        average_quality: average.unwrap_or(0.0),
        by_kind,
        conflicts,
        ledger_events: ledger_events as u64,
        contributors: contributors as u64,
    })
}

fn grouped(
    conn: &Connection,
    sql: &str,
    agent_type: &str,
    project_id: Option<&str>,
) -> Result<BTreeMap<String, u64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![agent_type, project_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut map = BTreeMap::new();
    for row in rows {
        let (key, count) = row?;
        map.insert(key, count as u64);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemporalConfig;
    use crate::embedding::EMBEDDING_DIM;
    use crate::memory::fingerprint::ContextFingerprint;
    use crate::memory::store::HybridStore;
    use crate::memory::types::{
        now, FragmentContent, KnowledgeKind, MemoryFragment, QualityScores, Scope,
        TemporalMetadata, UsageStats,
    };

    fn fragment(id: &str, quality: f64, scope: Scope) -> MemoryFragment {
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
            contributors: vec!["i1".into()],
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
            scope,
            cross_type_refs: vec![],
            archived_at: None,
            version: 1,
        }
    }

    #[test]
    fn counts_active_historical_and_archived() {
        let store = HybridStore::new(crate::db::open_memory_database().unwrap(), 8);
        let temporal = TemporalManager::new(&TemporalConfig::default());
        let v = vec![1.0f32 / (EMBEDDING_DIM as f32).sqrt(); EMBEDDING_DIM];

        store.put(&fragment("live", 0.6, Scope::Contextual), &v).unwrap();

        let mut expired = fragment("expired", 0.4, Scope::Contextual);
        expired.temporal.valid_from = now() - chrono::Duration::days(3);
        expired.temporal.valid_until = Some(now() - chrono::Duration::days(1));
        store.put(&expired, &v).unwrap();

        let mut archived = fragment("archived", 0.1, Scope::Contextual);
        archived.archived_at = Some(now());
        store.put(&archived, &v).unwrap();

        store
            .put(&fragment("elsewhere", 0.8, Scope::Project("other".into())), &v)
            .unwrap();

        let stats = store
            .read(|c| get_statistics(c, &temporal, "architect", None, now()))
            .unwrap();
        assert_eq!(stats.total_fragments, 4);
        assert_eq!(stats.active_fragments, 2);
        assert_eq!(stats.historical_fragments, 1);
        assert_eq!(stats.archived_fragments, 1);
        assert!((stats.average_quality - 0.6).abs() < 1e-9);
        assert_eq!(stats.by_kind.get("declarative"), Some(&4));
        assert_eq!(stats.contributors, 1);

        let scoped = store
            .read(|c| get_statistics(c, &temporal, "architect", Some("cairn"), now()))
            .unwrap();
        assert_eq!(scoped.total_fragments, 3);
        assert_eq!(scoped.active_fragments, 1);
    }

    #[test]
    fn unknown_agent_type_has_empty_stats() {
        let conn = crate::db::open_memory_database().unwrap();
        let temporal = TemporalManager::new(&TemporalConfig::default());
        let stats = get_statistics(&conn, &temporal, "nobody", None, now()).unwrap();
        assert_eq!(stats.total_fragments, 0);
        assert_eq!(stats.average_quality, 0.0);
        assert!(stats.conflicts.is_empty());
    }
}
