//! CLI maintenance commands: `decay` and `sweep`.

use anyhow::Result;

use crate::config::CairnConfig;
use crate::memory::maintenance;
use crate::memory::quality::QualityScorer;
use crate::memory::store::HybridStore;
use crate::memory::temporal::{ArchivalPolicy, TemporalManager};
use crate::memory::types::now;

fn open_store(config: &CairnConfig) -> Result<HybridStore> {
    let conn = crate::db::open_database(config.resolved_db_path())?;
    Ok(HybridStore::new(conn, config.storage.cache_capacity))
}

/// Apply time decay to live fragments, optionally for one agent type.
pub fn decay(config: &CairnConfig, agent_type: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let scorer = QualityScorer::new(&config.quality);

    println!("Applying time decay...");
    let report = maintenance::apply_time_decay(
        &store,
        &scorer,
        agent_type,
        now(),
        config.quality.max_update_retries,
    )?;

    println!("  Examined {} fragment(s), decayed {}.", report.examined, report.decayed);
    if !report.contended.is_empty() {
        println!("  Skipped {} under contention; run again later.", report.contended.len());
    }
    for id in &report.corrupted {
        println!("  Corrupted, left untouched: {id}");
    }
    Ok(())
}

/// Archive stale fragments and clear orphaned vectors.
pub fn sweep(config: &CairnConfig, max_age_days: Option<i64>, min_quality: Option<f64>) -> Result<()> {
    let store = open_store(config)?;
    let temporal = TemporalManager::new(&config.temporal);

    let mut policy = ArchivalPolicy::from(&config.maintenance);
    if let Some(days) = max_age_days {
        policy.max_age = chrono::Duration::days(days.max(0));
    }
    if let Some(q) = min_quality {
        policy.min_quality = q;
    }

    let report = maintenance::sweep(&store, &temporal, policy, now())?;

    if report.archived.is_empty() {
        println!("No fragments eligible for archival.");
    } else {
        println!("Archived {} fragment(s):", report.archived.len());
        for id in &report.archived {
            println!("  {id}");
        }
    }
    if !report.orphaned_vectors.is_empty() {
        println!("Removed {} orphaned vector(s).", report.orphaned_vectors.len());
    }
    Ok(())
}
