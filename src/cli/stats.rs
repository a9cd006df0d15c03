use anyhow::Result;

use crate::config::CairnConfig;
use crate::memory::stats::get_statistics;
use crate::memory::temporal::TemporalManager;
use crate::memory::types::now;

/// Display statistics for one agent type in the terminal.
pub fn stats(config: &CairnConfig, agent_type: &str, project: Option<&str>) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path)?;
    let temporal = TemporalManager::new(&config.temporal);

    let stats = get_statistics(&conn, &temporal, agent_type, project, now())?;

    println!("Memory Statistics: {agent_type}");
    println!("{}", "=".repeat(40));
    if let Some(project) = project {
        println!("  Project:             {project}");
    }
    println!("  Total fragments:     {}", stats.total_fragments);
    println!("  Active:              {}", stats.active_fragments);
    println!("  Historical:          {}", stats.historical_fragments);
    println!("  Superseded:          {}", stats.superseded_fragments);
    println!("  Archived:            {}", stats.archived_fragments);
    println!("  Average quality:     {:.3}", stats.average_quality);
    println!("  Contributors:        {}", stats.contributors);
    println!();

    println!("By Kind:");
    for kind in ["procedural", "declarative", "meta", "anti_pattern"] {
        let count = stats.by_kind.get(kind).copied().unwrap_or(0);
        println!("  {:<14} {}", kind, count);
    }
    println!();

    println!("Conflicts:");
    if stats.conflicts.is_empty() {
        println!("  (none)");
    }
    for (status, count) in &stats.conflicts {
        println!("  {:<18} {}", status, count);
    }
    println!("  Ledger events:     {}", stats.ledger_events);

    Ok(())
}
