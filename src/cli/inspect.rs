//! CLI `inspect` command: full details for a single fragment.

use anyhow::Result;

use crate::config::CairnConfig;
use crate::memory::conflict::load_conflict;
use crate::memory::store::HybridStore;

pub fn inspect(config: &CairnConfig, id: &str) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path)?;
    let store = HybridStore::new(conn, 1);

    let f = store.get(id)?;
    println!("Fragment: {}", f.id);
    println!("{}", "=".repeat(50));
    println!("  Agent type:     {}", f.agent_type);
    println!("  Kind:           {}", f.kind);
    println!("  Scope:          {}", f.scope);
    println!("  Quality:        {:.3} (version {})", f.quality_score, f.version);
    println!(
        "  Validations:    {} (success rate {:.2})",
        f.usage.validation_count, f.usage.success_rate
    );
    println!("  Contributors:   {}", f.contributors.join(", "));
    println!("  Created:        {}", f.temporal.created_at);
    println!("  Last validated: {}", f.temporal.last_validated_at);
    if let Some(until) = f.temporal.valid_until {
        println!("  Valid until:    {until}");
    }
    if let Some(ref by) = f.superseded_by {
        println!("  Superseded by:  {by}");
    }
    if let Some(at) = f.archived_at {
        println!("  Archived:       {at}");
    }
    println!();
    println!("Pattern:");
    println!("  {}", f.content.pattern);
    println!("Reasoning:");
    println!("  {}", f.content.reasoning);

    let snapshots = store.snapshots(id)?;
    if !snapshots.is_empty() {
        println!();
        println!("Quality History:");
        for s in &snapshots {
            println!("  v{:<4} {:.3} {:<10} {}", s.version, s.quality_score, s.reason, s.created_at);
        }
    }

    let conflicts = store.read(|conn| {
        f.conflicts
            .iter()
            .filter_map(|link| load_conflict(conn, &link.conflict_id).transpose())
            .collect::<crate::memory::Result<Vec<_>>>()
    })?;
    if !conflicts.is_empty() {
        println!();
        println!("Conflicts:");
        for c in &conflicts {
            println!("  {} [{} / {}] with {}", c.id, c.conflict_type, c.status, c.other(id));
        }
    }

    let log = store.audit_log(id)?;
    if !log.is_empty() {
        println!();
        println!("Audit Log:");
        for entry in &log {
            let details = entry.details.as_ref().map(|d| d.to_string()).unwrap_or_default();
            println!("  {} [{}] {}", entry.created_at, entry.operation, details);
        }
    }

    Ok(())
}
