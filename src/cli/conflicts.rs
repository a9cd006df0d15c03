use anyhow::Result;

use crate::config::CairnConfig;
use crate::memory::conflict::{ledger, list_conflicts};
use crate::memory::types::ConflictStatus;

/// List conflicts for an agent type, optionally with the full ledger.
pub fn conflicts(
    config: &CairnConfig,
    agent_type: &str,
    status: Option<&str>,
    show_ledger: bool,
) -> Result<()> {
    let status: Option<ConflictStatus> = status
        .map(str::parse)
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path)?;

    let found = list_conflicts(&conn, agent_type, status)?;
    if found.is_empty() {
        println!("No conflicts found.");
    } else {
        println!(
            "{:<38} {:<12} {:<16} {:<18} {}",
            "ID", "Type", "Status", "Method", "Fragments"
        );
        println!("{}", "-".repeat(110));
        for c in &found {
            let method = c.resolution_method.map(|m| m.to_string()).unwrap_or_default();
            println!(
                "{:<38} {:<12} {:<16} {:<18} {} / {}",
                c.id, c.conflict_type, c.status, method, c.fragment_a, c.fragment_b
            );
        }
    }

    if show_ledger {
        println!();
        println!("Ledger:");
        for entry in ledger(&conn, agent_type)? {
            let details = entry.details.as_ref().map(|d| d.to_string()).unwrap_or_default();
            println!("  {} {} [{}] {}", entry.created_at, entry.conflict_id, entry.event, details);
        }
    }

    Ok(())
}
