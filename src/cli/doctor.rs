//! CLI `doctor` command: database diagnostics and a health report.

use anyhow::{Context, Result};

use crate::config::CairnConfig;
use crate::db;
use crate::embedding;

pub fn doctor(config: &CairnConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `cairn serve` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;

    println!("Cairn Health Report");
    println!("===================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        {}", report.sqlite_vec_version);
    println!();
    println!("Embedding model:");
    println!("  Stored:          {}", report.embedding_model.as_deref().unwrap_or("(not set)"));
    let configured = embedding::configured_model_id(&config.embedding)?;
    println!("  Provider:        {} ({configured})", config.embedding.provider);
    if let Some(warning) = model_mismatch(report.embedding_model.as_deref(), &configured) {
        println!("  WARNING: {warning}");
    }
    println!();
    println!("Row counts:");
    println!("  Fragments:       {}", report.fragment_count);
    println!("  Vectors:         {}", report.vector_count);
    println!("  Conflicts:       {}", report.conflict_count);
    println!("  Ledger events:   {}", report.ledger_count);
    println!();

    if report.orphaned_vectors > 0 {
        println!(
            "Orphaned vectors:  {} (run `cairn sweep` to remove)",
            report.orphaned_vectors
        );
    }
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED");
        println!();
        println!("Restore from a backup: cp backup.db {}", db_path.display());
    }

    Ok(())
}

/// Warning text when stored vectors came from a different model than the configured one.
fn model_mismatch(stored: Option<&str>, configured: &str) -> Option<String> {
    match stored {
        Some(stored) if stored != configured => Some(format!(
            "model mismatch! Vectors were built with {stored} but {configured} is configured; \
             similarity against existing fragments is unreliable."
        )),
        _ => None,
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_byte_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn warns_only_on_model_mismatch() {
        assert!(model_mismatch(None, "all-MiniLM-L6-v2").is_none());
        assert!(model_mismatch(Some("all-MiniLM-L6-v2"), "all-MiniLM-L6-v2").is_none());

        let warning = model_mismatch(Some("hash-384"), "all-MiniLM-L6-v2").unwrap();
        assert!(warning.contains("hash-384"));
        assert!(warning.contains("all-MiniLM-L6-v2"));
    }
}
