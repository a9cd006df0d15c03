//! SQL DDL for all Cairn tables.
//!
//! The relationship graph is stored as typed node tables (`agent_types`,
//! `agent_instances`, `fragments`, `context_fingerprints`, `conflicts`) plus a
//! typed edge table (`graph_edges`). Semantic candidates come from the vec0
//! table `fragments_vec`. Quality history, the conflict ledger, contributor
//! reputation and the audit log round it out. All DDL uses `IF NOT EXISTS`.

use rusqlite::Connection;

/// All schema DDL statements for Cairn's core tables.
const SCHEMA_SQL: &str = r#"
-- Node: logical agent class owning a partition of fragments
CREATE TABLE IF NOT EXISTS agent_types (
    key TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Node: runtime actor contributing and validating fragments
CREATE TABLE IF NOT EXISTS agent_instances (
    id TEXT PRIMARY KEY,
    agent_type TEXT NOT NULL REFERENCES agent_types(key),
    first_seen_at TEXT NOT NULL
);

-- Node: immutable context descriptor, deduplicated by digest
CREATE TABLE IF NOT EXISTS context_fingerprints (
    digest TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Node: memory fragment. Content columns are written once; quality and
-- temporal columns move forward through versioned updates.
CREATE TABLE IF NOT EXISTS fragments (
    id TEXT PRIMARY KEY,
    agent_type TEXT NOT NULL REFERENCES agent_types(key),
    kind TEXT NOT NULL CHECK(kind IN ('procedural','declarative','meta','anti_pattern')),
    content TEXT NOT NULL,
    content_digest TEXT NOT NULL,
    fingerprint_digest TEXT NOT NULL REFERENCES context_fingerprints(digest),
    scope TEXT NOT NULL DEFAULT 'contextual' CHECK(scope IN ('contextual','universal','project')),
    project_id TEXT,
    cross_type_refs TEXT NOT NULL DEFAULT '[]',
    quality_score REAL NOT NULL CHECK(quality_score >= 0.0 AND quality_score <= 1.0),
    quality_scores TEXT NOT NULL,
    validation_count INTEGER NOT NULL DEFAULT 0,
    application_count INTEGER NOT NULL DEFAULT 0,
    success_rate REAL NOT NULL DEFAULT 0.0,
    last_used_at TEXT,
    created_at TEXT NOT NULL,
    last_validated_at TEXT NOT NULL,
    valid_from TEXT NOT NULL,
    valid_until TEXT,
    deprecated_at TEXT,
    archived_at TEXT,
    superseded_by TEXT,
    replaces TEXT,
    conflict_checked_at TEXT,
    version INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_fragments_agent_type ON fragments(agent_type);
CREATE INDEX IF NOT EXISTS idx_fragments_kind ON fragments(agent_type, kind);
CREATE INDEX IF NOT EXISTS idx_fragments_project ON fragments(project_id);
CREATE INDEX IF NOT EXISTS idx_fragments_quality ON fragments(quality_score);
CREATE INDEX IF NOT EXISTS idx_fragments_superseded ON fragments(superseded_by);

-- Typed, timestamped edges between graph nodes
CREATE TABLE IF NOT EXISTS graph_edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    edge_type TEXT NOT NULL CHECK(edge_type IN (
        'OWNS','CONTRIBUTED_BY','APPLIES_IN','SUPERSEDES',
        'CONFLICTS_WITH','VALIDATED_BY','SCOPED_TO')),
    src_id TEXT NOT NULL,
    dst_id TEXT NOT NULL,
    reason TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edges_src ON graph_edges(edge_type, src_id);
CREATE INDEX IF NOT EXISTS idx_edges_dst ON graph_edges(edge_type, dst_id);

-- Node: detected conflict between two fragments of one agent type.
-- fragment_a < fragment_b so a pair maps to exactly one row.
CREATE TABLE IF NOT EXISTS conflicts (
    id TEXT PRIMARY KEY,
    agent_type TEXT NOT NULL REFERENCES agent_types(key),
    fragment_a TEXT NOT NULL REFERENCES fragments(id),
    fragment_b TEXT NOT NULL REFERENCES fragments(id),
    conflict_type TEXT NOT NULL CHECK(conflict_type IN ('temporal','contextual','direct')),
    status TEXT NOT NULL CHECK(status IN (
        'detected','classified','auto_resolved','debate_requested','resolved','escalated')),
    resolution_method TEXT,
    outcome TEXT,
    rationale TEXT,
    detected_at TEXT NOT NULL,
    resolved_at TEXT,
    UNIQUE(fragment_a, fragment_b),
    CHECK(fragment_a < fragment_b)
);

CREATE INDEX IF NOT EXISTS idx_conflicts_agent_type ON conflicts(agent_type);
CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts(status);

-- Append-only resolution history per agent type
CREATE TABLE IF NOT EXISTS conflict_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_type TEXT NOT NULL,
    conflict_id TEXT NOT NULL,
    event TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS conflict_ledger_no_update
BEFORE UPDATE ON conflict_ledger
BEGIN
    SELECT RAISE(ABORT, 'conflict ledger is append-only');
END;

CREATE TRIGGER IF NOT EXISTS conflict_ledger_no_delete
BEFORE DELETE ON conflict_ledger
BEGIN
    SELECT RAISE(ABORT, 'conflict ledger is append-only');
END;

-- Every quality change appends a snapshot
CREATE TABLE IF NOT EXISTS quality_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fragment_id TEXT NOT NULL REFERENCES fragments(id),
    version INTEGER NOT NULL,
    quality_score REAL NOT NULL,
    quality_scores TEXT NOT NULL,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_fragment ON quality_snapshots(fragment_id);

-- Per-contributor weighting, owned by the reputation tracker
CREATE TABLE IF NOT EXISTS contributor_reputation (
    instance_id TEXT PRIMARY KEY,
    positive REAL NOT NULL DEFAULT 0.0,
    negative REAL NOT NULL DEFAULT 0.0,
    events INTEGER NOT NULL DEFAULT 0,
    reputation REAL NOT NULL DEFAULT 0.5,
    updated_at TEXT NOT NULL
);

-- Audit log
CREATE TABLE IF NOT EXISTS fragment_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','feedback','supersede','decay','archive','orphan_sweep')),
    fragment_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS fragments_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
