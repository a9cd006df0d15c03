//! Schema versioning.
//!
//! `schema_meta` holds the schema version and the embedding model the stored
//! vectors came from. Migrations only move forward.

use rusqlite::Connection;

/// The schema version that the current binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Get the current schema version from the database.
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        [],
        |row| {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().unwrap_or(0))
        },
    )
}

fn update_schema_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE schema_meta SET value = ?1 WHERE key = 'schema_version'",
        [version.to_string()],
    )?;
    Ok(())
}

/// Get the stored embedding model identifier, if any.
pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    match conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'embedding_model'",
        [],
        |row| row.get::<_, String>(0),
    ) {
        Ok(val) => Ok(Some(val)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Set the stored embedding model identifier.
pub fn set_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('embedding_model', ?1)",
        [model],
    )?;
    Ok(())
}

/// Run pending forward-only migrations, one transaction per step.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    let mut version = get_schema_version(conn)?;
    if version >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        let tx = conn.transaction()?;
        match next {
            2 => index_unchecked_fragments(&tx)?,
            _ => {
                tracing::error!(version = next, "no migration to schema version");
                break;
            }
        }
        update_schema_version(&tx, next)?;
        tx.commit()?;
        tracing::info!(from = version, to = next, "schema migrated");
        version = next;
    }

    Ok(())
}

/// v2: partial index for conflict checks that have not completed yet.
fn index_unchecked_fragments(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_fragments_unchecked \
         ON fragments(created_at) WHERE conflict_checked_at IS NULL;",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_db() -> Connection {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn migrates_fresh_db_to_current() {
        let mut conn = fresh_db();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);

        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);

        let indexed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_fragments_unchecked'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexed, 1);
    }

    #[test]
    fn embedding_model_is_unset_until_recorded() {
        let mut conn = fresh_db();
        run_migrations(&mut conn).unwrap();
        assert_eq!(get_embedding_model(&conn).unwrap(), None);

        set_embedding_model(&conn, "hash-384").unwrap();
        assert_eq!(get_embedding_model(&conn).unwrap(), Some("hash-384".to_string()));
    }
}
