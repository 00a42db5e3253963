//! SQLite schema migrations
//!
//! Tables: databases, object_stores, entries

use crate::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i32 = 2;

/// Bytes one `entries` row is charged against the quota
pub(super) const ENTRY_BYTES: &str = "CASE key_kind WHEN 0 THEN 8 ELSE length(CAST(key_text AS BLOB)) END
     + length(CAST(value AS BLOB))";

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    let result: std::result::Result<i32, _> =
        conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        });

    match result {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(rusqlite::Error::SqliteFailure(_, _)) => {
            // Table doesn't exist yet
            conn.execute(
                "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
                [],
            )?;
            conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
            Ok(0)
        }
        Err(e) => Err(e.into()),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v1: Initial schema");

    // One row per logical database and its current version
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS databases (
            name TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
    "#,
    )?;

    // Stores are only ever added during an upgrade
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS object_stores (
            database TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (database, name),
            FOREIGN KEY (database) REFERENCES databases(name) ON DELETE CASCADE
        );
    "#,
    )?;

    // Keys are split into kind/int/text so ORDER BY yields the natural key order
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            database TEXT NOT NULL,
            store TEXT NOT NULL,
            key_kind INTEGER NOT NULL,
            key_int INTEGER NOT NULL DEFAULT 0,
            key_text TEXT NOT NULL DEFAULT '',
            value TEXT NOT NULL,
            PRIMARY KEY (database, store, key_kind, key_int, key_text),
            FOREIGN KEY (database, store) REFERENCES object_stores(database, name) ON DELETE CASCADE
        );
    "#,
    )?;

    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v2: Stored bytes per database");

    conn.execute(
        "ALTER TABLE databases ADD COLUMN used_bytes INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    conn.execute(
        &format!(
            "UPDATE databases SET used_bytes = (
                SELECT COALESCE(SUM({ENTRY_BYTES}), 0)
                FROM entries WHERE entries.database = databases.name
             )"
        ),
        [],
    )?;

    Ok(())
}
