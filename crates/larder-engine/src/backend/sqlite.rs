//! SQLite backend

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use super::migrations::{run_migrations, ENTRY_BYTES};
use super::{Backend, Mutation, Schema};
use crate::error::EngineError;
use crate::key::Key;
use crate::Result;

const ENTRY_COLUMNS: &str = "key_kind, key_int, key_text, value";

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Store and entry rows cascade from their database
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // WAL mode for better concurrent performance
        let _: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

impl Clone for SqliteBackend {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

fn key_columns(key: &Key) -> (i64, i64, &str) {
    match key {
        Key::Int(i) => (0, *i, ""),
        Key::Text(s) => (1, 0, s.as_str()),
    }
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<(Key, String)> {
    let kind: i64 = row.get(0)?;
    let key = if kind == 0 {
        Key::Int(row.get(1)?)
    } else {
        Key::Text(row.get(2)?)
    };
    Ok((key, row.get(3)?))
}

fn decode_entry((key, raw): (Key, String)) -> Result<(Key, Value)> {
    Ok((key, serde_json::from_str(&raw)?))
}

impl Backend for SqliteBackend {
    fn schema(&self, database: &str) -> Result<Option<Schema>> {
        self.with_connection(|conn| {
            let version: Option<u32> = conn
                .query_row(
                    "SELECT version FROM databases WHERE name = ?1",
                    [database],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(version) = version else {
                return Ok(None);
            };

            let mut stmt = conn.prepare("SELECT name FROM object_stores WHERE database = ?1")?;
            let stores = stmt
                .query_map([database], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<BTreeSet<String>>>()?;

            Ok(Some(Schema { version, stores }))
        })
    }

    fn upgrade(&self, database: &str, version: u32, created: &[String]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.transaction(|conn| {
            // Upsert rather than replace: replacing would cascade-delete every store
            conn.execute(
                "INSERT INTO databases (name, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                    version = excluded.version,
                    updated_at = excluded.updated_at",
                rusqlite::params![database, version, now],
            )?;

            for store in created {
                conn.execute(
                    "INSERT OR IGNORE INTO object_stores (database, name, created_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![database, store, now],
                )?;
            }
            Ok(())
        })
    }

    fn drop_database(&self, database: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let removed = conn.execute("DELETE FROM databases WHERE name = ?1", [database])?;
            Ok(removed > 0)
        })
    }

    fn get(&self, database: &str, store: &str, key: &Key) -> Result<Option<Value>> {
        let (kind, int, text) = key_columns(key);
        let raw: Option<String> = self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM entries
                     WHERE database = ?1 AND store = ?2
                       AND key_kind = ?3 AND key_int = ?4 AND key_text = ?5",
                    rusqlite::params![database, store, kind, int, text],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn next_after(
        &self,
        database: &str,
        store: &str,
        after: Option<&Key>,
    ) -> Result<Option<(Key, Value)>> {
        let row = self.with_connection(|conn| {
            let row = match after {
                None => conn
                    .query_row(
                        &format!(
                            "SELECT {ENTRY_COLUMNS} FROM entries
                             WHERE database = ?1 AND store = ?2
                             ORDER BY key_kind, key_int, key_text LIMIT 1"
                        ),
                        rusqlite::params![database, store],
                        read_entry,
                    )
                    .optional()?,
                Some(key) => {
                    let (kind, int, text) = key_columns(key);
                    conn.query_row(
                        &format!(
                            "SELECT {ENTRY_COLUMNS} FROM entries
                             WHERE database = ?1 AND store = ?2
                               AND (key_kind, key_int, key_text) > (?3, ?4, ?5)
                             ORDER BY key_kind, key_int, key_text LIMIT 1"
                        ),
                        rusqlite::params![database, store, kind, int, text],
                        read_entry,
                    )
                    .optional()?
                }
            };
            Ok(row)
        })?;

        row.map(decode_entry).transpose()
    }

    fn scan(&self, database: &str, store: &str) -> Result<Vec<(Key, Value)>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries
                 WHERE database = ?1 AND store = ?2
                 ORDER BY key_kind, key_int, key_text"
            ))?;
            let rows = stmt
                .query_map([database, store], read_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(decode_entry).collect()
    }

    fn commit(&self, database: &str, batch: &[Mutation], quota: Option<u64>) -> Result<()> {
        self.transaction(|conn| {
            // Change in charged bytes, tracked per mutation
            let mut delta: i64 = 0;
            for mutation in batch {
                match mutation {
                    Mutation::Put { store, key, value } => {
                        delta -= stored_bytes(conn, database, store, key)?;
                        let raw = value.to_string();
                        let (kind, int, text) = key_columns(key);
                        conn.execute(
                            "INSERT OR REPLACE INTO entries
                             (database, store, key_kind, key_int, key_text, value)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            rusqlite::params![database, store, kind, int, text, raw],
                        )?;
                        delta += (key.stored_len() + raw.len() as u64) as i64;
                    }
                    Mutation::Delete { store, key } => {
                        delta -= stored_bytes(conn, database, store, key)?;
                        let (kind, int, text) = key_columns(key);
                        conn.execute(
                            "DELETE FROM entries
                             WHERE database = ?1 AND store = ?2
                               AND key_kind = ?3 AND key_int = ?4 AND key_text = ?5",
                            rusqlite::params![database, store, kind, int, text],
                        )?;
                    }
                    Mutation::Clear { store } => {
                        delta -= conn.query_row(
                            &format!(
                                "SELECT COALESCE(SUM({ENTRY_BYTES}), 0) FROM entries
                                 WHERE database = ?1 AND store = ?2"
                            ),
                            [database, store.as_str()],
                            |row| row.get::<_, i64>(0),
                        )?;
                        conn.execute(
                            "DELETE FROM entries WHERE database = ?1 AND store = ?2",
                            [database, store.as_str()],
                        )?;
                    }
                }
            }

            let used: i64 = conn.query_row(
                "SELECT used_bytes FROM databases WHERE name = ?1",
                [database],
                |row| row.get(0),
            )?;
            let used = (used + delta).max(0) as u64;
            if let Some(quota) = quota {
                if used > quota {
                    // Dropping the transaction rolls the batch back
                    return Err(EngineError::QuotaExceeded { used, quota });
                }
            }

            conn.execute(
                "UPDATE databases SET used_bytes = ?2 WHERE name = ?1",
                rusqlite::params![database, used as i64],
            )?;
            Ok(())
        })
    }
}

/// Bytes currently charged for `key`, zero when absent
fn stored_bytes(conn: &Connection, database: &str, store: &str, key: &Key) -> Result<i64> {
    let (kind, int, text) = key_columns(key);
    let bytes = conn
        .query_row(
            &format!(
                "SELECT {ENTRY_BYTES} FROM entries
                 WHERE database = ?1 AND store = ?2
                   AND key_kind = ?3 AND key_int = ?4 AND key_text = ?5"
            ),
            rusqlite::params![database, store, kind, int, text],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(bytes.unwrap_or(0))
}
