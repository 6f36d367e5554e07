//! Sqlite-backed source registry.
//!
//! The registry is the external source of truth for which streams the
//! gateway should hold open. The hub only ever reads the active set and
//! flips `active` off when a source trips the dial-failure circuit
//! breaker; everything else (adding sources, re-enabling them) is an
//! administrative operation.
//!
//! A connection is opened per operation. Calls are cheap and infrequent
//! (one batch per reconciliation cycle), and this keeps the store `Clone`
//! and free of any cross-task locking.

use crate::Result;
use rusqlite::Connection;
use std::path::PathBuf;
use tracing::debug;

/// One row of the `sources` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub id: i64,
    pub name: String,
    pub connection_string: String,
    pub active: bool,
    /// Dial/handshake timeout for this source, in seconds
    pub timeout: u64,
}

/// Partial update of a source row. Only the populated fields are written,
/// each through a parameterized statement.
#[derive(Debug, Clone, Default)]
pub struct SourcePatch {
    pub name: Option<String>,
    pub connection_string: Option<String>,
    pub active: Option<bool>,
    pub timeout: Option<u64>,
}

/// Handle to the sqlite registry
#[derive(Debug, Clone)]
pub struct SourceStore {
    path: PathBuf,
}

impl SourceStore {
    /// Open the registry at `path`, creating the schema if absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        let conn = store.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                connection_string TEXT NOT NULL,
                active BOOLEAN DEFAULT 1,
                timeout INTEGER DEFAULT 15
            )",
            [],
        )?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    /// All sources with `active = 1`, in id order.
    pub fn fetch_active(&self) -> Result<Vec<SourceRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, connection_string, active, timeout
             FROM sources WHERE active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SourceRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                connection_string: row.get(2)?,
                active: row.get(3)?,
                timeout: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Apply a partial update to one source row.
    pub fn apply(&self, id: i64, patch: &SourcePatch) -> Result<()> {
        let mut sets: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(name) = &patch.name {
            sets.push("name = ?");
            params.push(Box::new(name.clone()));
        }
        if let Some(connection_string) = &patch.connection_string {
            sets.push("connection_string = ?");
            params.push(Box::new(connection_string.clone()));
        }
        if let Some(active) = patch.active {
            sets.push("active = ?");
            params.push(Box::new(active));
        }
        if let Some(timeout) = patch.timeout {
            sets.push("timeout = ?");
            params.push(Box::new(timeout as i64));
        }

        if sets.is_empty() {
            return Ok(());
        }
        params.push(Box::new(id));

        let sql = format!("UPDATE sources SET {} WHERE id = ?", sets.join(", "));
        let conn = self.connect()?;
        let updated = conn.execute(
            &sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
        )?;
        debug!("updated {} source row(s) for id {}", updated, id);
        Ok(())
    }

    /// Flip a source's active flag. Used by the circuit breaker and by
    /// operators re-enabling a source.
    pub fn set_active(&self, id: i64, active: bool) -> Result<()> {
        self.apply(
            id,
            &SourcePatch {
                active: Some(active),
                ..Default::default()
            },
        )
    }

    /// Register a new source and return its id.
    pub fn add_source(
        &self,
        name: &str,
        connection_string: &str,
        timeout: Option<u64>,
    ) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO sources (name, connection_string, timeout) VALUES (?, ?, ?)",
            rusqlite::params![name, connection_string, timeout.unwrap_or(15) as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SourceStore) {
        let dir = TempDir::new().unwrap();
        let store = SourceStore::open(dir.path().join("sources.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_bootstraps_schema() {
        let (_dir, store) = store();
        assert!(store.fetch_active().unwrap().is_empty());
    }

    #[test]
    fn test_add_and_fetch_active() {
        let (_dir, store) = store();
        let id = store
            .add_source("m1", "ntrip://u:p@caster:2101/M1", None)
            .unwrap();
        store
            .add_source("m2", "tcp://10.0.0.1:5000/raw", Some(5))
            .unwrap();

        let active = store.fetch_active().unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, id);
        assert_eq!(active[0].name, "m1");
        assert_eq!(active[0].timeout, 15);
        assert_eq!(active[1].timeout, 5);
        assert!(active.iter().all(|r| r.active));
    }

    #[test]
    fn test_set_active_excludes_from_fetch() {
        let (_dir, store) = store();
        let id = store
            .add_source("m1", "ntrip://caster:2101/M1", None)
            .unwrap();
        store.set_active(id, false).unwrap();
        assert!(store.fetch_active().unwrap().is_empty());

        store.set_active(id, true).unwrap();
        assert_eq!(store.fetch_active().unwrap().len(), 1);
    }

    #[test]
    fn test_patch_updates_only_named_fields() {
        let (_dir, store) = store();
        let id = store
            .add_source("m1", "ntrip://caster:2101/M1", None)
            .unwrap();

        store
            .apply(
                id,
                &SourcePatch {
                    connection_string: Some("ntrip://caster:2101/M2".to_string()),
                    timeout: Some(30),
                    ..Default::default()
                },
            )
            .unwrap();

        let rows = store.fetch_active().unwrap();
        assert_eq!(rows[0].name, "m1");
        assert_eq!(rows[0].connection_string, "ntrip://caster:2101/M2");
        assert_eq!(rows[0].timeout, 30);
    }

    #[test]
    fn test_empty_patch_is_noop() {
        let (_dir, store) = store();
        let id = store
            .add_source("m1", "ntrip://caster:2101/M1", None)
            .unwrap();
        store.apply(id, &SourcePatch::default()).unwrap();
        assert_eq!(store.fetch_active().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (_dir, store) = store();
        store
            .add_source("m1", "ntrip://caster:2101/M1", None)
            .unwrap();
        assert!(store
            .add_source("m1", "ntrip://caster:2101/M1", None)
            .is_err());
    }
}
