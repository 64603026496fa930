//! Durable `path -> {todo, done, error}` state store (SPEC_FULL.md §4.1).
//!
//! Backed by a single SQLite file and a single `Mutex`-guarded connection. Every
//! mutating operation runs inside an explicit transaction, so a crash mid-`mark_done`
//! can never leave the cascade half-applied.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StateError;

/// The status of one hierarchical path in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Todo,
    Done,
    Error,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Todo => "todo",
            Status::Done => "done",
            Status::Error => "error",
        }
    }

    fn from_str(s: &str) -> Status {
        match s {
            "done" => Status::Done,
            "error" => Status::Error,
            _ => Status::Todo,
        }
    }
}

/// One row of the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub path: String,
    pub status: Status,
}

/// Durable progress tracker keyed by `/`-delimited hierarchical path.
///
/// See SPEC_FULL.md §4.1 for the full contract. `register_or_skip` and `mark_done`
/// are the only mutating operations; both serialise on the same internal mutex, which
/// is sufficient because the store is small and every transaction is short-lived.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Opens (or creates) the state store backing file at `path`.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                path TEXT PRIMARY KEY,
                status TEXT NOT NULL
            )",
            [],
        )?;
        Ok(StateStore {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store, useful for tests that don't care about durability.
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                path TEXT PRIMARY KEY,
                status TEXT NOT NULL
            )",
            [],
        )?;
        Ok(StateStore {
            conn: Mutex::new(conn),
        })
    }

    /// Returns `true` iff `path` (or any ancestor of it) is already `Done`. If not,
    /// upserts `path` as `Todo` (when absent) and returns `false`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn register_or_skip(&self, path: &str) -> Result<bool, StateError> {
        let mut conn = self.conn.lock().expect("state store mutex poisoned");
        let tx = conn.transaction()?;

        for ancestor in ancestor_prefixes(path) {
            if row_status(&tx, &ancestor)? == Some(Status::Done) {
                tracing::debug!(%path, %ancestor, "skipping: ancestor already done");
                tx.commit()?;
                return Ok(true);
            }
        }

        if row_status(&tx, path)? == Some(Status::Done) {
            tracing::debug!(%path, "skipping: already done");
            tx.commit()?;
            return Ok(true);
        }

        tx.execute(
            "INSERT OR IGNORE INTO state (path, status) VALUES (?1, 'todo')",
            params![path],
        )?;
        tx.commit()?;
        Ok(false)
    }

    /// Marks `path` as `Done` and deletes every row whose path is a strict descendant
    /// of it, in one transaction. Idempotent.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn mark_done(&self, path: &str) -> Result<(), StateError> {
        let mut conn = self.conn.lock().expect("state store mutex poisoned");
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO state (path, status) VALUES (?1, 'done')
             ON CONFLICT(path) DO UPDATE SET status = 'done'",
            params![path],
        )?;

        let descendant_pattern = format!("{}/%", escape_like(path));
        tx.execute(
            "DELETE FROM state WHERE path LIKE ?1 ESCAPE '\\'",
            params![descendant_pattern],
        )?;

        tx.commit()?;
        tracing::info!(%path, "marked done");
        Ok(())
    }

    /// Returns the current row for `path`, inserting a `Todo` row first if absent.
    pub fn get(&self, path: &str) -> Result<StateEntry, StateError> {
        let conn = self.conn.lock().expect("state store mutex poisoned");
        if let Some(status) = row_status(&conn, path)? {
            return Ok(StateEntry {
                path: path.to_string(),
                status,
            });
        }
        conn.execute(
            "INSERT OR IGNORE INTO state (path, status) VALUES (?1, 'todo')",
            params![path],
        )?;
        Ok(StateEntry {
            path: path.to_string(),
            status: Status::Todo,
        })
    }
}

fn row_status(
    conn: &Connection,
    path: &str,
) -> Result<Option<Status>, StateError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM state WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status.map(|s| Status::from_str(&s)))
}

/// Every proper ancestor of `path`, shortest first. Does not include `path` itself.
fn ancestor_prefixes(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('/').collect();
    let mut prefixes = Vec::new();
    for i in 1..segments.len() {
        prefixes.push(segments[..i].join("/"));
    }
    prefixes
}

/// Escapes `%`, `_`, and `\` so `path` can be used as a literal prefix in a `LIKE`
/// pattern with `ESCAPE '\\'`.
fn escape_like(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '%' || c == '_' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_path_is_not_skipped_and_becomes_todo() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!store.register_or_skip("a/b/c").unwrap());
        assert_eq!(store.get("a/b/c").unwrap().status, Status::Todo);
    }

    #[test]
    fn mark_done_subsumes_descendants_even_without_rows() {
        let store = StateStore::open_in_memory().unwrap();
        store.mark_done("outer").unwrap();

        assert!(store.register_or_skip("outer/inner").unwrap());
        assert!(store.register_or_skip("outer/inner/deep").unwrap());
    }

    #[test]
    fn mark_done_deletes_existing_descendant_rows() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!store.register_or_skip("outer/a").unwrap());
        assert!(!store.register_or_skip("outer/b").unwrap());

        store.mark_done("outer").unwrap();

        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM state WHERE path LIKE 'outer/%'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn mark_done_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store.mark_done("outer/inner").unwrap();
        store.mark_done("outer/inner").unwrap();
        assert_eq!(store.get("outer/inner").unwrap().status, Status::Done);
    }

    #[test]
    fn sibling_paths_are_independent() {
        let store = StateStore::open_in_memory().unwrap();
        store.mark_done("outer/a").unwrap();
        assert!(!store.register_or_skip("outer/b").unwrap());
    }

    #[test]
    fn like_wildcards_in_path_do_not_leak_into_descendant_match() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!store.register_or_skip("outer/file_100%.zip/inner").unwrap());
        store.mark_done("outer/file_999x.zip").unwrap();
        // The escaped '%' must not make "file_100%.zip" match the pattern for
        // "file_999x.zip"'s descendants.
        assert!(!store.register_or_skip("outer/file_100%.zip/inner").unwrap());
    }
}
