//! Transactional storage for the filesystem state.
//!
//! Three tables hold everything the filesystem is: `inode` (file objects),
//! `block` (fixed-size payload slices of an inode) and `tree_node` (name
//! bindings forming the directory tree). The two composite unique
//! constraints, `(parent_id, name)` on tree-nodes and `(inode_id, sequence)`
//! on blocks, are the primitives the layers above rely on for duplicate
//! detection.
//!
//! The submodules expose row-level operations as free functions over a
//! connection and a row identity. Mutating dispatcher entries wrap them in a
//! single transaction obtained from [`Store::conn`].

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql};

use crate::errors::FsResult;

pub mod block;
pub mod inode;
pub mod tree;

/// Identity of an inode row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(pub i64);

/// Identity of a tree-node row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub i64);

impl std::fmt::Display for InodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl ToSql for InodeId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for InodeId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(InodeId)
    }
}

impl ToSql for NodeId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for NodeId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(NodeId)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS inode (
    id      INTEGER PRIMARY KEY,
    inuse   INTEGER NOT NULL DEFAULT 0,
    mode    INTEGER NOT NULL DEFAULT 0,
    uid     INTEGER NOT NULL DEFAULT 0,
    gid     INTEGER NOT NULL DEFAULT 0,
    atime   INTEGER NOT NULL DEFAULT 0,
    mtime   INTEGER NOT NULL DEFAULT 0,
    ctime   INTEGER NOT NULL DEFAULT 0,
    size    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS block (
    id       INTEGER PRIMARY KEY,
    inode_id INTEGER NOT NULL REFERENCES inode(id) ON DELETE CASCADE,
    sequence INTEGER NOT NULL,
    data     BLOB NOT NULL,
    UNIQUE (inode_id, sequence)
);

CREATE TABLE IF NOT EXISTS tree_node (
    id        INTEGER PRIMARY KEY,
    parent_id INTEGER REFERENCES tree_node(id) ON DELETE CASCADE,
    name      TEXT NOT NULL,
    inode_id  INTEGER NOT NULL REFERENCES inode(id) ON DELETE CASCADE,
    UNIQUE (parent_id, name)
);

CREATE INDEX IF NOT EXISTS tree_node_inode ON tree_node(inode_id);

-- NULL parents compare distinct under the composite unique constraint, so
-- volume roots need their own uniqueness guarantee.
CREATE UNIQUE INDEX IF NOT EXISTS tree_node_root_name
    ON tree_node(name) WHERE parent_id IS NULL;
";

/// Handle on the database holding the filesystem.
///
/// A single connection behind a mutex: SQLite cannot sustain concurrent
/// writers, so every operation, transactional or point read, serializes
/// here. The guard derefs to [`rusqlite::Connection`], from which mutating
/// callers start their transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and bootstraps the
    /// schema.
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory database, used by the test suites.
    pub fn open_in_memory() -> FsResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> FsResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Exclusive access to the underlying connection.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_bootstraps_twice() {
        let store = Store::open_in_memory().unwrap();
        // re-running the DDL against a populated database must be harmless
        store.conn().execute_batch(SCHEMA).unwrap();
    }

    #[test]
    fn duplicate_root_names_rejected() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        conn.execute("INSERT INTO inode (mode) VALUES (0)", []).unwrap();
        conn.execute(
            "INSERT INTO tree_node (parent_id, name, inode_id) VALUES (NULL, 'vol', 1)",
            [],
        )
        .unwrap();
        assert!(conn
            .execute(
                "INSERT INTO tree_node (parent_id, name, inode_id) VALUES (NULL, 'vol', 1)",
                [],
            )
            .is_err());
    }

    #[test]
    fn cascade_deletes_blocks() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        conn.execute("INSERT INTO inode (mode) VALUES (0)", []).unwrap();
        conn.execute(
            "INSERT INTO block (inode_id, sequence, data) VALUES (1, 0, x'00')",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM inode WHERE id = 1", []).unwrap();
        let blocks: i64 = conn
            .query_row("SELECT COUNT(*) FROM block", [], |row| row.get(0))
            .unwrap();
        assert_eq!(blocks, 0);
    }
}
