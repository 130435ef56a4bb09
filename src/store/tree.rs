//! Tree-node row operations.
//!
//! A tree-node binds one name inside a parent directory to an inode. The
//! `(parent_id, name)` unique constraint is the namespace's single source of
//! truth: lookups walk it, creates rely on it for `EEXIST`, renames move rows
//! across it. The volume root is the distinguished node whose parent is NULL
//! and whose name is the volume identifier; every directory also carries `.`
//! and `..` entries as ordinary rows.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{FsError, FsResult};

use super::{inode, InodeId, NodeId};

/// One row of the `tree_node` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRow {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub name: String,
    pub inode: InodeId,
}

/// One entry of a directory listing, joined with the target inode's mode so
/// the bridge can report entry types without a second lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryRow {
    pub name: String,
    pub inode: InodeId,
    pub mode: u32,
}

fn row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        id: row.get(0)?,
        parent: row.get(1)?,
        name: row.get(2)?,
        inode: row.get(3)?,
    })
}

const COLUMNS: &str = "id, parent_id, name, inode_id";

/// Finds the root node of `volume`, if the volume exists.
pub fn lookup_root(conn: &Connection, volume: &str) -> FsResult<Option<NodeRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM tree_node WHERE parent_id IS NULL AND name = ?1"),
            params![volume],
            row_from,
        )
        .optional()?)
}

/// Consults the `(parent, name)` index for one child of `parent`.
pub fn lookup_child(conn: &Connection, parent: NodeId, name: &str) -> FsResult<Option<NodeRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM tree_node WHERE parent_id = ?1 AND name = ?2"),
            params![parent, name],
            row_from,
        )
        .optional()?)
}

/// Loads a node by id.
pub fn fetch(conn: &Connection, id: NodeId) -> FsResult<NodeRow> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM tree_node WHERE id = ?1"),
        params![id],
        row_from,
    )
    .optional()?
    .ok_or(FsError::NotFound)
}

/// Binds `name` under `parent` to `inode`. A duplicate `(parent, name)`
/// surfaces as [`FsError::Exists`] through the unique constraint.
pub fn create(
    conn: &Connection,
    parent: Option<NodeId>,
    name: &str,
    inode: InodeId,
) -> FsResult<NodeRow> {
    conn.execute(
        "INSERT INTO tree_node (parent_id, name, inode_id) VALUES (?1, ?2, ?3)",
        params![parent, name, inode],
    )?;
    Ok(NodeRow {
        id: NodeId(conn.last_insert_rowid()),
        parent,
        name: name.to_string(),
        inode,
    })
}

/// Deletes one name binding and destroys its inode if that was the last
/// reference and no handle holds it open.
///
/// Children of a deleted directory node (its `.` and `..` rows) go through
/// the parent cascade.
pub fn remove(conn: &Connection, node: &NodeRow) -> FsResult<()> {
    conn.execute("DELETE FROM tree_node WHERE id = ?1", params![node.id])?;
    inode::try_destroy(conn, node.inode)?;
    Ok(())
}

/// Moves a node to `(new_parent, new_name)` in one statement; renames in
/// place when only the name differs. Target collisions surface as
/// [`FsError::Exists`].
pub fn relocate(
    conn: &Connection,
    id: NodeId,
    new_parent: NodeId,
    new_name: &str,
) -> FsResult<()> {
    conn.execute(
        "UPDATE tree_node SET parent_id = ?2, name = ?3 WHERE id = ?1",
        params![id, new_parent, new_name],
    )?;
    Ok(())
}

/// Repoints a directory's `..` entry at `inode`. Used when a rename gives
/// the directory a new parent.
pub fn retarget_dotdot(conn: &Connection, dir: NodeId, inode: InodeId) -> FsResult<()> {
    conn.execute(
        "UPDATE tree_node SET inode_id = ?2 WHERE parent_id = ?1 AND name = '..'",
        params![dir, inode],
    )?;
    Ok(())
}

/// Lists the entries of a directory in insertion (rowid) order, `.` and `..`
/// included.
pub fn entries(conn: &Connection, parent: NodeId) -> FsResult<Vec<DirEntryRow>> {
    let mut stmt = conn.prepare(
        "SELECT n.name, n.inode_id, i.mode
         FROM tree_node n JOIN inode i ON i.id = n.inode_id
         WHERE n.parent_id = ?1
         ORDER BY n.id",
    )?;
    let rows = stmt.query_map(params![parent], |row| {
        Ok(DirEntryRow {
            name: row.get(0)?,
            inode: row.get(1)?,
            mode: row.get(2)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Whether the directory holds any entry besides `.` and `..`.
pub fn has_real_entries(conn: &Connection, parent: NodeId) -> FsResult<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS (
            SELECT 1 FROM tree_node
            WHERE parent_id = ?1 AND name NOT IN ('.', '..')
         )",
        params![parent],
        |row| row.get(0),
    )?;
    Ok(found)
}
