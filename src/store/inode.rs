//! Inode row operations.
//!
//! An inode is a file object independent of any name: mode bits, ownership,
//! whole-second timestamps, byte size and the in-use handle counter. All
//! mutations here are partial-field updates issued as a single SQL statement,
//! so two concurrent operations touching different fields (say `chmod` and
//! `chown`) never clobber each other, and the counter arithmetic stays atomic
//! under concurrent opens.
//!
//! Lifetime: an inode is destroyed exactly when no tree-node names it and no
//! handle holds it open. [`try_destroy`] evaluates that predicate inside the
//! delete statement itself rather than reading first, which is what makes
//! removing the last name of a still-open file safe.

use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{FsError, FsResult};

use super::InodeId;

/// Current time as a whole-second Unix timestamp.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One row of the `inode` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeRow {
    pub id: InodeId,
    pub inuse: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
}

impl InodeRow {
    /// Whether the mode carries the directory file-type bits.
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Whether the mode carries the symlink file-type bits.
    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// POSIX `struct stat` projection of an inode.
///
/// `nlink` counts the tree-nodes referencing the inode. The atime slot
/// deliberately reports the change time: the behavior is inherited and
/// callers depend on nothing finer (the `atime` column itself is still
/// maintained by `update_times`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub ino: InodeId,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
    pub nlink: u32,
}

fn row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<InodeRow> {
    Ok(InodeRow {
        id: row.get(0)?,
        inuse: row.get(1)?,
        mode: row.get(2)?,
        uid: row.get(3)?,
        gid: row.get(4)?,
        atime: row.get(5)?,
        mtime: row.get(6)?,
        ctime: row.get(7)?,
        size: row.get::<_, i64>(8)?.max(0) as u64,
    })
}

const COLUMNS: &str = "id, inuse, mode, uid, gid, atime, mtime, ctime, size";

/// Inserts a fresh inode; all three timestamps start at `now`.
pub fn create(conn: &Connection, mode: u32, uid: u32, gid: u32, now: i64) -> FsResult<InodeRow> {
    conn.execute(
        "INSERT INTO inode (mode, uid, gid, atime, mtime, ctime) VALUES (?1, ?2, ?3, ?4, ?4, ?4)",
        params![mode, uid, gid, now],
    )?;
    fetch(conn, InodeId(conn.last_insert_rowid()))
}

/// Loads an inode row, failing with `ENOENT` when it does not exist.
pub fn fetch(conn: &Connection, id: InodeId) -> FsResult<InodeRow> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM inode WHERE id = ?1"),
        params![id],
        row_from,
    )
    .optional()?
    .ok_or(FsError::NotFound)
}

/// Sets the mode bits and the change time.
pub fn update_mode(conn: &Connection, id: InodeId, mode: u32, now: i64) -> FsResult<()> {
    conn.execute(
        "UPDATE inode SET mode = ?2, ctime = ?3 WHERE id = ?1",
        params![id, mode, now],
    )?;
    Ok(())
}

/// Sets whichever of `uid` / `gid` is supplied, and the change time.
pub fn update_owner(
    conn: &Connection,
    id: InodeId,
    uid: Option<u32>,
    gid: Option<u32>,
    now: i64,
) -> FsResult<()> {
    conn.execute(
        "UPDATE inode SET uid = COALESCE(?2, uid), gid = COALESCE(?3, gid), ctime = ?4
         WHERE id = ?1",
        params![id, uid, gid, now],
    )?;
    Ok(())
}

/// Sets whichever of `atime` / `mtime` is supplied, and the change time.
pub fn update_times(
    conn: &Connection,
    id: InodeId,
    atime: Option<i64>,
    mtime: Option<i64>,
    now: i64,
) -> FsResult<()> {
    conn.execute(
        "UPDATE inode SET atime = COALESCE(?2, atime), mtime = COALESCE(?3, mtime), ctime = ?4
         WHERE id = ?1",
        params![id, atime, mtime, now],
    )?;
    Ok(())
}

/// Sets the size, modification time and change time.
pub fn update_size(conn: &Connection, id: InodeId, size: u64, now: i64) -> FsResult<()> {
    conn.execute(
        "UPDATE inode SET size = ?2, mtime = ?3, ctime = ?3 WHERE id = ?1",
        params![id, size as i64, now],
    )?;
    Ok(())
}

/// Bumps the open-handle counter with a relative update.
pub fn inuse_increment(conn: &Connection, id: InodeId) -> FsResult<()> {
    conn.execute(
        "UPDATE inode SET inuse = inuse + 1 WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

/// Drops the open-handle counter and destroys the inode if it became
/// orphaned (no names, no handles).
pub fn inuse_decrement(conn: &Connection, id: InodeId) -> FsResult<()> {
    conn.execute(
        "UPDATE inode SET inuse = inuse - 1 WHERE id = ?1",
        params![id],
    )?;
    try_destroy(conn, id)?;
    Ok(())
}

/// Deletes the inode if and only if nothing references it.
///
/// The predicate is part of the delete statement, so the check and the
/// removal are one atomic step; blocks go with it through the cascade.
/// Returns whether a row was actually removed.
pub fn try_destroy(conn: &Connection, id: InodeId) -> FsResult<bool> {
    let removed = conn.execute(
        "DELETE FROM inode
         WHERE id = ?1
           AND inuse = 0
           AND NOT EXISTS (SELECT 1 FROM tree_node WHERE inode_id = ?1)",
        params![id],
    )?;
    Ok(removed > 0)
}

/// Number of tree-nodes naming this inode.
pub fn link_count(conn: &Connection, id: InodeId) -> FsResult<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tree_node WHERE inode_id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

/// The `stat` projection of an inode.
pub fn stat(conn: &Connection, id: InodeId) -> FsResult<FileStat> {
    let row = fetch(conn, id)?;
    Ok(FileStat {
        ino: row.id,
        mode: row.mode,
        uid: row.uid,
        gid: row.gid,
        // inherited quirk, see the FileStat docs
        atime: row.ctime,
        mtime: row.mtime,
        ctime: row.ctime,
        size: row.size,
        nlink: link_count(conn, id)?,
    })
}
