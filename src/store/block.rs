//! Block row operations.
//!
//! A block is one fixed-size slice of an inode's byte content, keyed by
//! `(inode_id, sequence)`. Payloads may be shorter than the configured block
//! size (the tail of a block that was never written reads as zeros), and
//! sequence numbers need not be contiguous: a missing row is a sparse hole.

use rusqlite::{params, Connection};

use crate::errors::FsResult;

use super::InodeId;

/// One block of an inode, possibly not yet persisted.
///
/// `id` is the row's persistent identity: `None` until the first save, which
/// is what decides between INSERT and UPDATE at flush time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRow {
    pub id: Option<i64>,
    pub inode: InodeId,
    pub sequence: u64,
    pub data: Vec<u8>,
}

impl BlockRow {
    /// A fresh, empty block that exists only in memory.
    pub fn new(inode: InodeId, sequence: u64) -> Self {
        Self {
            id: None,
            inode,
            sequence,
            data: Vec::new(),
        }
    }
}

/// Fetches the stored blocks of `inode` with sequence in
/// `[first, first + count)`, in sequence order.
///
/// Only rows that exist come back; holes stay holes.
pub fn load_range(
    conn: &Connection,
    inode: InodeId,
    first: u64,
    count: u64,
) -> FsResult<Vec<BlockRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, sequence, data FROM block
         WHERE inode_id = ?1 AND sequence >= ?2 AND sequence < ?3
         ORDER BY sequence",
    )?;
    let rows = stmt.query_map(
        params![inode, first as i64, (first + count) as i64],
        |row| {
            Ok(BlockRow {
                id: Some(row.get(0)?),
                inode,
                sequence: row.get::<_, i64>(1)? as u64,
                data: row.get(2)?,
            })
        },
    )?;
    let mut blocks = Vec::new();
    for row in rows {
        blocks.push(row?);
    }
    Ok(blocks)
}

/// Persists a block: INSERT when it has no row identity yet, UPDATE when it
/// does. On insert the assigned identity is written back into the block.
pub fn save(conn: &Connection, block: &mut BlockRow) -> FsResult<()> {
    match block.id {
        Some(id) => {
            conn.execute(
                "UPDATE block SET data = ?2 WHERE id = ?1",
                params![id, block.data],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO block (inode_id, sequence, data) VALUES (?1, ?2, ?3)",
                params![block.inode, block.sequence as i64, block.data],
            )?;
            block.id = Some(conn.last_insert_rowid());
        }
    }
    Ok(())
}

/// Removes every stored block of `inode` past `last_keep` (all of them when
/// `last_keep` is `None`). Used by truncate so a later re-growth cannot
/// resurrect stale payloads.
pub fn remove_past(conn: &Connection, inode: InodeId, last_keep: Option<u64>) -> FsResult<()> {
    match last_keep {
        Some(last) => {
            conn.execute(
                "DELETE FROM block WHERE inode_id = ?1 AND sequence > ?2",
                params![inode, last as i64],
            )?;
        }
        None => {
            conn.execute("DELETE FROM block WHERE inode_id = ?1", params![inode])?;
        }
    }
    Ok(())
}

/// Trims the stored payload of one block down to `keep` bytes, if it is
/// longer. The boundary block of a truncate ends here.
pub fn trim(conn: &Connection, inode: InodeId, sequence: u64, keep: usize) -> FsResult<()> {
    conn.execute(
        "UPDATE block SET data = substr(data, 1, ?3)
         WHERE inode_id = ?1 AND sequence = ?2 AND length(data) > ?3",
        params![inode, sequence as i64, keep as i64],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{inode, Store};

    fn store_with_inode() -> (Store, InodeId) {
        let store = Store::open_in_memory().unwrap();
        let id = {
            let conn = store.conn();
            inode::create(&conn, libc::S_IFREG | 0o644, 0, 0, 1).unwrap().id
        };
        (store, id)
    }

    #[test]
    fn save_assigns_identity_once() {
        let (store, ino) = store_with_inode();
        let conn = store.conn();

        let mut block = BlockRow::new(ino, 0);
        block.data = b"abc".to_vec();
        save(&conn, &mut block).unwrap();
        let first_id = block.id.expect("insert must assign an id");

        block.data = b"abcdef".to_vec();
        save(&conn, &mut block).unwrap();
        assert_eq!(block.id, Some(first_id), "update must keep the id");

        let stored = load_range(&conn, ino, 0, 1).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].data, b"abcdef");
    }

    #[test]
    fn duplicate_sequence_rejected() {
        let (store, ino) = store_with_inode();
        let conn = store.conn();
        let mut a = BlockRow::new(ino, 3);
        save(&conn, &mut a).unwrap();
        let mut b = BlockRow::new(ino, 3);
        assert!(save(&conn, &mut b).is_err());
    }

    #[test]
    fn range_scan_skips_holes() {
        let (store, ino) = store_with_inode();
        let conn = store.conn();
        for seq in [0u64, 2, 5, 11] {
            let mut block = BlockRow::new(ino, seq);
            block.data = vec![seq as u8];
            save(&conn, &mut block).unwrap();
        }
        let got = load_range(&conn, ino, 1, 10).unwrap();
        let sequences: Vec<u64> = got.iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![2, 5]);
    }

    #[test]
    fn remove_and_trim_for_truncate() {
        let (store, ino) = store_with_inode();
        let conn = store.conn();
        for seq in 0u64..4 {
            let mut block = BlockRow::new(ino, seq);
            block.data = vec![0xAA; 8];
            save(&conn, &mut block).unwrap();
        }

        remove_past(&conn, ino, Some(1)).unwrap();
        trim(&conn, ino, 1, 3).unwrap();

        let got = load_range(&conn, ino, 0, 10).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data.len(), 8);
        assert_eq!(got[1].data.len(), 3);

        remove_past(&conn, ino, None).unwrap();
        assert!(load_range(&conn, ino, 0, 10).unwrap().is_empty());
    }
}
