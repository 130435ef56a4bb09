//! Open-file engine.
//!
//! An [`OpenFile`] is the per-handle byte-stream view over an inode's
//! blocks: a cursor, a block cache filled by read-ahead, and a dirty set of
//! blocks awaiting flush. Nothing here is shared between handles: two
//! handles on the same inode each carry their own cache.
//!
//! Writes only touch the database at flush time; until then the new size
//! lives in the in-memory inode copy. Close never flushes: callers pair
//! `flush` with `release` the way the kernel does, and unflushed writes on a
//! bare close are lost.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;

use crate::config::FsConfig;
use crate::errors::{FsError, FsResult};
use crate::store::block::{self, BlockRow};
use crate::store::inode::{self, unix_now, InodeRow};

/// Ephemeral state of one open handle.
pub struct OpenFile {
    inode: InodeRow,
    flags: i32,
    offset: u64,
    cfg: FsConfig,
    blocks: HashMap<u64, BlockRow>,
    dirty: HashSet<u64>,
}

impl OpenFile {
    /// Opens a handle on `inode`, bumping its in-use counter. With
    /// `O_APPEND` the cursor starts at the current size, otherwise at zero.
    pub fn open(conn: &Connection, inode: InodeRow, flags: i32, cfg: FsConfig) -> FsResult<Self> {
        inode::inuse_increment(conn, inode.id)?;
        let offset = if flags & libc::O_APPEND != 0 {
            inode.size
        } else {
            0
        };
        Ok(Self {
            inode,
            flags,
            offset,
            cfg,
            blocks: HashMap::new(),
            dirty: HashSet::new(),
        })
    }

    /// The inode this handle is open on.
    pub fn inode(&self) -> &InodeRow {
        &self.inode
    }

    fn accmode(&self) -> i32 {
        self.flags & libc::O_ACCMODE
    }

    /// Moves the cursor.
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Returns the cached block for `sequence`, pulling it (and up to
    /// `blocks_read_ahead` successors that exist in storage) on a miss.
    /// A block absent from storage materializes as an empty in-memory row.
    fn block_at(&mut self, conn: &Connection, sequence: u64) -> FsResult<&mut BlockRow> {
        if !self.blocks.contains_key(&sequence) {
            for loaded in
                block::load_range(conn, self.inode.id, sequence, self.cfg.blocks_read_ahead)?
            {
                self.blocks.entry(loaded.sequence).or_insert(loaded);
            }
        }
        let inode_id = self.inode.id;
        Ok(self
            .blocks
            .entry(sequence)
            .or_insert_with(|| BlockRow::new(inode_id, sequence)))
    }

    /// Reads up to `length` bytes at the cursor, clamped to the file size.
    ///
    /// Assembled block by block; stored payloads shorter than the requested
    /// slice are zero-padded, and wholly missing blocks read as zeros. The
    /// cursor advances by the returned byte count.
    pub fn read(&mut self, conn: &Connection, length: usize) -> FsResult<Vec<u8>> {
        if self.accmode() == libc::O_WRONLY {
            return Err(FsError::Access);
        }
        let mut remaining = (length as u64).min(self.inode.size.saturating_sub(self.offset));
        let mut data = Vec::with_capacity(remaining as usize);
        while remaining > 0 {
            let in_block = self.cfg.offset_in_block(self.offset) as usize;
            let take = remaining.min(self.cfg.block_size() - in_block as u64) as usize;
            let sequence = self.cfg.block_of(self.offset);

            let payload = &self.block_at(conn, sequence)?.data;
            let end = (in_block + take).min(payload.len());
            let copied = end.saturating_sub(in_block);
            if copied > 0 {
                data.extend_from_slice(&payload[in_block..end]);
            }
            data.resize(data.len() + (take - copied), 0);

            self.offset += take as u64;
            remaining -= take as u64;
        }
        Ok(data)
    }

    /// Writes `buf` at the cursor, block by block.
    ///
    /// Bytes between the stored payload's end and the write position are
    /// zero-filled so a partial-block write always leaves a well-defined
    /// payload. Touched blocks join the dirty set; the size grows in memory
    /// only, until the next flush persists it.
    pub fn write(&mut self, conn: &Connection, buf: &[u8]) -> FsResult<usize> {
        if self.accmode() == libc::O_RDONLY {
            return Err(FsError::Access);
        }
        let total = buf.len();
        let mut buf = buf;
        while !buf.is_empty() {
            let in_block = self.cfg.offset_in_block(self.offset) as usize;
            let take = buf.len().min((self.cfg.block_size() as usize) - in_block);
            let sequence = self.cfg.block_of(self.offset);

            let blk = self.block_at(conn, sequence)?;
            if blk.data.len() < in_block + take {
                blk.data.resize(in_block + take, 0);
            }
            blk.data[in_block..in_block + take].copy_from_slice(&buf[..take]);
            self.dirty.insert(sequence);

            buf = &buf[take..];
            self.offset += take as u64;
            self.inode.size = self.inode.size.max(self.offset);
        }
        Ok(total)
    }

    /// Persists every dirty block and then the size/mtime/ctime.
    ///
    /// A clean handle flushes without touching the database. On failure the
    /// dirty set is left intact so a retry can finish the job.
    pub fn flush(&mut self, conn: &Connection) -> FsResult<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let mut sequences: Vec<u64> = self.dirty.iter().copied().collect();
        sequences.sort_unstable();
        for sequence in sequences {
            if let Some(blk) = self.blocks.get_mut(&sequence) {
                block::save(conn, blk)?;
            }
        }
        inode::update_size(conn, self.inode.id, self.inode.size, unix_now())?;
        self.dirty.clear();
        Ok(())
    }

    /// Sets the file size to `length` and persists it, dropping stored and
    /// cached payload past the new end so a later re-growth reads zeros
    /// there.
    pub fn truncate(&mut self, conn: &Connection, length: u64) -> FsResult<()> {
        if self.accmode() == libc::O_RDONLY {
            return Err(FsError::Access);
        }
        self.inode.size = length;
        inode::update_size(conn, self.inode.id, length, unix_now())?;

        if length == 0 {
            block::remove_past(conn, self.inode.id, None)?;
            self.blocks.clear();
            self.dirty.clear();
            return Ok(());
        }

        let last = self.cfg.block_of(length - 1);
        let keep = (length - (last << self.cfg.block_bits)) as usize;
        block::remove_past(conn, self.inode.id, Some(last))?;
        block::trim(conn, self.inode.id, last, keep)?;

        self.blocks.retain(|&sequence, _| sequence <= last);
        self.dirty.retain(|&sequence| sequence <= last);
        if let Some(blk) = self.blocks.get_mut(&last) {
            blk.data.truncate(keep);
        }
        Ok(())
    }

    /// Releases the handle: drops the in-use counter, destroying the inode
    /// if it was orphaned. Does not flush.
    pub fn close(&mut self, conn: &Connection) -> FsResult<()> {
        inode::inuse_decrement(conn, self.inode.id)
    }
}
