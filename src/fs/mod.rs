//! Filesystem core: path resolution and the operation dispatcher.
//!
//! [`DbFs`] is the outward face of the filesystem. Each operation resolves
//! its path(s) against the tree, performs the permission checks the POSIX
//! table demands, and either mutates metadata inside a single database
//! transaction or hands off to the per-handle open-file engine. Errors leave
//! here as [`FsError`] values; the bridge turns them into negative errnos.
//!
//! The resolver walks absolute `/`-separated paths from the volume root (the
//! tree-node with a NULL parent carrying the volume's name), consulting the
//! `(parent, name)` index per component and requiring execute permission on
//! every intermediate directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use nix::unistd::{getegid, geteuid};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;

use crate::config::FsConfig;
use crate::errors::{FsError, FsResult};
use crate::store::inode::{self, unix_now, FileStat};
use crate::store::tree::{self, DirEntryRow, NodeRow};
use crate::store::{InodeId, NodeId, Store};

pub mod access;
pub mod bridge;
pub mod file;

use file::OpenFile;

/// Identity of the process calling into the filesystem, as supplied by the
/// kernel bridge with every request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// Splits an absolute path into its parent directory and final component.
fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => ("/", path),
    }
}

/// The database filesystem: one mounted volume.
pub struct DbFs {
    store: Store,
    cfg: FsConfig,
    volume: String,
    files: RwLock<HashMap<u64, Mutex<OpenFile>>>,
    next_fh: AtomicU64,
}

impl DbFs {
    /// Mounts `volume` on `store`, creating its root directory (with `.` and
    /// `..` self-entries, owned by the mounting process, mode
    /// `0777 & !umask`) if this is the volume's first mount.
    pub fn mount(store: Store, cfg: FsConfig, volume: &str) -> FsResult<Self> {
        // reading the umask means setting it, twice
        let umask = unsafe { libc::umask(0) };
        unsafe { libc::umask(umask) };

        let fs = Self {
            store,
            cfg,
            volume: volume.to_string(),
            files: RwLock::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        };
        fs.ensure_root(umask as u32)?;
        info!(
            "mounted volume {} (block size {} bytes, read-ahead {})",
            volume,
            cfg.block_size(),
            cfg.blocks_read_ahead
        );
        Ok(fs)
    }

    /// The volume this instance serves.
    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// The block geometry this instance runs with.
    pub fn config(&self) -> FsConfig {
        self.cfg
    }

    fn ensure_root(&self, umask: u32) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        if tree::lookup_root(&tx, &self.volume)?.is_none() {
            let now = unix_now();
            let root_ino = inode::create(
                &tx,
                libc::S_IFDIR | (0o777 & !umask),
                geteuid().as_raw(),
                getegid().as_raw(),
                now,
            )?;
            let root = tree::create(&tx, None, &self.volume, root_ino.id)?;
            tree::create(&tx, Some(root.id), ".", root_ino.id)?;
            tree::create(&tx, Some(root.id), "..", root_ino.id)?;
            debug!("created root of volume {}", self.volume);
        }
        tx.commit()?;
        Ok(())
    }

    // Helpers
    // =======

    /// Walks `path` from the volume root. Every intermediate directory must
    /// grant execute to the caller; the final component's permission is the
    /// calling operation's business.
    fn resolve(&self, conn: &Connection, path: &str, ctx: &Context) -> FsResult<NodeRow> {
        let mut node = tree::lookup_root(conn, &self.volume)?.ok_or(FsError::NotFound)?;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let dir = inode::fetch(conn, node.inode)?;
            access::check(&dir, access::EXEC, ctx)?;
            node = tree::lookup_child(conn, node.id, part)?.ok_or(FsError::NotFound)?;
        }
        Ok(node)
    }

    /// Requires a permission on the inode of a resolved node's parent.
    fn check_parent(
        &self,
        conn: &Connection,
        node: &NodeRow,
        required: u32,
        ctx: &Context,
    ) -> FsResult<NodeId> {
        // the volume root has no parent to check against
        let parent = node.parent.ok_or(FsError::Access)?;
        let parent_inode = inode::fetch(conn, tree::fetch(conn, parent)?.inode)?;
        access::check(&parent_inode, required, ctx)?;
        Ok(parent)
    }

    /// Creates an inode owned by the caller and binds it under `parent`,
    /// which must grant write and execute.
    fn create_node(
        &self,
        conn: &Connection,
        parent: &NodeRow,
        name: &str,
        mode: u32,
        ctx: &Context,
    ) -> FsResult<NodeRow> {
        let dir = inode::fetch(conn, parent.inode)?;
        access::check(&dir, access::EXEC | access::WRITE, ctx)?;
        let ino = inode::create(conn, mode, ctx.uid, ctx.gid, unix_now())?;
        tree::create(conn, Some(parent.id), name, ino.id)
    }

    /// Binds an additional name to an existing inode and bumps its change
    /// time.
    fn link_node(
        &self,
        conn: &Connection,
        parent: NodeId,
        name: &str,
        ino: InodeId,
    ) -> FsResult<NodeRow> {
        let node = tree::create(conn, Some(parent), name, ino)?;
        inode::update_times(conn, ino, None, None, unix_now())?;
        Ok(node)
    }

    fn register(&self, file: OpenFile) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.files.write().insert(fh, Mutex::new(file));
        fh
    }

    fn with_file<T>(&self, fh: u64, op: impl FnOnce(&mut OpenFile) -> FsResult<T>) -> FsResult<T> {
        let files = self.files.read();
        let file = files.get(&fh).ok_or(FsError::NotFound)?;
        let result = op(&mut file.lock());
        result
    }

    // Filesystem operations
    // =====================

    /// Checks that the caller may access `path` with `mask` permission.
    pub fn access(&self, path: &str, mask: u32, ctx: &Context) -> FsResult<()> {
        let conn = self.store.conn();
        let node = self.resolve(&conn, path, ctx)?;
        access::check(&inode::fetch(&conn, node.inode)?, mask, ctx)
    }

    /// Sets the mode bits. Only the owner or the superuser may.
    pub fn chmod(&self, path: &str, mode: u32, ctx: &Context) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let node = self.resolve(&tx, path, ctx)?;
        let ino = inode::fetch(&tx, node.inode)?;
        if ctx.uid != 0 && ctx.uid != ino.uid {
            return Err(FsError::Access);
        }
        inode::update_mode(&tx, ino.id, mode, unix_now())?;
        tx.commit()?;
        Ok(())
    }

    /// Changes ownership; `None` leaves a field alone. Superuser only.
    pub fn chown(
        &self,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
        ctx: &Context,
    ) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let node = self.resolve(&tx, path, ctx)?;
        if ctx.uid != 0 {
            return Err(FsError::Access);
        }
        inode::update_owner(&tx, node.inode, uid, gid, unix_now())?;
        tx.commit()?;
        Ok(())
    }

    /// The stat projection of `path`. Requires read on the parent
    /// directory (the root has none and is always statable).
    pub fn getattr(&self, path: &str, ctx: &Context) -> FsResult<FileStat> {
        let conn = self.store.conn();
        let node = self.resolve(&conn, path, ctx)?;
        if let Some(parent) = node.parent {
            let parent_inode = inode::fetch(&conn, tree::fetch(&conn, parent)?.inode)?;
            access::check(&parent_inode, access::READ, ctx)?;
        }
        inode::stat(&conn, node.inode)
    }

    /// Lists a directory in insertion order, `.` and `..` included.
    /// Requires read on the directory.
    pub fn readdir(&self, path: &str, ctx: &Context) -> FsResult<Vec<DirEntryRow>> {
        let conn = self.store.conn();
        let node = self.resolve(&conn, path, ctx)?;
        access::check(&inode::fetch(&conn, node.inode)?, access::READ, ctx)?;
        tree::entries(&conn, node.id)
    }

    /// Reads the target a symlink points at: the single-block content of
    /// its inode.
    pub fn readlink(&self, path: &str, ctx: &Context) -> FsResult<Vec<u8>> {
        let conn = self.store.conn();
        let node = self.resolve(&conn, path, ctx)?;
        let row = inode::fetch(&conn, node.inode)?;
        access::check(&row, access::READ, ctx)?;
        let mut file = OpenFile::open(&conn, row, libc::O_RDONLY, self.cfg)?;
        let data = file.read(&conn, self.cfg.block_size() as usize);
        let closed = file.close(&conn);
        closed?;
        data
    }

    /// Creates a file inode and its name in one transaction.
    pub fn mknod(&self, path: &str, mode: u32, ctx: &Context) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let (dir, name) = split_path(path);
        let parent = self.resolve(&tx, dir, ctx)?;
        self.create_node(&tx, &parent, name, mode, ctx)?;
        tx.commit()?;
        debug!("mknod {path} mode {mode:o}");
        Ok(())
    }

    /// Creates a directory with its `.` and `..` entries.
    pub fn mkdir(&self, path: &str, mode: u32, ctx: &Context) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let (dir, name) = split_path(path);
        let parent = self.resolve(&tx, dir, ctx)?;
        let node = self.create_node(&tx, &parent, name, libc::S_IFDIR | mode, ctx)?;
        self.link_node(&tx, node.id, ".", node.inode)?;
        self.link_node(&tx, node.id, "..", parent.inode)?;
        tx.commit()?;
        debug!("mkdir {path} mode {mode:o}");
        Ok(())
    }

    /// Removes an empty directory. Requires write on the parent.
    pub fn rmdir(&self, path: &str, ctx: &Context) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let node = self.resolve(&tx, path, ctx)?;
        self.check_parent(&tx, &node, access::WRITE, ctx)?;
        if tree::has_real_entries(&tx, node.id)? {
            return Err(FsError::NotEmpty);
        }
        tree::remove(&tx, &node)?;
        tx.commit()?;
        debug!("rmdir {path}");
        Ok(())
    }

    /// Removes one name. The inode goes with it only when this was its last
    /// name and no handle holds it open.
    pub fn unlink(&self, path: &str, ctx: &Context) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let node = self.resolve(&tx, path, ctx)?;
        self.check_parent(&tx, &node, access::WRITE, ctx)?;
        tree::remove(&tx, &node)?;
        tx.commit()?;
        debug!("unlink {path}");
        Ok(())
    }

    /// Creates a symlink at `linkpath` whose content is `target`.
    pub fn symlink(&self, target: &str, linkpath: &str, ctx: &Context) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let (dir, name) = split_path(linkpath);
        let parent = self.resolve(&tx, dir, ctx)?;
        let node = self.create_node(&tx, &parent, name, libc::S_IFLNK | 0o777, ctx)?;
        let row = inode::fetch(&tx, node.inode)?;
        let mut file = OpenFile::open(&tx, row, libc::O_WRONLY, self.cfg)?;
        let written = file
            .write(&tx, target.as_bytes())
            .and_then(|_| file.flush(&tx));
        let closed = file.close(&tx);
        written?;
        closed?;
        tx.commit()?;
        debug!("symlink {linkpath} -> {target}");
        Ok(())
    }

    /// Relocates a name. A bare rename stays in place; moving across
    /// directories updates both parents' mtimes and, for a directory,
    /// repoints its `..` entry.
    pub fn rename(&self, old: &str, new: &str, ctx: &Context) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let node = self.resolve(&tx, old, ctx)?;
        let old_parent = self.check_parent(&tx, &node, access::WRITE, ctx)?;

        let (new_dir, new_name) = split_path(new);
        let new_parent = self.resolve(&tx, new_dir, ctx)?;
        let now = unix_now();

        if new_parent.id != old_parent {
            access::check(&inode::fetch(&tx, new_parent.inode)?, access::WRITE, ctx)?;
        }
        tree::relocate(&tx, node.id, new_parent.id, new_name)?;
        let old_parent_inode = tree::fetch(&tx, old_parent)?.inode;
        inode::update_times(&tx, old_parent_inode, None, Some(now), now)?;
        if new_parent.id != old_parent {
            if inode::fetch(&tx, node.inode)?.is_dir() {
                tree::retarget_dotdot(&tx, node.id, new_parent.inode)?;
            }
            inode::update_times(&tx, new_parent.inode, None, Some(now), now)?;
        }
        tx.commit()?;
        debug!("rename {old} -> {new}");
        Ok(())
    }

    /// Adds a hard link at `newpath` to the inode behind `existing`.
    pub fn link(&self, newpath: &str, existing: &str, ctx: &Context) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let (dir, name) = split_path(newpath);
        let parent = self.resolve(&tx, dir, ctx)?;
        access::check(&inode::fetch(&tx, parent.inode)?, access::WRITE, ctx)?;
        let source = self.resolve(&tx, existing, ctx)?;
        self.link_node(&tx, parent.id, name, source.inode)?;
        tx.commit()?;
        debug!("link {newpath} -> {existing}");
        Ok(())
    }

    /// Sets access and modification times (now, when `times` is `None`).
    /// Requires write on the inode.
    pub fn utimens(&self, path: &str, times: Option<(i64, i64)>, ctx: &Context) -> FsResult<()> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let node = self.resolve(&tx, path, ctx)?;
        access::check(&inode::fetch(&tx, node.inode)?, access::WRITE, ctx)?;
        let now = unix_now();
        let (atime, mtime) = times.unwrap_or((now, now));
        inode::update_times(&tx, node.inode, Some(atime), Some(mtime), now)?;
        tx.commit()?;
        Ok(())
    }

    // File operations
    // ===============

    /// Creates a file and opens it for writing, all in one transaction,
    /// returning the handle.
    pub fn create(&self, path: &str, mode: u32, ctx: &Context) -> FsResult<u64> {
        let file = {
            let mut conn = self.store.conn();
            let tx = conn.transaction()?;
            let (dir, name) = split_path(path);
            let parent = self.resolve(&tx, dir, ctx)?;
            let node = self.create_node(&tx, &parent, name, mode, ctx)?;
            let row = inode::fetch(&tx, node.inode)?;
            access::check(&row, access::WRITE, ctx)?;
            let file = OpenFile::open(&tx, row, libc::O_WRONLY, self.cfg)?;
            tx.commit()?;
            file
        };
        let fh = self.register(file);
        debug!("create {path} mode {mode:o} -> fh {fh}");
        Ok(fh)
    }

    /// Opens `path` with `flags`, checking read/write permission as the
    /// access mode demands, and returns a never-recycled handle id.
    pub fn open(&self, path: &str, flags: i32, ctx: &Context) -> FsResult<u64> {
        let file = {
            let conn = self.store.conn();
            let node = self.resolve(&conn, path, ctx)?;
            let row = inode::fetch(&conn, node.inode)?;
            let required = match flags & libc::O_ACCMODE {
                libc::O_RDONLY => access::READ,
                libc::O_WRONLY => access::WRITE,
                _ => access::READ | access::WRITE,
            };
            access::check(&row, required, ctx)?;
            OpenFile::open(&conn, row, flags, self.cfg)?
        };
        let fh = self.register(file);
        debug!("open {path} flags {flags:#x} -> fh {fh}");
        Ok(fh)
    }

    /// Opens a directory handle. Requires execute on the directory.
    pub fn opendir(&self, path: &str, ctx: &Context) -> FsResult<u64> {
        let file = {
            let conn = self.store.conn();
            let node = self.resolve(&conn, path, ctx)?;
            let row = inode::fetch(&conn, node.inode)?;
            access::check(&row, access::EXEC, ctx)?;
            OpenFile::open(&conn, row, libc::O_RDONLY, self.cfg)?
        };
        Ok(self.register(file))
    }

    /// Reads up to `size` bytes at `offset` on an open handle.
    pub fn read(&self, fh: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        self.with_file(fh, |file| {
            file.seek(offset);
            let conn = self.store.conn();
            file.read(&conn, size)
        })
    }

    /// Writes `data` at `offset` on an open handle, returning the count.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.with_file(fh, |file| {
            file.seek(offset);
            let conn = self.store.conn();
            file.write(&conn, data)
        })
    }

    /// Truncates to `length`, through an existing handle or a transient
    /// write-mode open of `path`.
    pub fn truncate(
        &self,
        path: &str,
        length: u64,
        fh: Option<u64>,
        ctx: &Context,
    ) -> FsResult<()> {
        if let Some(fh) = fh {
            return self.with_file(fh, |file| {
                let mut conn = self.store.conn();
                let tx = conn.transaction()?;
                file.truncate(&tx, length)?;
                tx.commit()?;
                Ok(())
            });
        }
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let node = self.resolve(&tx, path, ctx)?;
        let row = inode::fetch(&tx, node.inode)?;
        access::check(&row, access::WRITE, ctx)?;
        let mut file = OpenFile::open(&tx, row, libc::O_WRONLY, self.cfg)?;
        let truncated = file.truncate(&tx, length);
        let closed = file.close(&tx);
        truncated?;
        closed?;
        tx.commit()?;
        Ok(())
    }

    /// Persists a handle's dirty blocks and size.
    pub fn flush(&self, fh: u64) -> FsResult<()> {
        self.with_file(fh, |file| {
            let mut conn = self.store.conn();
            let tx = conn.transaction()?;
            file.flush(&tx)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// `fsync` is a flush here: the database is the durability boundary.
    pub fn fsync(&self, fh: u64) -> FsResult<()> {
        self.flush(fh)
    }

    /// Drops a handle. Unflushed writes are lost; the in-use counter falls
    /// and an orphaned inode self-destructs.
    pub fn release(&self, fh: u64) -> FsResult<()> {
        let file = self.files.write().remove(&fh).ok_or(FsError::NotFound)?;
        let mut file = file.into_inner();
        let conn = self.store.conn();
        file.close(&conn)
    }

    /// Directory handles release the same way file handles do.
    pub fn releasedir(&self, fh: u64) -> FsResult<()> {
        self.release(fh)
    }

    /// Unmount: closes every handle that is still open.
    pub fn destroy(&self) {
        let mut files = self.files.write();
        let conn = self.store.conn();
        for (fh, file) in files.drain() {
            if let Err(err) = file.into_inner().close(&conn) {
                warn!("closing leaked handle {fh} at unmount: {err}");
            }
        }
        info!("unmounted volume {}", self.volume);
    }
}
