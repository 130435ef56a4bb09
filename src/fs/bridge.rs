//! Kernel bridge: adapts the dispatcher to the FUSE session.
//!
//! The kernel speaks in inode numbers; the dispatcher speaks in absolute
//! paths. [`FuseBridge`] sits between them, remembering the path behind each
//! inode number the kernel has looked up and replaying kernel requests as
//! dispatcher calls. Dispatcher errors come back as negative errnos on the
//! reply channel.
//!
//! FUSE insists the root is inode 1, while the volume root's inode carries
//! whatever row id the database handed out; the two numbers are swapped in
//! both directions so neither collides.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use log::warn;

use crate::errors::FsResult;
use crate::store::inode::{unix_now, FileStat};
use crate::store::InodeId;

use super::{Context, DbFs};

const TTL: Duration = Duration::from_secs(1);

/// `fuser::Filesystem` implementation over a [`DbFs`].
pub struct FuseBridge {
    fs: DbFs,
    /// FUSE-facing inode number → absolute path, filled by `lookup`.
    paths: HashMap<u64, String>,
    /// Raw inode id of the volume root, swapped with 1 on the wire.
    root: u64,
}

impl FuseBridge {
    /// Wraps a mounted filesystem for a FUSE session.
    pub fn new(fs: DbFs) -> FsResult<Self> {
        let ctx = Context {
            uid: 0,
            gid: 0,
            pid: 0,
        };
        let root = fs.getattr("/", &ctx)?.ino.0 as u64;
        Ok(Self {
            fs,
            paths: HashMap::new(),
            root,
        })
    }

    fn fuse_ino(&self, ino: InodeId) -> u64 {
        let raw = ino.0 as u64;
        if raw == self.root {
            1
        } else if raw == 1 {
            self.root
        } else {
            raw
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        if ino == 1 {
            return Some("/".to_string());
        }
        self.paths.get(&ino).cloned()
    }

    fn remember(&mut self, ino: u64, path: String) {
        if ino != 1 {
            self.paths.insert(ino, path);
        }
    }

    fn forget_path(&mut self, path: &str) {
        self.paths.retain(|_, p| p != path);
    }

    /// Rewrites tracked paths after a rename: the entry itself and, for a
    /// directory, everything that was looked up beneath it.
    fn rekey(&mut self, old: &str, new: &str) {
        let old_prefix = format!("{old}/");
        for p in self.paths.values_mut() {
            if p == old {
                *p = new.to_string();
            } else if let Some(rest) = p.strip_prefix(&old_prefix) {
                *p = format!("{new}/{rest}");
            }
        }
    }

    fn attr_from(&self, st: &FileStat) -> FileAttr {
        FileAttr {
            ino: self.fuse_ino(st.ino),
            size: st.size,
            blocks: st.size.div_ceil(512),
            atime: system_time(st.atime),
            mtime: system_time(st.mtime),
            ctime: system_time(st.ctime),
            crtime: system_time(st.ctime),
            kind: kind_of(st.mode),
            perm: (st.mode & 0o7777) as u16,
            nlink: st.nlink,
            uid: st.uid,
            gid: st.gid,
            rdev: 0,
            blksize: self.fs.config().block_size().min(u32::MAX as u64) as u32,
            flags: 0,
        }
    }
}

fn ctx_of(req: &Request<'_>) -> Context {
    Context {
        uid: req.uid(),
        gid: req.gid(),
        pid: req.pid(),
    }
}

fn kind_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn system_time(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn time_secs(t: TimeOrNow) -> i64 {
    match t {
        TimeOrNow::SpecificTime(t) => t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
        TimeOrNow::Now => unix_now(),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Applies the caller's umask to the permission bits, keeping the file type.
fn masked(mode: u32, umask: u32) -> u32 {
    (mode & libc::S_IFMT) | (mode & 0o7777 & !umask)
}

impl Filesystem for FuseBridge {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.fs.destroy();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let (Some(parent), Some(name)) = (self.path_of(parent), name.to_str()) else {
            return reply.error(libc::ENOENT);
        };
        let path = join(&parent, name);
        match self.fs.getattr(&path, &ctx_of(req)) {
            Ok(st) => {
                let attr = self.attr_from(&st);
                self.remember(attr.ino, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.getattr(&path, &ctx_of(req)) {
            Ok(st) => reply.attr(&TTL, &self.attr_from(&st)),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        let ctx = ctx_of(req);

        let result = (|| {
            if let Some(mode) = mode {
                self.fs.chmod(&path, mode, &ctx)?;
            }
            if uid.is_some() || gid.is_some() {
                self.fs.chown(&path, uid, gid, &ctx)?;
            }
            if let Some(size) = size {
                self.fs.truncate(&path, size, fh, &ctx)?;
            }
            if atime.is_some() || mtime.is_some() {
                let now = unix_now();
                let atime = atime.map(time_secs).unwrap_or(now);
                let mtime = mtime.map(time_secs).unwrap_or(now);
                self.fs.utimens(&path, Some((atime, mtime)), &ctx)?;
            }
            self.fs.getattr(&path, &ctx)
        })();

        match result {
            Ok(st) => reply.attr(&TTL, &self.attr_from(&st)),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.readlink(&path, &ctx_of(req)) {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let (Some(parent), Some(name)) = (self.path_of(parent), name.to_str()) else {
            return reply.error(libc::ENOENT);
        };
        let path = join(&parent, name);
        let ctx = ctx_of(req);
        match self
            .fs
            .mknod(&path, masked(mode, umask), &ctx)
            .and_then(|_| self.fs.getattr(&path, &ctx))
        {
            Ok(st) => {
                let attr = self.attr_from(&st);
                self.remember(attr.ino, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let (Some(parent), Some(name)) = (self.path_of(parent), name.to_str()) else {
            return reply.error(libc::ENOENT);
        };
        let path = join(&parent, name);
        let ctx = ctx_of(req);
        match self
            .fs
            .mkdir(&path, mode & 0o7777 & !umask, &ctx)
            .and_then(|_| self.fs.getattr(&path, &ctx))
        {
            Ok(st) => {
                let attr = self.attr_from(&st);
                self.remember(attr.ino, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (Some(parent), Some(name)) = (self.path_of(parent), name.to_str()) else {
            return reply.error(libc::ENOENT);
        };
        let path = join(&parent, name);
        match self.fs.unlink(&path, &ctx_of(req)) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (Some(parent), Some(name)) = (self.path_of(parent), name.to_str()) else {
            return reply.error(libc::ENOENT);
        };
        let path = join(&parent, name);
        match self.fs.rmdir(&path, &ctx_of(req)) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (Some(parent), Some(name), Some(target)) =
            (self.path_of(parent), link_name.to_str(), target.to_str())
        else {
            return reply.error(libc::ENOENT);
        };
        let path = join(&parent, name);
        let ctx = ctx_of(req);
        match self
            .fs
            .symlink(target, &path, &ctx)
            .and_then(|_| self.fs.getattr(&path, &ctx))
        {
            Ok(st) => {
                let attr = self.attr_from(&st);
                self.remember(attr.ino, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old_dir), Some(name), Some(new_dir), Some(newname)) = (
            self.path_of(parent),
            name.to_str(),
            self.path_of(newparent),
            newname.to_str(),
        ) else {
            return reply.error(libc::ENOENT);
        };
        let old = join(&old_dir, name);
        let new = join(&new_dir, newname);
        match self.fs.rename(&old, &new, &ctx_of(req)) {
            Ok(()) => {
                self.rekey(&old, &new);
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(existing), Some(parent), Some(name)) =
            (self.path_of(ino), self.path_of(newparent), newname.to_str())
        else {
            return reply.error(libc::ENOENT);
        };
        let path = join(&parent, name);
        let ctx = ctx_of(req);
        match self
            .fs
            .link(&path, &existing, &ctx)
            .and_then(|_| self.fs.getattr(&path, &ctx))
        {
            Ok(st) => {
                let attr = self.attr_from(&st);
                self.remember(attr.ino, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.open(&path, flags, &ctx_of(req)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.fs.read(fh, offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.fs.write(fh, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.opendir(&path, &ctx_of(req)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        let entries = match self.fs.readdir(&path, &ctx_of(req)) {
            Ok(entries) => entries,
            Err(err) => return reply.error(err.errno()),
        };
        for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let filled = reply.add(
                self.fuse_ino(entry.inode),
                (i + 1) as i64,
                kind_of(entry.mode),
                &entry.name,
            );
            if filled {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.fs.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.access(&path, mask as u32, &ctx_of(req)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let (Some(parent), Some(name)) = (self.path_of(parent), name.to_str()) else {
            return reply.error(libc::ENOENT);
        };
        let path = join(&parent, name);
        let ctx = ctx_of(req);
        let created = self.fs.create(&path, masked(mode, umask), &ctx);
        match created.and_then(|fh| self.fs.getattr(&path, &ctx).map(|st| (fh, st))) {
            Ok((fh, st)) => {
                let attr = self.attr_from(&st);
                self.remember(attr.ino, path);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(err) => {
                warn!("create {path} failed: {err}");
                reply.error(err.errno());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_root() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/d", "b"), "/d/b");
    }

    #[test]
    fn kind_projection() {
        assert_eq!(kind_of(libc::S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(kind_of(libc::S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(kind_of(libc::S_IFREG | 0o644), FileType::RegularFile);
    }

    #[test]
    fn umask_applies_to_permissions_only() {
        assert_eq!(
            masked(libc::S_IFREG | 0o666, 0o022),
            libc::S_IFREG | 0o644
        );
    }
}
