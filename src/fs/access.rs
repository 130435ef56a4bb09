//! Permission engine.
//!
//! Implements the ordered POSIX permission check against an inode's mode
//! bits: the "other" class first, then the superuser escape, then the owner
//! class, then the group class. The caller's group set comes from the host
//! user database and is memoized per `(uid, gid)` for the lifetime of the
//! process, so group membership changes on the host are not visible until
//! remount.

use std::collections::HashMap;
use std::ffi::CString;

use lazy_static::lazy_static;
use nix::unistd::{getgrouplist, Gid, Uid, User};
use parking_lot::RwLock;

use crate::errors::{FsError, FsResult};
use crate::store::inode::InodeRow;

use super::Context;

/// Read permission bit, as used in `required` masks.
pub const READ: u32 = libc::R_OK as u32;

/// Write permission bit.
pub const WRITE: u32 = libc::W_OK as u32;

/// Execute / traverse permission bit.
pub const EXEC: u32 = libc::X_OK as u32;

lazy_static! {
    static ref GROUPS: RwLock<HashMap<(u32, u32), Vec<u32>>> = RwLock::new(HashMap::new());
}

/// Checks that `ctx` may perform an operation requiring the permission bits
/// in `required` on `inode`.
///
/// First match wins: other bits, superuser, owner bits, group bits. Fails
/// with `EACCES` when no class grants the full mask.
pub fn check(inode: &InodeRow, required: u32, ctx: &Context) -> FsResult<()> {
    if inode.mode & required == required {
        return Ok(());
    }
    if ctx.uid == 0 {
        return Ok(());
    }
    if inode.uid == ctx.uid && (inode.mode >> 6) & required == required {
        return Ok(());
    }
    if groups_for(ctx.uid, ctx.gid).contains(&inode.gid)
        && (inode.mode >> 3) & required == required
    {
        return Ok(());
    }
    Err(FsError::Access)
}

/// The caller's group set: primary gid plus every supplementary group the
/// host database lists for the caller's user name. Memoized per
/// `(uid, gid)`; a concurrent duplicate fill is harmless.
pub fn groups_for(uid: u32, gid: u32) -> Vec<u32> {
    if let Some(groups) = GROUPS.read().get(&(uid, gid)) {
        return groups.clone();
    }
    let groups = lookup_groups(uid, gid);
    GROUPS.write().insert((uid, gid), groups.clone());
    groups
}

fn lookup_groups(uid: u32, gid: u32) -> Vec<u32> {
    let mut groups = vec![gid];
    if let Ok(Some(user)) = User::from_uid(Uid::from_raw(uid)) {
        if let Ok(name) = CString::new(user.name) {
            if let Ok(list) = getgrouplist(&name, Gid::from_raw(gid)) {
                groups = list.into_iter().map(Gid::as_raw).collect();
            }
        }
    }
    if !groups.contains(&gid) {
        groups.push(gid);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InodeId;

    // a uid no host should actually have, so group lookups fall back to the
    // primary gid alone
    const NOBODY: u32 = 0x7fff_fff0;

    fn inode(mode: u32, uid: u32, gid: u32) -> InodeRow {
        InodeRow {
            id: InodeId(1),
            inuse: 0,
            mode,
            uid,
            gid,
            atime: 0,
            mtime: 0,
            ctime: 0,
            size: 0,
        }
    }

    fn ctx(uid: u32, gid: u32) -> Context {
        Context { uid, gid, pid: 1 }
    }

    #[test]
    fn other_bits_grant_everyone() {
        let ino = inode(libc::S_IFREG | 0o004, 1000, 1000);
        assert!(check(&ino, READ, &ctx(NOBODY, NOBODY)).is_ok());
        assert!(check(&ino, WRITE, &ctx(NOBODY, NOBODY)).is_err());
    }

    #[test]
    fn superuser_bypasses_bits() {
        let ino = inode(libc::S_IFREG | 0o000, 1000, 1000);
        assert!(check(&ino, READ | WRITE | EXEC, &ctx(0, 0)).is_ok());
    }

    #[test]
    fn owner_bits_require_matching_uid() {
        let ino = inode(libc::S_IFREG | 0o600, NOBODY, NOBODY);
        assert!(check(&ino, READ | WRITE, &ctx(NOBODY, 1)).is_ok());
        assert!(check(&ino, READ, &ctx(NOBODY - 1, 1)).is_err());
    }

    #[test]
    fn group_bits_require_membership() {
        let ino = inode(libc::S_IFREG | 0o040, NOBODY, 54_321);
        // unknown uid: the group set is exactly the primary gid
        assert!(check(&ino, READ, &ctx(NOBODY - 1, 54_321)).is_ok());
        assert!(check(&ino, READ, &ctx(NOBODY - 1, 54_322)).is_err());
    }

    #[test]
    fn full_mask_must_be_satisfied_by_one_class() {
        // owner may read, other may write; asking for both as owner fails
        let ino = inode(libc::S_IFREG | 0o402, NOBODY, NOBODY);
        assert!(check(&ino, READ, &ctx(NOBODY, 1)).is_ok());
        assert!(check(&ino, READ | WRITE, &ctx(NOBODY, 1)).is_err());
    }

    #[test]
    fn groups_memoized_per_uid_gid() {
        let first = groups_for(NOBODY, 7);
        let second = groups_for(NOBODY, 7);
        assert_eq!(first, second);
        assert!(first.contains(&7));
    }
}
