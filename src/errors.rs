//! Error types shared across the filesystem core.
//!
//! Every fallible operation in the crate returns [`FsResult`]. The variants of
//! [`FsError`] form the complete error taxonomy visible at the dispatcher
//! boundary; each one projects to a POSIX errno through [`FsError::errno`],
//! which is what the kernel bridge ultimately replies with.

use thiserror::Error;

/// Return type used by every fallible filesystem operation.
pub type FsResult<T> = Result<T, FsError>;

/// The filesystem error taxonomy.
///
/// Database-level failures are folded into this set on the way up: a unique
/// constraint violation becomes [`FsError::Exists`] (a duplicate
/// `(parent, name)` or `(inode, sequence)` pair is the storage-level signal
/// for it), and any other database failure becomes [`FsError::Io`].
#[derive(Debug, Error)]
pub enum FsError {
    /// A path component, volume root or file handle could not be found.
    #[error("no such file or directory")]
    NotFound,

    /// A directory entry with the same `(parent, name)` already exists.
    #[error("file exists")]
    Exists,

    /// The caller does not hold the required permission bits, or the
    /// operation is not permitted on this handle's open mode.
    #[error("permission denied")]
    Access,

    /// `rmdir` on a directory that still has entries besides `.` and `..`.
    #[error("directory not empty")]
    NotEmpty,

    /// Unexpected database failure, propagated.
    #[error("database error: {0}")]
    Io(#[source] rusqlite::Error),
}

impl FsError {
    /// The errno the bridge replies with for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::Access => libc::EACCES,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Io(_) => libc::EIO,
        }
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => FsError::NotFound,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                FsError::Exists
            }
            other => FsError::Io(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_projection() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::Exists.errno(), libc::EEXIST);
        assert_eq!(FsError::Access.errno(), libc::EACCES);
        assert_eq!(FsError::NotEmpty.errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn constraint_violation_maps_to_exists() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER UNIQUE); INSERT INTO t VALUES (1);")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES (1)", [])
            .expect_err("duplicate insert must fail");
        assert!(matches!(FsError::from(err), FsError::Exists));
    }
}
