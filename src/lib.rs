//! A POSIX filesystem stored in a relational database.
//!
//! Every piece of persistent state (the directory tree, inode metadata and
//! file content) lives in three SQLite tables. A FUSE bridge exposes a
//! mounted volume so ordinary programs perform file I/O that is translated
//! into database reads and writes.
//!
//! The crate splits along the same seams as the problem:
//!
//! - [`store`] holds the schema and row-level operations (inodes, blocks,
//!   tree-nodes) with the unique constraints the upper layers lean on.
//! - [`fs`] is the core: per-handle open-file engine, path resolver,
//!   permission engine and the [`fs::DbFs`] operation dispatcher, plus the
//!   [`fs::bridge`] adapter for `fuser`.
//! - [`config`] covers block geometry and mountpoint configuration.
//! - [`errors`] defines the [`errors::FsError`] taxonomy and its errno
//!   mapping.

pub mod config;
pub mod errors;
pub mod fs;
pub mod store;

pub use config::FsConfig;
pub use errors::{FsError, FsResult};
pub use fs::{Context, DbFs};
pub use store::Store;
