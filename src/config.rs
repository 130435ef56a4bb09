//! Runtime configuration.
//!
//! Block geometry and read-ahead depth are process-wide settings read from
//! the environment once at startup, with the defaults the filesystem was
//! designed around (512 KiB blocks, 10 blocks of read-ahead). Tests construct
//! [`FsConfig`] values directly to exercise other geometries.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Environment key for the block size exponent.
pub const ENV_BLOCK_BITS: &str = "DBFS_BLOCK_BITS";

/// Environment key for the read-ahead depth.
pub const ENV_BLOCKS_READ_AHEAD: &str = "DBFS_BLOCKS_READ_AHEAD";

/// Environment key for the volume-to-mountpoint table.
pub const ENV_MOUNTPOINTS: &str = "DBFS_MOUNTPOINTS";

/// Environment key for the mountpoint of the distinguished `MEDIA` volume.
pub const ENV_MEDIA_ROOT: &str = "DBFS_MEDIA_ROOT";

/// Environment key for the database path.
pub const ENV_DATABASE: &str = "DBFS_DATABASE";

/// Volume name that falls back to [`ENV_MEDIA_ROOT`] for its mountpoint.
pub const MEDIA_VOLUME: &str = "MEDIA";

const DEFAULT_BLOCK_BITS: u32 = 19;
const DEFAULT_BLOCKS_READ_AHEAD: u64 = 10;

/// Block geometry and cache tuning for the open-file engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsConfig {
    /// log2 of the block size in bytes.
    pub block_bits: u32,
    /// Number of blocks fetched from storage on a cache miss.
    pub blocks_read_ahead: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_bits: DEFAULT_BLOCK_BITS,
            blocks_read_ahead: DEFAULT_BLOCKS_READ_AHEAD,
        }
    }
}

impl FsConfig {
    /// Reads the configuration from the process environment, keeping the
    /// defaults for keys that are absent or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            block_bits: env_parse(ENV_BLOCK_BITS).unwrap_or(defaults.block_bits),
            blocks_read_ahead: env_parse(ENV_BLOCKS_READ_AHEAD)
                .unwrap_or(defaults.blocks_read_ahead),
        }
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u64 {
        1u64 << self.block_bits
    }

    /// Mask selecting the in-block offset bits.
    pub fn block_mask(&self) -> u64 {
        self.block_size() - 1
    }

    /// Sequence number of the block containing `offset`.
    pub fn block_of(&self, offset: u64) -> u64 {
        offset >> self.block_bits
    }

    /// Offset of `offset` within its block.
    pub fn offset_in_block(&self, offset: u64) -> u64 {
        offset & self.block_mask()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.trim().parse().ok()
}

/// Parses a `volume=path,volume=path` table into a map.
///
/// Entries without a `=` or with an empty volume name are skipped.
fn parse_mountpoints(raw: &str) -> HashMap<String, PathBuf> {
    raw.split(',')
        .filter_map(|entry| {
            let (volume, path) = entry.split_once('=')?;
            let volume = volume.trim();
            if volume.is_empty() || path.is_empty() {
                return None;
            }
            Some((volume.to_string(), PathBuf::from(path)))
        })
        .collect()
}

/// Looks up the configured mountpoint for `volume`.
///
/// Consults the [`ENV_MOUNTPOINTS`] table first; the distinguished
/// [`MEDIA_VOLUME`] additionally falls back to [`ENV_MEDIA_ROOT`].
pub fn mountpoint_for(volume: &str) -> Option<PathBuf> {
    if let Ok(raw) = env::var(ENV_MOUNTPOINTS) {
        if let Some(path) = parse_mountpoints(&raw).remove(volume) {
            return Some(path);
        }
    }
    if volume == MEDIA_VOLUME {
        if let Ok(root) = env::var(ENV_MEDIA_ROOT) {
            return Some(PathBuf::from(root));
        }
    }
    None
}
