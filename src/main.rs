//! `dbfs` mount command.
//!
//! Mounts a database volume over FUSE. The mountpoint comes either from the
//! command line or from the `DBFS_MOUNTPOINTS` table keyed by volume name;
//! the database path from `--database` or `DBFS_DATABASE`. Exits zero on a
//! clean unmount.

use std::env;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use fuser::MountOption;
use log::debug;

use dbfs::config;
use dbfs::fs::bridge::FuseBridge;
use dbfs::{DbFs, FsConfig, Store};

#[derive(Parser)]
#[command(name = "dbfs", version, about = "Mount a database-backed filesystem")]
struct Args {
    /// Volume to mount.
    volume: String,

    /// Mountpoint; defaults to the one configured for the volume.
    mountpoint: Option<PathBuf>,

    /// SQLite database holding the filesystem (default: $DBFS_DATABASE,
    /// then ./dbfs.db).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log every filesystem operation.
    #[arg(short, long)]
    debug: bool,

    /// Do not detach from the terminal.
    #[arg(short, long)]
    foreground: bool,

    /// Accepted for compatibility; the session is single-threaded anyway.
    #[arg(long = "no-threads")]
    no_threads: bool,

    /// Let users other than the mounting one access the volume.
    #[arg(long)]
    allow_other: bool,

    /// Mount over a non-empty directory.
    #[arg(long)]
    nonempty: bool,

    /// Extra mount options, comma-separated `key[=value]` pairs passed
    /// through to the kernel.
    #[arg(short = 'o', long = "options", value_name = "OPT[,OPT...]")]
    options: Option<String>,
}

fn mount_options(args: &Args) -> Vec<MountOption> {
    let mut options = vec![MountOption::FSName(format!("dbfs:{}", args.volume))];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }
    if args.nonempty {
        options.push(MountOption::CUSTOM("nonempty".to_string()));
    }
    if let Some(raw) = &args.options {
        for opt in raw.split(',').filter(|o| !o.is_empty()) {
            options.push(MountOption::CUSTOM(opt.to_string()));
        }
    }
    options
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.debug {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let mountpoint = match &args.mountpoint {
        Some(explicit) => explicit.clone(),
        None => config::mountpoint_for(&args.volume)
            .with_context(|| format!("no mountpoint configured for volume {}", args.volume))?,
    };
    let database = args
        .database
        .clone()
        .or_else(|| env::var(config::ENV_DATABASE).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("dbfs.db"));

    if args.no_threads {
        debug!("single-threaded session requested (always the case here)");
    }
    if !args.foreground {
        // detach before touching the database: connections must not cross
        // the fork
        nix::unistd::daemon(false, false).context("failed to daemonize")?;
    }

    let store = Store::open(&database)
        .with_context(|| format!("cannot open database {}", database.display()))?;
    let fs = DbFs::mount(store, FsConfig::from_env(), &args.volume)?;
    let bridge = FuseBridge::new(fs)?;

    fuser::mount2(bridge, &mountpoint, &mount_options(&args))
        .with_context(|| format!("mount on {} failed", mountpoint.display()))?;
    Ok(())
}
