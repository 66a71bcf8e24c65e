use clap::Parser;
use tracing_subscriber::EnvFilter;

use mirrorfs::cli::{self, Args};
use mirrorfs::config::{load_config, merge_configs, validate_config};
use mirrorfs::mirror::fuse::WorkerPool;
use mirrorfs::mirror::mount;
use mirrorfs::{MirrorFs, MirrorOptions, MountSettings};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> mirrorfs::Result<()> {
    let args = Args::parse();

    let mut filter = std::env::var("MIRRORFS_LOG").unwrap_or_else(|_| "info".to_string());
    if args.debug_fuse {
        filter.push_str(",fuser=debug");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = merge_configs(load_config(args.config.as_deref())?, args.to_config());
    validate_config(&config)?;

    let source = cli::resolve_source(&args.mirror);
    cli::validate_mountpoint(&args.mountpoint)?;

    let fs = MirrorFs::new(
        &source,
        MirrorOptions {
            timeout: config.get_timeout(),
        },
    )?;

    let settings = MountSettings {
        allow_other: config.get_allow_other(),
        auto_unmount: config.get_auto_unmount(),
        pool: WorkerPool {
            max_threads: config.get_max_threads(),
            idle_timeout: config.get_idle_timeout(),
        },
    };

    mount::run(fs, &args.mountpoint, &settings)
}
