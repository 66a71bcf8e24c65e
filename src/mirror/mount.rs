use fuser::{MountOption, Session};
use std::path::Path;

use crate::error::{MirrorError, Result};
use crate::mirror::fuse::{FuseAdapter, WorkerPool};
use crate::mirror::MirrorFs;

/// Mount-time switches that do not affect the bookkeeping layer.
#[derive(Debug, Clone, Default)]
pub struct MountSettings {
    pub allow_other: bool,
    pub auto_unmount: bool,
    pub pool: WorkerPool,
}

pub fn mount_options(settings: &MountSettings) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("mirror".to_string()),
        MountOption::DefaultPermissions,
    ];
    if settings.allow_other {
        options.push(MountOption::AllowOther);
    }
    if settings.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    options
}

/// Mount `fs` at `mount_point` and serve requests until the filesystem is
/// unmounted.
///
/// Setup failures are reported as [`MirrorError::Mount`]; a session loop that
/// ends with an error is reported as [`MirrorError::Session`].
pub fn run(fs: MirrorFs, mount_point: &Path, settings: &MountSettings) -> Result<()> {
    let source = fs.source().to_path_buf();
    let adapter = FuseAdapter::new(fs, &settings.pool)?;
    let options = mount_options(settings);

    tracing::info!(
        "Mounting {} at {} ({} workers)",
        source.display(),
        mount_point.display(),
        settings.pool.max_threads
    );

    let mut session = Session::new(adapter, mount_point, &options).map_err(|e| {
        tracing::error!("Failed to mount filesystem: {}", e);
        MirrorError::Mount(e.to_string())
    })?;

    session.run().map_err(|e| {
        tracing::error!("Session loop error: {}", e);
        MirrorError::Session(e.to_string())
    })?;

    tracing::info!("FUSE filesystem unmounted");
    Ok(())
}
