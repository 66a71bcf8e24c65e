#[cfg(not(target_os = "linux"))]
compile_error!("mirrorfs relies on O_PATH descriptors and /proc/self/fd and only builds on Linux");

pub mod cli;
pub mod config;
pub mod error;
pub mod mirror;

pub use config::get_config_path;
pub use config::load_config;
pub use config::merge_configs;
pub use config::Config;

pub use error::{MirrorError, Result};

pub use mirror::mount::MountSettings;
pub use mirror::{Entry, MirrorFs, MirrorOptions, Opened, SetAttr, ROOT_HANDLE};
