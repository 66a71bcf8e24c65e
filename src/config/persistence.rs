use crate::error::{MirrorError, Result};
use std::path::Path;

use crate::config::paths::*;
use crate::config::schema::*;

/// Load the config file.
///
/// An explicitly named file must exist. The default location is optional:
/// when nothing is there the built-in defaults apply.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config_path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = get_config_path()?;
            if !path.exists() {
                tracing::debug!("No config file at {}, using defaults", path.display());
                return Ok(Config::default());
            }
            path
        }
    };

    let toml_content = std::fs::read_to_string(&config_path).map_err(|e| {
        MirrorError::Config(format!(
            "Failed to read config file {}: {}",
            config_path.display(),
            e
        ))
    })?;

    toml::from_str(&toml_content).map_err(|e| {
        MirrorError::Config(format!(
            "Failed to parse config {}: {}",
            config_path.display(),
            e
        ))
    })
}

/// Layer `overlay` on top of `base`; set fields in `overlay` win.
pub fn merge_configs(base: Config, overlay: Config) -> Config {
    Config {
        timeout_secs: overlay.timeout_secs.or(base.timeout_secs),
        max_threads: overlay.max_threads.or(base.max_threads),
        idle_timeout_secs: overlay.idle_timeout_secs.or(base.idle_timeout_secs),
        allow_other: overlay.allow_other.or(base.allow_other),
        auto_unmount: overlay.auto_unmount.or(base.auto_unmount),
    }
}
