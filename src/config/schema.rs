use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings that may come from the config file or the command line.
///
/// Every field is optional so that layers can be merged: command line over
/// file, file over the built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Attribute and entry cache timeout in seconds. 0 disables caching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,

    /// Maximum number of worker threads serving requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_threads: Option<usize>,

    /// Seconds an idle worker is kept before it exits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_other: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_unmount: Option<bool>,
}

impl Config {
    /// Cache timeout. A value that does not fit a `Duration` is rejected by
    /// [`validate_config`] and falls back to the default here.
    pub fn get_timeout(&self) -> Duration {
        self.timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or_else(|| Duration::from_secs_f64(super::default_timeout_secs()))
    }

    pub fn get_max_threads(&self) -> usize {
        self.max_threads.unwrap_or_else(super::default_max_threads)
    }

    pub fn get_idle_timeout(&self) -> Duration {
        Duration::from_secs(
            self.idle_timeout_secs
                .unwrap_or_else(super::default_idle_timeout_secs),
        )
    }

    pub fn get_allow_other(&self) -> bool {
        self.allow_other.unwrap_or(false)
    }

    pub fn get_auto_unmount(&self) -> bool {
        self.auto_unmount.unwrap_or(false)
    }
}

pub fn validate_config(config: &Config) -> Result<()> {
    if let Some(timeout) = config.timeout_secs {
        if Duration::try_from_secs_f64(timeout).is_err() {
            return Err(MirrorError::Config(format!(
                "Invalid timeout_secs {}: must be a non-negative number of seconds",
                timeout
            )));
        }
    }

    if config.get_max_threads() == 0 {
        return Err(MirrorError::Config(
            "Invalid max_threads 0: at least one worker is required".to_string(),
        ));
    }

    Ok(())
}
