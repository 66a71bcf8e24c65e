use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("Invalid source {path}: {reason}")]
    Source { path: PathBuf, reason: String },

    #[error("Invalid mountpoint {path}: {reason}")]
    Mountpoint { path: PathBuf, reason: String },

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Session loop error: {0}")]
    Session(String),
}

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        MirrorError::Io(err)
    }
}

impl From<toml::de::Error> for MirrorError {
    fn from(err: toml::de::Error) -> Self {
        MirrorError::Config(err.to_string())
    }
}
