//! Errors surfaced while loading the TOML configuration files.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read at all.
    #[error("cannot read {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    /// The file was read but is not valid TOML for our schema.
    #[error("invalid TOML in {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
