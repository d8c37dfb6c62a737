//! Configuration module
//!
//! Handles application settings and connection profiles

mod settings;

pub use settings::{
    AppConfig, ConnectionProfile, LoggingConfig, TerminalConfig, TransferSettings, MAX_PACKET_SIZE,
};

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No home / config directory on this platform
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// Reading or writing the file failed
    #[error("{}: {source}", .path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or type error
    #[error("{}: {source}", .path.display())]
    Parse {
        /// File involved
        path: PathBuf,
        /// Parser error
        #[source]
        source: toml::de::Error,
    },

    /// Serializing failed
    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Value out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "sshterm", "sshterm")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default config file path
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}
