//! Configuration module
//!
//! Loads `printer-hil.toml` from the working directory or the platform
//! config directory.

mod settings;

pub use settings::{
    ComparisonConfig, HilConfig, InterfacesConfig, LineSettings, LoggingConfig, PathsConfig, PortSetting,
    TimingConfig, CONFIG_FILE_NAME,
};

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Explicitly given file does not exist
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Reading or writing failed
    #[error("Cannot access {}: {source}", path.display())]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Not valid TOML or unknown values
    #[error("Invalid config {}: {source}", path.display())]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Parser error
        #[source]
        source: toml::de::Error,
    },

    /// Rendering failed
    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values that parse but cannot be used
    #[error("Invalid setting {0}")]
    Invalid(String),
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "printer-hil", "printer-hil")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// First existing config file: working directory, then config directory
pub fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Some(local);
    }
    config_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .filter(|path| path.is_file())
}
