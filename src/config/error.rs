//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading.
///
/// Every variant is a configuration fault: the service refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the file that couldn't be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse a TOML configuration file.
    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the file that couldn't be parsed.
        path: PathBuf,
        /// The underlying TOML parse error.
        source: toml::de::Error,
    },

    /// A configuration value is invalid.
    #[error("Invalid config value for {field}: {message}")]
    InvalidValue {
        /// The dotted key that has an invalid value.
        field: String,
        /// Description of why the value is invalid.
        message: String,
    },

    /// An environment override could not be parsed into the key's type.
    #[error("Invalid value for environment variable {var}: {message}")]
    InvalidOverride {
        /// Name of the environment variable.
        var: String,
        /// Description of the parse failure.
        message: String,
    },

    /// A required external tool is not installed.
    #[error("Required command '{0}' not found in PATH")]
    MissingTool(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
