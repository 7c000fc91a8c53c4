//! Configuration loading with environment overrides.
//!
//! Configuration is resolved in order, later sources winning:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. Config file: `/etc/portkeeper/config.toml`, or the `--config` path
//! 3. `PORTKEEPER_<SECTION>_<KEY>` environment variables
//!
//! A missing default file is not an error. A missing file named with
//! `--config` is. The merged result is validated before it is returned.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::ConfigError;
use super::schema::{Config, OVERRIDE_KEYS};

/// Default configuration path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/portkeeper/config.toml";

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "PORTKEEPER_";

/// Configuration loader.
pub struct ConfigLoader {
    /// Path to the configuration file.
    path: PathBuf,
    /// Whether the path was given explicitly (missing file is then an error).
    explicit: bool,
}

impl ConfigLoader {
    /// Create a loader for the default path.
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
            explicit: false,
        }
    }

    /// Create a loader for a path given on the command line.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            explicit: true,
        }
    }

    /// Path this loader reads.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load from the file and the process environment, then validate.
    pub fn load(&self) -> Result<Config, ConfigError> {
        self.load_with_env(std::env::vars())
    }

    /// Load from the file and the given environment, then validate.
    pub fn load_with_env<I>(&self, env: I) -> Result<Config, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = match self.load_file(&self.path)? {
            Some(config) => {
                debug!("Loaded config from {:?}", self.path);
                config
            }
            None if self.explicit => {
                return Err(ConfigError::ReadError {
                    path: self.path.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "Specified config file not found",
                    ),
                });
            }
            None => {
                debug!("No config found at {:?}, using defaults", self.path);
                Config::default()
            }
        };

        apply_env(&mut config, env)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Environment variable name for a dotted key.
pub fn env_var_name(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key.replace('.', "_").to_ascii_uppercase())
}

fn apply_env<I>(config: &mut Config, env: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (var, value) in env {
        if !var.starts_with(ENV_PREFIX) {
            continue;
        }
        match OVERRIDE_KEYS.iter().find(|key| env_var_name(key) == var) {
            Some(key) => {
                config.apply_override(key, &value, &var)?;
                debug!("Applied override {}", var);
            }
            None => warn!("Ignoring unknown environment variable {}", var),
        }
    }
    Ok(())
}
