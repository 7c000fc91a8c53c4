//! Configuration system for portkeeper.
//!
//! Configuration is a single TOML document with five sections
//! (`wireguard`, `natpmp`, `qbittorrent`, `killswitch`, `service`), every
//! key of which can be overridden from the environment:
//!
//! ```text
//! PORTKEEPER_NATPMP_LEASE_LIFETIME=300
//! PORTKEEPER_QBITTORRENT_PASSWORD=...
//! ```
//!
//! Configuration is loaded once at startup and never hot-reloaded. An
//! invalid document is fatal before any external side effect.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, DEFAULT_CONFIG_PATH, ENV_PREFIX, env_var_name};
pub use schema::{
    Config, EscalationPolicy, KillswitchConfig, NatPmpConfig, OVERRIDE_KEYS, QbittorrentConfig,
    ServiceConfig, WireguardConfig, parse_log_level,
};
