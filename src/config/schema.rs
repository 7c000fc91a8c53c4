//! Configuration schema definitions.
//!
//! This module defines the structure of the portkeeper configuration file.
//! Every section is optional; missing keys fall back to the defaults below,
//! which match a ProtonVPN-style WireGuard setup with the gateway at
//! `10.2.0.1`.
//!
//! ```toml
//! [wireguard]
//! interface = "wg0"
//! health_check_host = "10.2.0.1"
//!
//! [natpmp]
//! gateway = "10.2.0.1"
//! lease_lifetime = 120
//!
//! [qbittorrent]
//! host = "localhost"
//! port = 8080
//! interface_binding = "wg0"
//!
//! [killswitch]
//! enabled = true
//! user = "qbittorrent"
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Every key that can be overridden from the environment, as dotted paths.
pub const OVERRIDE_KEYS: &[&str] = &[
    "wireguard.interface",
    "wireguard.health_check_host",
    "wireguard.health_check_interval",
    "wireguard.ping_timeout",
    "natpmp.gateway",
    "natpmp.refresh_interval",
    "natpmp.lease_lifetime",
    "natpmp.internal_port",
    "natpmp.renewal_fraction",
    "natpmp.request_timeout",
    "qbittorrent.host",
    "qbittorrent.port",
    "qbittorrent.use_https",
    "qbittorrent.verify_ssl",
    "qbittorrent.username",
    "qbittorrent.password",
    "qbittorrent.interface_binding",
    "qbittorrent.request_timeout",
    "killswitch.enabled",
    "killswitch.user",
    "killswitch.verify_interval",
    "killswitch.command_timeout",
    "service.log_level",
    "service.state_file",
    "service.max_consecutive_failures",
    "service.failure_backoff_base",
    "service.failure_backoff_max",
    "service.jitter_fraction",
    "service.on_max_failures",
];

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// WireGuard tunnel settings.
    #[serde(default)]
    pub wireguard: WireguardConfig,

    /// NAT-PMP lease settings.
    #[serde(default)]
    pub natpmp: NatPmpConfig,

    /// qBittorrent Web API settings.
    #[serde(default)]
    pub qbittorrent: QbittorrentConfig,

    /// Firewall killswitch settings.
    #[serde(default)]
    pub killswitch: KillswitchConfig,

    /// Service-level settings.
    #[serde(default)]
    pub service: ServiceConfig,
}

/// WireGuard tunnel settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WireguardConfig {
    /// Tunnel interface name.
    pub interface: String,
    /// Host pinged through the tunnel to prove it carries traffic.
    pub health_check_host: String,
    /// Seconds between tunnel re-validations while monitoring.
    pub health_check_interval: u64,
    /// Seconds to wait for a ping reply.
    pub ping_timeout: u64,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            health_check_host: "10.2.0.1".to_string(),
            health_check_interval: 30,
            ping_timeout: 5,
        }
    }
}

/// NAT-PMP lease settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NatPmpConfig {
    /// Gateway answering NAT-PMP requests (inside the tunnel).
    pub gateway: String,
    /// Upper bound on seconds between renewals.
    pub refresh_interval: u64,
    /// Requested mapping lifetime in seconds.
    pub lease_lifetime: u32,
    /// Internal port sent with every mapping request.
    pub internal_port: u16,
    /// Fraction of the granted lifetime after which the lease is renewed.
    pub renewal_fraction: f64,
    /// Seconds to wait for a gateway reply.
    pub request_timeout: u64,
}

impl Default for NatPmpConfig {
    fn default() -> Self {
        Self {
            gateway: "10.2.0.1".to_string(),
            refresh_interval: 60,
            lease_lifetime: 120,
            internal_port: 1,
            renewal_fraction: 0.5,
            request_timeout: 5,
        }
    }
}

/// qBittorrent Web API settings.
#[derive(Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QbittorrentConfig {
    /// Web UI host.
    pub host: String,
    /// Web UI port.
    pub port: u16,
    /// Talk to the Web UI over HTTPS.
    pub use_https: bool,
    /// Verify the Web UI's TLS certificate.
    pub verify_ssl: bool,
    /// Web UI username. Empty disables authentication.
    pub username: String,
    /// Web UI password.
    pub password: String,
    /// Interface qBittorrent must bind to.
    pub interface_binding: String,
    /// Seconds to wait for each API call.
    pub request_timeout: u64,
}

impl Default for QbittorrentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            use_https: false,
            verify_ssl: true,
            username: String::new(),
            password: String::new(),
            interface_binding: "wg0".to_string(),
            request_timeout: 10,
        }
    }
}

impl QbittorrentConfig {
    /// Base URL of the Web API.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

// Hand-written so the password never ends up in logs.
impl fmt::Debug for QbittorrentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QbittorrentConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_https", &self.use_https)
            .field("verify_ssl", &self.verify_ssl)
            .field("username", &self.username)
            .field("password", &"***")
            .field("interface_binding", &self.interface_binding)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Firewall killswitch settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct KillswitchConfig {
    /// Install the killswitch chain.
    pub enabled: bool,
    /// System user whose egress is confined to the tunnel.
    pub user: String,
    /// Seconds between killswitch verifications while monitoring.
    pub verify_interval: u64,
    /// Seconds to wait for each iptables invocation.
    pub command_timeout: u64,
}

impl Default for KillswitchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user: "qbittorrent".to_string(),
            verify_interval: 30,
            command_timeout: 10,
        }
    }
}

/// What to do once `max_consecutive_failures` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationPolicy {
    /// Log at error severity and keep retrying.
    #[default]
    Log,
    /// Run the shutdown sequence and exit with an error.
    Shutdown,
}

impl fmt::Display for EscalationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationPolicy::Log => f.write_str("log"),
            EscalationPolicy::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Service-level settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Where lease and failure state is persisted.
    pub state_file: PathBuf,
    /// Failure count at which failures are escalated.
    pub max_consecutive_failures: u32,
    /// Base backoff delay in seconds.
    pub failure_backoff_base: u64,
    /// Maximum backoff delay in seconds (before jitter).
    pub failure_backoff_max: u64,
    /// Upper bound of the random jitter, as a fraction of the delay.
    pub jitter_fraction: f64,
    /// Escalation behaviour at `max_consecutive_failures`.
    pub on_max_failures: EscalationPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            state_file: PathBuf::from("/var/lib/portkeeper/state.json"),
            max_consecutive_failures: 5,
            failure_backoff_base: 5,
            failure_backoff_max: 300,
            jitter_fraction: 0.1,
            on_max_failures: EscalationPolicy::Log,
        }
    }
}

impl Config {
    /// Check every value, failing on the first invalid one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_interface("wireguard.interface", &self.wireguard.interface)?;
        validate_interface(
            "qbittorrent.interface_binding",
            &self.qbittorrent.interface_binding,
        )?;
        validate_ipv4("wireguard.health_check_host", &self.wireguard.health_check_host)?;
        validate_ipv4("natpmp.gateway", &self.natpmp.gateway)?;

        if self.qbittorrent.host.trim().is_empty() {
            return Err(ConfigError::invalid("qbittorrent.host", "must not be empty"));
        }
        if self.qbittorrent.port == 0 {
            return Err(ConfigError::invalid("qbittorrent.port", "must be 1-65535"));
        }
        if self.natpmp.internal_port == 0 {
            return Err(ConfigError::invalid("natpmp.internal_port", "must be 1-65535"));
        }

        for (field, value) in [
            ("wireguard.health_check_interval", self.wireguard.health_check_interval),
            ("wireguard.ping_timeout", self.wireguard.ping_timeout),
            ("natpmp.refresh_interval", self.natpmp.refresh_interval),
            ("natpmp.lease_lifetime", u64::from(self.natpmp.lease_lifetime)),
            ("natpmp.request_timeout", self.natpmp.request_timeout),
            ("qbittorrent.request_timeout", self.qbittorrent.request_timeout),
            ("killswitch.verify_interval", self.killswitch.verify_interval),
            ("killswitch.command_timeout", self.killswitch.command_timeout),
            ("service.failure_backoff_base", self.service.failure_backoff_base),
        ] {
            if value < 1 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }

        if self.natpmp.refresh_interval >= u64::from(self.natpmp.lease_lifetime) {
            return Err(ConfigError::invalid(
                "natpmp.refresh_interval",
                format!(
                    "refresh interval ({}s) must be less than lease lifetime ({}s)",
                    self.natpmp.refresh_interval, self.natpmp.lease_lifetime
                ),
            ));
        }
        let fraction = self.natpmp.renewal_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::invalid(
                "natpmp.renewal_fraction",
                "must be strictly between 0 and 1",
            ));
        }
        let jitter = self.service.jitter_fraction;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::invalid(
                "service.jitter_fraction",
                "must be between 0 and 1",
            ));
        }
        if self.service.max_consecutive_failures < 1 {
            return Err(ConfigError::invalid(
                "service.max_consecutive_failures",
                "must be at least 1",
            ));
        }
        if self.service.failure_backoff_max < self.service.failure_backoff_base {
            return Err(ConfigError::invalid(
                "service.failure_backoff_max",
                "must be >= failure_backoff_base",
            ));
        }
        if parse_log_level(&self.service.log_level).is_none() {
            return Err(ConfigError::invalid(
                "service.log_level",
                format!("unknown level '{}'", self.service.log_level),
            ));
        }
        if self.service.state_file.as_os_str().is_empty() {
            return Err(ConfigError::invalid("service.state_file", "must not be empty"));
        }

        if self.killswitch.enabled {
            match nix::unistd::User::from_name(&self.killswitch.user) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(ConfigError::invalid(
                        "killswitch.user",
                        format!(
                            "user '{}' not found; create it or disable the killswitch",
                            self.killswitch.user
                        ),
                    ));
                }
                Err(e) => {
                    return Err(ConfigError::invalid(
                        "killswitch.user",
                        format!("failed to look up '{}': {}", self.killswitch.user, e),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Apply one override given as a dotted key and a raw string value.
    ///
    /// `var` names the source (the environment variable) for error messages.
    pub fn apply_override(&mut self, key: &str, raw: &str, var: &str) -> Result<(), ConfigError> {
        match key {
            "wireguard.interface" => self.wireguard.interface = raw.to_string(),
            "wireguard.health_check_host" => self.wireguard.health_check_host = raw.to_string(),
            "wireguard.health_check_interval" => {
                self.wireguard.health_check_interval = parse_num(raw, var)?
            }
            "wireguard.ping_timeout" => self.wireguard.ping_timeout = parse_num(raw, var)?,
            "natpmp.gateway" => self.natpmp.gateway = raw.to_string(),
            "natpmp.refresh_interval" => self.natpmp.refresh_interval = parse_num(raw, var)?,
            "natpmp.lease_lifetime" => self.natpmp.lease_lifetime = parse_num(raw, var)?,
            "natpmp.internal_port" => self.natpmp.internal_port = parse_num(raw, var)?,
            "natpmp.renewal_fraction" => self.natpmp.renewal_fraction = parse_num(raw, var)?,
            "natpmp.request_timeout" => self.natpmp.request_timeout = parse_num(raw, var)?,
            "qbittorrent.host" => self.qbittorrent.host = raw.to_string(),
            "qbittorrent.port" => self.qbittorrent.port = parse_num(raw, var)?,
            "qbittorrent.use_https" => self.qbittorrent.use_https = parse_bool(raw, var)?,
            "qbittorrent.verify_ssl" => self.qbittorrent.verify_ssl = parse_bool(raw, var)?,
            "qbittorrent.username" => self.qbittorrent.username = raw.to_string(),
            "qbittorrent.password" => self.qbittorrent.password = raw.to_string(),
            "qbittorrent.interface_binding" => {
                self.qbittorrent.interface_binding = raw.to_string()
            }
            "qbittorrent.request_timeout" => {
                self.qbittorrent.request_timeout = parse_num(raw, var)?
            }
            "killswitch.enabled" => self.killswitch.enabled = parse_bool(raw, var)?,
            "killswitch.user" => self.killswitch.user = raw.to_string(),
            "killswitch.verify_interval" => self.killswitch.verify_interval = parse_num(raw, var)?,
            "killswitch.command_timeout" => self.killswitch.command_timeout = parse_num(raw, var)?,
            "service.log_level" => self.service.log_level = raw.to_string(),
            "service.state_file" => self.service.state_file = PathBuf::from(raw),
            "service.max_consecutive_failures" => {
                self.service.max_consecutive_failures = parse_num(raw, var)?
            }
            "service.failure_backoff_base" => {
                self.service.failure_backoff_base = parse_num(raw, var)?
            }
            "service.failure_backoff_max" => {
                self.service.failure_backoff_max = parse_num(raw, var)?
            }
            "service.jitter_fraction" => self.service.jitter_fraction = parse_num(raw, var)?,
            "service.on_max_failures" => {
                self.service.on_max_failures = match raw.trim().to_ascii_lowercase().as_str() {
                    "log" => EscalationPolicy::Log,
                    "shutdown" => EscalationPolicy::Shutdown,
                    other => {
                        return Err(ConfigError::InvalidOverride {
                            var: var.to_string(),
                            message: format!("expected 'log' or 'shutdown', got '{}'", other),
                        });
                    }
                }
            }
            _ => {
                return Err(ConfigError::InvalidOverride {
                    var: var.to_string(),
                    message: format!("unknown key '{}'", key),
                });
            }
        }
        Ok(())
    }

    /// Tunnel health-check cadence.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.wireguard.health_check_interval)
    }

    /// Killswitch verification cadence.
    pub fn killswitch_verify_interval(&self) -> Duration {
        Duration::from_secs(self.killswitch.verify_interval)
    }

    /// Longest the controller can go without a heartbeat: a fully jittered
    /// maximum backoff, or one of the monitoring timers.
    pub fn longest_wait(&self) -> Duration {
        let backoff = Duration::from_secs(self.service.failure_backoff_max)
            .mul_f64(1.0 + self.service.jitter_fraction);
        backoff
            .max(self.health_check_interval())
            .max(self.killswitch_verify_interval())
    }

    /// External commands the service needs on `PATH`.
    pub fn required_tools(&self) -> Vec<&'static str> {
        let mut tools = vec!["ip", "ping"];
        if self.killswitch.enabled {
            tools.push("iptables");
        }
        tools
    }

    /// NAT-PMP gateway address. Only valid after [`Config::validate`].
    pub fn gateway_addr(&self) -> Result<Ipv4Addr, ConfigError> {
        self.natpmp
            .gateway
            .parse()
            .map_err(|_| ConfigError::invalid("natpmp.gateway", "not an IPv4 address"))
    }
}

/// Normalize a configured log level into a `tracing` filter directive.
pub fn parse_log_level(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

/// Linux interface names: 1-15 chars, leading letter, `[A-Za-z0-9_-]`.
fn validate_interface(field: &str, name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = name.len() <= 15
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!(
                "'{}' must start with a letter and contain at most 15 alphanumeric, '-' or '_' characters",
                name
            ),
        ))
    }
}

fn validate_ipv4(field: &str, value: &str) -> Result<(), ConfigError> {
    value
        .parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| ConfigError::invalid(field, format!("'{}' is not an IPv4 address", value)))
}

fn parse_num<T>(raw: &str, var: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidOverride {
        var: var.to_string(),
        message: e.to_string(),
    })
}

fn parse_bool(raw: &str, var: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidOverride {
            var: var.to_string(),
            message: format!("expected a boolean, got '{}'", other),
        }),
    }
}
