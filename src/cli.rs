//! Command-line interface definitions for portkeeper.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// NAT-PMP port keeper for qBittorrent behind a WireGuard tunnel.
///
/// portkeeper leases an inbound port from the VPN gateway over NAT-PMP,
/// keeps qBittorrent listening on it, and confines qBittorrent's traffic
/// to the tunnel with an iptables killswitch.
#[derive(Parser, Debug)]
#[command(name = "portkeeper")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    ///
    /// Defaults to /etc/portkeeper/config.toml. A missing default file means
    /// built-in defaults plus environment overrides; a missing file given
    /// here is an error.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override `service.log_level` (trace, debug, info, warn, error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Increase log verbosity.
    ///
    /// -v = debug, -vv = trace. Takes precedence over RUST_LOG and the
    /// configured level.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
