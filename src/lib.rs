//! portkeeper: NAT-PMP port keeper for qBittorrent behind a WireGuard tunnel
//!
//! Leases an inbound port pair (TCP and UDP) from the VPN gateway, keeps
//! qBittorrent listening on it, and confines qBittorrent's egress to the
//! tunnel with a dedicated iptables chain.
//!
//! # Security Model
//!
//! The killswitch is verified on a timer and a missing or altered chain is
//! a security fault, logged at error severity and audited to syslog.
//!
//! # Architecture
//!
//! - **Tunnel**: interface and gateway health probe
//! - **Lease**: NAT-PMP codec, UDP gateway, lease pair client
//! - **App**: qBittorrent Web API client and port reconciliation
//! - **Killswitch**: staged iptables chain install, verify, teardown
//! - **Recovery / State**: backoff policy and the persisted state file
//! - **Service**: state machine, controller, systemd notify, signals
//! - **Config / Telemetry**: TOML + env configuration, syslog audit events

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod app;
pub mod cli;
pub mod config;
pub mod killswitch;
pub mod lease;
pub mod process;
pub mod recovery;
pub mod service;
pub mod state;
pub mod telemetry;
pub mod tunnel;
