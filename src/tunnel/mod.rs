//! VPN tunnel health observation.
//!
//! A tunnel is healthy when, in order:
//!
//! 1. the interface exists and is up,
//! 2. it holds an IPv4 address,
//! 3. a single ICMP echo to the gateway, sent out of that interface, is
//!    answered in time.
//!
//! The first unmet condition short-circuits the probe and is reported as a
//! [`HealthFailure`] so the controller can log the precise cause.

mod error;
mod probe;

pub use error::{TunnelError, TunnelResult};
pub use probe::{SystemTunnelProbe, has_ipv4_address, link_is_up};

use std::fmt;

use chrono::{DateTime, Utc};

/// Capability to observe tunnel health.
#[allow(async_fn_in_trait)]
pub trait TunnelProbe {
    /// Probe the tunnel once.
    ///
    /// An absent or unhealthy interface is `Ok` with a failing
    /// [`InterfaceHealth`]; `Err` means the probe itself could not run.
    async fn check(&mut self) -> TunnelResult<InterfaceHealth>;
}

/// Result of one health probe. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceHealth {
    /// The interface exists.
    pub present: bool,
    /// The interface is up.
    pub up: bool,
    /// The interface holds an IPv4 address.
    pub has_address: bool,
    /// The gateway answered a ping through the interface.
    pub gateway_reachable: bool,
    /// When the probe ran.
    pub observed_at: DateTime<Utc>,
}

impl InterfaceHealth {
    /// Health of an interface that does not exist.
    pub fn absent() -> Self {
        Self {
            present: false,
            up: false,
            has_address: false,
            gateway_reachable: false,
            observed_at: Utc::now(),
        }
    }

    /// Health of a fully working interface.
    pub fn healthy() -> Self {
        Self {
            present: true,
            up: true,
            has_address: true,
            gateway_reachable: true,
            observed_at: Utc::now(),
        }
    }

    /// The first unmet condition, or `None` if healthy.
    pub fn failure(&self) -> Option<HealthFailure> {
        if !self.present {
            Some(HealthFailure::InterfaceMissing)
        } else if !self.up {
            Some(HealthFailure::InterfaceDown)
        } else if !self.has_address {
            Some(HealthFailure::NoAddress)
        } else if !self.gateway_reachable {
            Some(HealthFailure::GatewayUnreachable)
        } else {
            None
        }
    }

    /// Whether every condition holds.
    pub fn is_healthy(&self) -> bool {
        self.failure().is_none()
    }
}

/// Which health condition failed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthFailure {
    /// The interface does not exist (not yet connected).
    InterfaceMissing,
    /// The interface exists but is down.
    InterfaceDown,
    /// The interface has no IPv4 address.
    NoAddress,
    /// The gateway did not answer a ping in time.
    GatewayUnreachable,
}

impl fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HealthFailure::InterfaceMissing => "interface missing",
            HealthFailure::InterfaceDown => "interface down",
            HealthFailure::NoAddress => "interface has no address",
            HealthFailure::GatewayUnreachable => "gateway unreachable",
        };
        f.write_str(text)
    }
}
