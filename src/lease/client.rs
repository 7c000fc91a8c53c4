//! Lease acquisition, renewal and release for the TCP/UDP pair.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::codec::{MappingRequest, MappingResponse, Protocol};
use super::error::{LeaseError, LeaseResult};
use super::MappingGateway;
use crate::config::NatPmpConfig;

/// A granted port mapping for one protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLease {
    /// Protocol mapped.
    pub protocol: Protocol,
    /// Internal port.
    pub internal_port: u16,
    /// External port assigned by the gateway.
    pub external_port: u16,
    /// Lifetime granted by the gateway.
    pub lifetime_seconds: u32,
    /// When the gateway answered.
    pub acquired_at: DateTime<Utc>,
    /// When the lease must be renewed; always before expiry.
    pub renew_at: DateTime<Utc>,
}

impl PortLease {
    /// When the gateway reclaims the mapping.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + TimeDelta::seconds(i64::from(self.lifetime_seconds))
    }
}

/// The active TCP and UDP leases. Both carry the same external port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeasePair {
    /// TCP lease.
    pub tcp: PortLease,
    /// UDP lease.
    pub udp: PortLease,
}

impl LeasePair {
    /// Pair two leases, rejecting mismatched external ports.
    pub fn new(tcp: PortLease, udp: PortLease) -> LeaseResult<Self> {
        if tcp.external_port != udp.external_port {
            return Err(LeaseError::PortMismatch {
                tcp: tcp.external_port,
                udp: udp.external_port,
            });
        }
        Ok(Self { tcp, udp })
    }

    /// The shared external port.
    pub fn external_port(&self) -> u16 {
        self.tcp.external_port
    }

    /// The earlier of the two renewal deadlines.
    pub fn renew_at(&self) -> DateTime<Utc> {
        self.tcp.renew_at.min(self.udp.renew_at)
    }

    /// A pair past its renewal deadline is stale and must not be trusted.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.renew_at()
    }

    /// Time left until renewal, zero if already due.
    pub fn time_to_renew(&self, now: DateTime<Utc>) -> Duration {
        (self.renew_at() - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Settings for requesting leases.
#[derive(Debug, Clone, Copy)]
pub struct LeaseSettings {
    /// Internal port sent with every request.
    pub internal_port: u16,
    /// Requested lifetime in seconds.
    pub lifetime: u32,
    /// Upper bound on time between renewals.
    pub refresh_interval: Duration,
    /// Fraction of the granted lifetime after which to renew.
    pub renewal_fraction: f64,
}

impl From<&NatPmpConfig> for LeaseSettings {
    fn from(config: &NatPmpConfig) -> Self {
        Self {
            internal_port: config.internal_port,
            lifetime: config.lease_lifetime,
            refresh_interval: Duration::from_secs(config.refresh_interval),
            renewal_fraction: config.renewal_fraction,
        }
    }
}

impl LeaseSettings {
    /// Renewal deadline for a lease granted at `acquired_at`.
    ///
    /// `min(refresh_interval, lifetime * renewal_fraction)` after the grant.
    pub fn renew_at(&self, acquired_at: DateTime<Utc>, granted_lifetime: u32) -> DateTime<Utc> {
        let fraction_ms = (f64::from(granted_lifetime) * self.renewal_fraction * 1000.0) as i64;
        let refresh_ms = i64::try_from(self.refresh_interval.as_millis()).unwrap_or(i64::MAX);
        acquired_at + TimeDelta::milliseconds(fraction_ms.min(refresh_ms))
    }
}

/// Outcome of a successful acquire or renew.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOutcome {
    /// The newly active pair.
    pub pair: LeasePair,
    /// External port held before, when it differs from the new one.
    pub changed_from: Option<u16>,
    /// Whether a lease was held before this request.
    pub renewed: bool,
}

/// Requests and renews the TCP/UDP lease pair. Sole owner of the active pair.
pub struct LeaseClient<G> {
    gateway: G,
    settings: LeaseSettings,
    active: Option<LeasePair>,
}

impl<G: MappingGateway> LeaseClient<G> {
    /// Create a client with no active lease.
    pub fn new(gateway: G, settings: LeaseSettings) -> Self {
        Self {
            gateway,
            settings,
            active: None,
        }
    }

    /// The active pair, if any. May be stale; check [`LeasePair::is_fresh`].
    pub fn active(&self) -> Option<&LeasePair> {
        self.active.as_ref()
    }

    /// Adopt a pair loaded from persisted state.
    pub fn restore(&mut self, pair: LeasePair) {
        debug!(
            "Restored lease on port {} (renew at {})",
            pair.external_port(),
            pair.renew_at()
        );
        self.active = Some(pair);
    }

    /// Request TCP then UDP and promote the pair only if both succeed.
    ///
    /// On any failure the previously active pair stays in place and no
    /// partial result is kept. Renewals suggest the held external port.
    pub async fn acquire_or_renew(&mut self) -> LeaseResult<LeaseOutcome> {
        let previous = self.active.as_ref().map(LeasePair::external_port);
        let suggested = previous.unwrap_or(0);

        let tcp = self.request(Protocol::Tcp, suggested).await?;
        let udp = self.request(Protocol::Udp, suggested).await?;
        let pair = LeasePair::new(tcp, udp)?;

        let port = pair.external_port();
        let changed_from = previous.filter(|&old| old != port);
        match (previous, changed_from) {
            (None, _) => info!("Acquired port {} (TCP+UDP)", port),
            (Some(_), Some(old)) => warn!("Gateway changed port from {} to {}", old, port),
            (Some(_), None) => debug!("Renewed port {}", port),
        }

        self.active = Some(pair.clone());
        Ok(LeaseOutcome {
            pair,
            changed_from,
            renewed: previous.is_some(),
        })
    }

    /// Release both mappings with lifetime-zero requests.
    ///
    /// Failures are logged, never raised. Returns true when both releases
    /// succeeded, in which case the active pair is cleared.
    pub async fn release(&mut self) -> bool {
        let Some(pair) = self.active.clone() else {
            return true;
        };

        let mut released = true;
        for lease in [&pair.tcp, &pair.udp] {
            let request = MappingRequest {
                protocol: lease.protocol,
                internal_port: lease.internal_port,
                suggested_external_port: 0,
                lifetime: 0,
            };
            match self.gateway.map(request).await {
                Ok(_) => info!("Released {} mapping for port {}", lease.protocol, lease.external_port),
                Err(e) => {
                    warn!("Failed to release {} mapping: {}", lease.protocol, e);
                    released = false;
                }
            }
        }

        if released {
            self.active = None;
        }
        released
    }

    /// Best-effort query of the gateway's public address.
    pub async fn public_address(&mut self) -> Option<Ipv4Addr> {
        match self.gateway.public_address().await {
            Ok(addr) => Some(addr),
            Err(e) => {
                debug!("Public address query failed: {}", e);
                None
            }
        }
    }

    async fn request(&mut self, protocol: Protocol, suggested: u16) -> LeaseResult<PortLease> {
        let MappingResponse {
            internal_port,
            external_port,
            lifetime,
            ..
        } = self
            .gateway
            .map(MappingRequest {
                protocol,
                internal_port: self.settings.internal_port,
                suggested_external_port: suggested,
                lifetime: self.settings.lifetime,
            })
            .await?;

        if lifetime == 0 {
            return Err(LeaseError::ZeroLifetime(protocol));
        }

        let acquired_at = Utc::now();
        Ok(PortLease {
            protocol,
            internal_port,
            external_port,
            lifetime_seconds: lifetime,
            acquired_at,
            renew_at: self.settings.renew_at(acquired_at, lifetime),
        })
    }
}
