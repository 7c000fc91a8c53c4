//! Reconciliation of qBittorrent's listen port with the active lease.

use tracing::{debug, info};

use super::error::{AppError, AppResult};
use super::{ApplicationPortConfig, PreferencesApi};
use crate::lease::LeasePair;

/// Result of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The configuration now confirmed on the application.
    pub config: ApplicationPortConfig,
    /// Whether a write was issued.
    pub wrote: bool,
}

/// Keeps the application's listen port and interface on the desired values.
///
/// Owns the cache of the last confirmed configuration; the cache only moves
/// after a write has been read back.
pub struct ApplicationPortSync<A> {
    api: A,
    cached: Option<ApplicationPortConfig>,
}

impl<A: PreferencesApi> ApplicationPortSync<A> {
    /// Create a sync with an empty cache.
    pub fn new(api: A) -> Self {
        Self { api, cached: None }
    }

    /// Last confirmed configuration.
    pub fn cached(&self) -> Option<&ApplicationPortConfig> {
        self.cached.as_ref()
    }

    /// Check the application API answers. Returns its version.
    pub async fn probe(&mut self) -> AppResult<String> {
        self.api.version().await
    }

    /// Bring the application onto `lease`'s port bound to `interface`.
    ///
    /// Reads the application first. Writes once if either the observed or
    /// the cached configuration differs from the desired one, then reads
    /// back; a write that did not stick is an error.
    pub async fn reconcile(
        &mut self,
        lease: &LeasePair,
        interface: &str,
    ) -> AppResult<ReconcileOutcome> {
        let desired = ApplicationPortConfig {
            listen_port: lease.external_port(),
            bound_interface: interface.to_string(),
        };

        let observed = self.api.listen_settings().await?;
        if observed == desired && self.cached.as_ref() == Some(&desired) {
            debug!("qBittorrent already on port {} via {}", desired.listen_port, interface);
            return Ok(ReconcileOutcome {
                config: desired,
                wrote: false,
            });
        }

        info!(
            "Updating qBittorrent: port {} -> {}, interface '{}' -> '{}'",
            observed.listen_port, desired.listen_port, observed.bound_interface, interface
        );
        self.api.set_listen_settings(&desired).await?;

        let confirmed = self.api.listen_settings().await?;
        if confirmed != desired {
            return Err(AppError::ReadBackMismatch {
                expected_port: desired.listen_port,
                expected_interface: desired.bound_interface,
                observed_port: confirmed.listen_port,
                observed_interface: confirmed.bound_interface,
            });
        }

        self.cached = Some(confirmed.clone());
        Ok(ReconcileOutcome {
            config: confirmed,
            wrote: true,
        })
    }
}
