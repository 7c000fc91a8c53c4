//! Downstream application (qBittorrent) port synchronization.

mod client;
mod error;
mod sync;

pub use client::QbittorrentClient;
pub use error::{AppError, AppResult};
pub use sync::{ApplicationPortSync, ReconcileOutcome};

use serde::{Deserialize, Serialize};

/// The application's listen port and bound interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationPortConfig {
    /// Inbound listen port.
    pub listen_port: u16,
    /// Interface the application binds to; empty means any.
    pub bound_interface: String,
}

/// Capability to read and write the application's listen settings.
#[allow(async_fn_in_trait)]
pub trait PreferencesApi {
    /// Application version; doubles as a reachability check.
    async fn version(&mut self) -> AppResult<String>;

    /// Current listen port and bound interface.
    async fn listen_settings(&mut self) -> AppResult<ApplicationPortConfig>;

    /// Set listen port and bound interface in one call.
    async fn set_listen_settings(&mut self, config: &ApplicationPortConfig) -> AppResult<()>;
}
