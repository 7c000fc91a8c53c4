//! Stage failures and their classification.

use thiserror::Error;

use crate::app::AppError;
use crate::killswitch::KillswitchError;
use crate::lease::LeaseError;
use crate::recovery::FaultKind;
use crate::tunnel::{HealthFailure, TunnelError};

/// Why a controller stage failed.
#[derive(Debug, Error)]
pub enum StageError {
    /// The tunnel probe could not run.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// The tunnel is not usable yet.
    #[error("Tunnel not ready: {0}")]
    Unhealthy(HealthFailure),

    /// Lease request failed.
    #[error("Port mapping failed: {0}")]
    Lease(#[from] LeaseError),

    /// qBittorrent API call failed.
    #[error("qBittorrent: {0}")]
    App(#[from] AppError),

    /// Firewall operation failed.
    #[error("Killswitch: {0}")]
    Killswitch(#[from] KillswitchError),

    /// The killswitch chain is missing or altered.
    #[error("Killswitch chain missing or altered")]
    KillswitchBreach,
}

impl StageError {
    /// A required tool disappeared; retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        match self {
            StageError::Tunnel(e) => e.is_fatal(),
            StageError::Killswitch(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Classification for the recovery policy.
    pub fn kind(&self) -> FaultKind {
        match self {
            StageError::Lease(e) if e.is_integrity() => FaultKind::Integrity,
            StageError::App(e) if e.is_integrity() => FaultKind::Integrity,
            StageError::Killswitch(_) | StageError::KillswitchBreach => FaultKind::Security,
            _ => FaultKind::Transient,
        }
    }
}

/// Result type for controller stages.
pub type StageResult<T> = Result<T, StageError>;
