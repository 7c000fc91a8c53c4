//! Error types for tunnel probing.

use thiserror::Error;

use crate::process::CommandError;

/// Errors from probing the tunnel interface.
///
/// An interface that is absent or down is not an error; it is reported
/// through [`super::InterfaceHealth`]. These variants cover the probe itself
/// failing to run.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A probe command could not be run.
    #[error("Tunnel probe failed: {0}")]
    Command(#[from] CommandError),
}

impl TunnelError {
    /// A missing `ip` or `ping` binary is fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            TunnelError::Command(e) => e.is_missing_tool(),
        }
    }
}

/// Result type for tunnel probing.
pub type TunnelResult<T> = Result<T, TunnelError>;
