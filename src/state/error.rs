//! Error types for persisted state.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from preparing or writing the state file.
#[derive(Debug, Error)]
pub enum StateError {
    /// The state directory cannot be created or restricted to the owner.
    #[error("Cannot secure state directory {path}: {source}")]
    Permission {
        /// Directory path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The state directory is open to group or others. It is never chmodded.
    #[error("State directory {path} has mode {mode:o}; restrict it to its owner (700)")]
    InsecureMode {
        /// Directory path.
        path: PathBuf,
        /// Observed permission bits.
        mode: u32,
    },

    /// Writing the state file failed.
    #[error("Failed to write state file {path}: {source}")]
    Write {
        /// State file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The state could not be serialized.
    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_mode_display() {
        let err = StateError::InsecureMode {
            path: PathBuf::from("/var/lib/portkeeper"),
            mode: 0o755,
        };
        let msg = err.to_string();
        assert!(msg.contains("755"));
        assert!(msg.contains("/var/lib/portkeeper"));
    }
}
