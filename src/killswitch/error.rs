//! Error types for the firewall killswitch.

use thiserror::Error;

use crate::process::CommandError;

/// Errors from managing the killswitch chain.
#[derive(Debug, Error)]
pub enum KillswitchError {
    /// An iptables invocation failed.
    #[error("iptables failed: {0}")]
    Command(#[from] CommandError),

    /// The confined user does not exist.
    #[error("User '{0}' not found")]
    UnknownUser(String),

    /// The user database could not be read.
    #[error("Failed to look up user '{user}': {source}")]
    UserLookup {
        /// User name.
        user: String,
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },
}

impl KillswitchError {
    /// A missing `iptables` binary is fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            KillswitchError::Command(e) => e.is_missing_tool(),
            KillswitchError::UnknownUser(_) | KillswitchError::UserLookup { .. } => false,
        }
    }
}

/// Result type for killswitch operations.
pub type KillswitchResult<T> = Result<T, KillswitchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_iptables_is_fatal() {
        let err = KillswitchError::from(CommandError::NotFound {
            program: "iptables".to_string(),
        });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_failed_rule_is_not_fatal() {
        let err = KillswitchError::from(CommandError::Failed {
            cmd: "iptables -w -t filter -N PORTKEEPER-KS".to_string(),
            code: 1,
            stderr: "Chain already exists.".to_string(),
        });
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("Chain already exists"));
    }

    #[test]
    fn test_unknown_user_display() {
        let err = KillswitchError::UnknownUser("qbittorrent".to_string());
        assert!(err.to_string().contains("qbittorrent"));
    }
}
