//! Error types for NAT-PMP leasing.

use std::time::Duration;

use thiserror::Error;

use super::codec::Protocol;

/// Malformed or unsuccessful NAT-PMP responses.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The response was shorter than its fixed layout.
    #[error("NAT-PMP reply too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Required length.
        expected: usize,
        /// Received length.
        actual: usize,
    },

    /// The response carried an unknown version.
    #[error("Unexpected NAT-PMP version {0}")]
    UnexpectedVersion(u8),

    /// The response opcode did not match the request.
    #[error("Unexpected NAT-PMP opcode {actual} (expected {expected})")]
    UnexpectedOpcode {
        /// Opcode matching the request.
        expected: u8,
        /// Opcode received.
        actual: u8,
    },

    /// The gateway answered with a non-zero result code.
    #[error("NAT-PMP request failed with code {code} ({description})")]
    ResultCode {
        /// Result code.
        code: u16,
        /// Description of the code.
        description: &'static str,
    },
}

/// Errors from acquiring, renewing or releasing a lease.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Socket setup or I/O failed.
    #[error("NAT-PMP I/O error talking to {gateway}: {source}")]
    Io {
        /// Gateway address.
        gateway: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The gateway did not answer in time.
    #[error("Timed out after {timeout:?} waiting for NAT-PMP reply from {gateway}")]
    Timeout {
        /// Gateway address.
        gateway: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The reply was malformed or reported failure.
    #[error("NAT-PMP {protocol} mapping failed: {source}")]
    Protocol {
        /// Protocol of the request.
        protocol: Protocol,
        /// Decoding or result-code failure.
        #[source]
        source: CodecError,
    },

    /// The public address query failed.
    #[error("NAT-PMP public address query failed: {0}")]
    PublicAddress(#[source] CodecError),

    /// The gateway granted a zero-length lease.
    #[error("Gateway granted a zero lifetime for {0} mapping")]
    ZeroLifetime(Protocol),

    /// TCP and UDP were mapped to different external ports.
    #[error("TCP and UDP mapped to different external ports ({tcp} vs {udp})")]
    PortMismatch {
        /// External TCP port.
        tcp: u16,
        /// External UDP port.
        udp: u16,
    },
}

impl LeaseError {
    /// An inconsistent result rather than an unreachable gateway.
    pub fn is_integrity(&self) -> bool {
        matches!(self, LeaseError::PortMismatch { .. })
    }
}

/// Result type for leasing.
pub type LeaseResult<T> = Result<T, LeaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_mismatch_is_integrity() {
        let err = LeaseError::PortMismatch {
            tcp: 12345,
            udp: 23456,
        };
        assert!(err.is_integrity());
        assert!(err.to_string().contains("12345"));
        assert!(err.to_string().contains("23456"));
    }

    #[test]
    fn test_timeout_is_not_integrity() {
        let err = LeaseError::Timeout {
            gateway: "10.2.0.1:5351".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(!err.is_integrity());
        assert!(err.to_string().contains("10.2.0.1"));
    }
}
