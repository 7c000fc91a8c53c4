//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `PORTKEEPER` tag.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::recovery::FaultKind;

/// Security and lease events worth an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// The service started.
    ServiceStart {
        /// Process ID.
        pid: u32,
        /// Tunnel interface watched.
        interface: String,
        /// Package version.
        version: String,
    },

    /// The service stopped.
    ServiceStop {
        /// Why it stopped.
        reason: String,
    },

    /// A lease pair was acquired with no previous lease held.
    LeaseAcquired {
        /// External port on both protocols.
        port: u16,
        /// Granted lifetime in seconds.
        lifetime_seconds: u32,
    },

    /// The gateway assigned a different external port on renewal.
    PortChanged {
        /// Port held before.
        old_port: u16,
        /// Port held now.
        new_port: u16,
        /// Gateway's public address, when known.
        public_address: Option<String>,
    },

    /// Lifetime-zero requests were sent at shutdown.
    LeaseReleased {
        /// External port released.
        port: u16,
        /// Whether the gateway acknowledged both releases.
        released: bool,
    },

    /// qBittorrent's listen settings were rewritten.
    AppReconfigured {
        /// New listen port.
        port: u16,
        /// New bound interface.
        interface: String,
    },

    /// The killswitch chain was (re)built.
    KillswitchInstalled {
        /// Confined UID.
        uid: u32,
        /// Permitted egress interface.
        interface: String,
    },

    /// The killswitch chain was removed.
    KillswitchRemoved {
        /// Confined UID.
        uid: u32,
    },

    /// The killswitch was found missing, altered or unverifiable.
    KillswitchBreach {
        /// What went wrong.
        detail: String,
        /// Security failures since the killswitch was last confirmed.
        security_failures: u32,
    },

    /// Consecutive failures reached the escalation threshold.
    FailureEscalated {
        /// Failed cycles in a row.
        consecutive_failures: u32,
        /// Kind of the failure that crossed the threshold.
        fault: FaultKind,
        /// Configured escalation action.
        action: String,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// RFC3339 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
