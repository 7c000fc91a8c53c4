//! Audit logging for portkeeper.
//!
//! Security and lease events go to syslog as JSON with the `PORTKEEPER` tag.
//! Diagnostic logging is separate and goes to stderr via `tracing`.
//!
//! # Usage
//!
//! ```ignore
//! use portkeeper::telemetry::{self, AuditEvent};
//!
//! // Initialize at startup; audit() falls back to a null logger otherwise.
//! telemetry::init_logger()?;
//!
//! telemetry::audit().log(AuditEvent::KillswitchRemoved { uid: 985 });
//! ```
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"port_changed","old_port":12345,"new_port":23456,"public_address":null}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, TimestampedEvent};
pub use syslog::{AuditLogger, SYSLOG_TAG, audit, init_logger};
