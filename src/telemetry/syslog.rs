//! Syslog integration for audit logging.
//!
//! All audit events are logged to syslog with the `PORTKEEPER` tag.

use std::sync::{Mutex, OnceLock};

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "PORTKEEPER";

/// Global audit logger instance.
static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Used until (or instead of) a syslog connection.
static NULL_LOGGER: AuditLogger = AuditLogger::new_null();

/// Audit logger that writes structured JSON events to syslog.
///
/// Uses interior mutability (Mutex) to allow logging from shared references,
/// which is necessary since the logger is stored in a global OnceLock.
pub struct AuditLogger {
    /// None indicates a null logger.
    writer: Option<Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>>,
}

impl AuditLogger {
    /// Create a new audit logger connected to the local syslog socket.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer =
            syslog::unix(formatter).map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Create a null audit logger that discards all events.
    pub const fn new_null() -> Self {
        Self { writer: None }
    }

    /// Log an audit event to syslog as timestamped JSON.
    ///
    /// A null logger still emits the event at debug level.
    pub fn log(&self, event: AuditEvent) {
        let json = match serde_json::to_string(&event.with_timestamp()) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let Some(ref writer) = self.writer else {
            debug!("Audit event (syslog unavailable): {}", json);
            return;
        };

        match writer.lock() {
            Ok(mut writer) => {
                if let Err(e) = writer.info(&json) {
                    error!("Failed to write to syslog: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to acquire syslog writer lock: {}", e);
            }
        }
        debug!("Logged audit event: {}", json);
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        self.writer.is_none()
    }
}

/// Initialize the global audit logger.
///
/// Returns an error if the syslog connection fails or if already
/// initialized. Until this succeeds, [`audit`] hands out a null logger.
pub fn init_logger() -> Result<(), TelemetryError> {
    let logger = AuditLogger::new()?;

    AUDIT_LOGGER
        .set(logger)
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    Ok(())
}

/// Get the global audit logger, or a null logger if syslog is not set up.
pub fn audit() -> &'static AuditLogger {
    AUDIT_LOGGER.get().unwrap_or(&NULL_LOGGER)
}
