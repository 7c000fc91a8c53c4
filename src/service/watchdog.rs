//! systemd readiness and watchdog notifications.

use std::io::ErrorKind;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::time::Duration;

use tracing::{debug, warn};

/// Receives lifecycle notifications for the process supervisor.
pub trait Notifier {
    /// Initialization finished.
    fn ready(&mut self);

    /// Liveness heartbeat.
    fn heartbeat(&mut self);

    /// Human-readable status line.
    fn status(&mut self, status: &str);

    /// Shutdown has begun.
    fn stopping(&mut self);
}

/// `sd_notify` over `$NOTIFY_SOCKET`. A no-op outside systemd.
pub struct SystemdNotifier {
    target: Option<(UnixDatagram, SocketAddr)>,
}

impl SystemdNotifier {
    /// Connect to the socket named by `$NOTIFY_SOCKET`, if set.
    pub fn from_env() -> Self {
        match std::env::var("NOTIFY_SOCKET") {
            Ok(value) => Self::with_socket(&value),
            Err(_) => {
                debug!("NOTIFY_SOCKET not set; supervisor notifications disabled");
                Self::disabled()
            }
        }
    }

    /// Notifier that sends nothing.
    pub fn disabled() -> Self {
        Self { target: None }
    }

    /// Notify the socket at `name`; a leading `@` names an abstract socket.
    pub fn with_socket(name: &str) -> Self {
        match Self::open(name) {
            Ok(target) => {
                debug!("Notifying supervisor via {}", name);
                Self {
                    target: Some(target),
                }
            }
            Err(e) => {
                warn!("Cannot use notify socket '{}': {}", name, e);
                Self::disabled()
            }
        }
    }

    fn open(name: &str) -> std::io::Result<(UnixDatagram, SocketAddr)> {
        let addr = match name.strip_prefix('@') {
            Some(abstract_name) => {
                use std::os::linux::net::SocketAddrExt;
                SocketAddr::from_abstract_name(abstract_name.as_bytes())?
            }
            None => SocketAddr::from_pathname(name)?,
        };
        let socket = UnixDatagram::unbound()?;
        socket.set_nonblocking(true)?;
        Ok((socket, addr))
    }

    /// Whether notifications are actually sent.
    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// The supervisor's watchdog timeout from `$WATCHDOG_USEC`, if any.
    pub fn watchdog_timeout() -> Option<Duration> {
        std::env::var("WATCHDOG_USEC")
            .ok()?
            .parse::<u64>()
            .ok()
            .map(Duration::from_micros)
    }

    fn send(&mut self, message: &str) {
        let Some((socket, addr)) = &self.target else {
            return;
        };
        match socket.send_to_addr(message.as_bytes(), addr) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Notify socket busy; dropped '{}'", message);
            }
            Err(e) => warn!("Failed to notify supervisor: {}", e),
        }
    }
}

impl Notifier for SystemdNotifier {
    fn ready(&mut self) {
        self.send("READY=1");
    }

    fn heartbeat(&mut self) {
        self.send("WATCHDOG=1");
    }

    fn status(&mut self, status: &str) {
        // One line per datagram field.
        let line = status.replace('\n', " ");
        self.send(&format!("STATUS={}", line));
    }

    fn stopping(&mut self) {
        self.send("STOPPING=1");
    }
}
