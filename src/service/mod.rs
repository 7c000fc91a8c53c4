//! The long-running service.
//!
//! A single [`Controller`] runs one stage at a time: tunnel check,
//! qBittorrent check, lease mapping, port reconciliation, then monitoring
//! on three timers (health check, lease renewal, killswitch verify). Stage
//! outcomes go through the pure [`transition`] function; failures back off
//! in RECOVERING and resume the stage that failed. Every exit path runs the
//! same shutdown sequence: release the lease pair, remove the killswitch,
//! persist state.

mod controller;
mod error;
mod machine;
mod shutdown;
mod watchdog;

pub use controller::{Collaborators, Controller, ExitReason, ServiceContext};
pub use error::{StageError, StageResult};
pub use machine::{Effect, Event, Stage, State, Transition, transition};
pub use shutdown::{ShutdownSignal, ShutdownTrigger, channel, listen_for_signals};
pub use watchdog::{Notifier, SystemdNotifier};
