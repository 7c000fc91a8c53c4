//! Cooperative shutdown on SIGTERM/SIGINT.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

/// Create a linked trigger and signal.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Requests shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes shutdown requests.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep until `deadline`. Returns false if shutdown was requested
    /// first.
    pub async fn sleep_until(&mut self, deadline: Instant) -> bool {
        loop {
            if *self.rx.borrow_and_update() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Trigger dropped; nobody can cancel any more.
                        tokio::time::sleep_until(deadline).await;
                        return true;
                    }
                }
            }
        }
    }
}

/// Trigger shutdown on the first SIGTERM or SIGINT.
pub fn listen_for_signals(trigger: ShutdownTrigger) -> std::io::Result<JoinHandle<()>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        info!("Received {}, shutting down", name);
        trigger.trigger();
    }))
}
