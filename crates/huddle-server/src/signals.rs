//! Cooperative shutdown and Unix signal handling.
//!
//! The relay's accept loop polls a [`ShutdownHandle`] between bounded accept
//! attempts. [`SignalHandler`] trips the same handle on SIGTERM/SIGINT.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A handle for triggering or checking shutdown status.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    /// Creates a handle that has not been triggered.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Triggers a shutdown.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns true if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Returns a future that completes when shutdown is triggered.
    pub fn wait(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.rx.clone(),
        }
    }
}

/// A signal that completes when shutdown is signaled.
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Waits for the shutdown signal.
    pub async fn wait(mut self) {
        // Also returns if every sender is gone.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

/// Translates process signals into a shutdown.
pub struct SignalHandler {
    shutdown: ShutdownHandle,
}

impl SignalHandler {
    /// Creates a signal handler that trips `shutdown`.
    pub fn new(shutdown: ShutdownHandle) -> Self {
        Self { shutdown }
    }

    /// Spawns the signal listener task.
    ///
    /// This should be called once at server startup.
    #[cfg(unix)]
    pub fn spawn_listener(&self) {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(error = %e, "Failed to install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
            }
            shutdown.trigger();

            debug!("Signal listener stopped");
        });
    }

    /// Non-Unix implementation: Ctrl+C only.
    #[cfg(not(unix))]
    pub fn spawn_listener(&self) {
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received Ctrl+C, initiating shutdown");
                shutdown.trigger();
            }
        });
    }

    /// Returns the handle tripped by this signal handler.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_handle() {
        let handle = ShutdownHandle::new();
        let other = handle.clone();

        assert!(!handle.is_shutdown());
        other.trigger();
        assert!(handle.is_shutdown());
    }

    #[tokio::test]
    async fn shutdown_handle_wait() {
        let handle = ShutdownHandle::new();

        let wait_handle = handle.clone();
        let wait_task = tokio::spawn(async move {
            wait_handle.wait().wait().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.trigger();

        let result = tokio::time::timeout(Duration::from_millis(100), wait_task).await;
        assert!(result.is_ok());
        assert!(result.unwrap().unwrap());
    }

    #[tokio::test]
    async fn wait_returns_immediately_once_triggered() {
        let handle = ShutdownHandle::new();
        handle.trigger();
        let result = tokio::time::timeout(Duration::from_millis(50), handle.wait().wait()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn signal_handler_shares_handle() {
        let handle = ShutdownHandle::new();
        let signals = SignalHandler::new(handle.clone());
        signals.shutdown_handle().trigger();
        assert!(handle.is_shutdown());
    }
}
