//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] fans a stop request out to every component holding a
//! clone. The engine distinguishes two phases: on the signal it stops polling
//! and drains in-flight deliveries; once the drain grace expires it
//! force-cancels whatever is left (safe under at-least-once delivery — the
//! last durable checkpoint is the resume point).

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Default drain grace before in-flight work is force-cancelled.
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Broadcast-based stop request shared across engine components.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    drain_grace: Duration,
}

impl ShutdownSignal {
    /// Create a signal with the default drain grace (30 seconds).
    pub fn new() -> Self {
        Self::with_drain_grace(DEFAULT_DRAIN_GRACE)
    }

    /// Create a signal with a custom drain grace.
    pub fn with_drain_grace(drain_grace: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            drain_grace,
        }
    }

    /// How long in-flight deliveries get to finish after the stop request.
    pub fn drain_grace(&self) -> Duration {
        self.drain_grace
    }

    /// Subscribe to stop notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Request a stop (programmatic or test-driven).
    pub fn trigger(&self) {
        info!("Shutdown requested");
        let _ = self.sender.send(());
    }

    /// Block until SIGTERM or Ctrl+C, then notify every subscriber.
    pub async fn listen_for_signals(&self) {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, draining pipeline"),
            _ = terminate => info!("Received SIGTERM, draining pipeline"),
        }

        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
