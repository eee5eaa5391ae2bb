// Graceful shutdown coordination

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Coordinates shutdown between the signal handler and the server loop
pub struct ShutdownCoordinator {
    shutdown_notify: Arc<Notify>,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout_seconds: u64) -> Self {
        Self {
            shutdown_notify: Arc::new(Notify::new()),
            drain_timeout: Duration::from_secs(drain_timeout_seconds),
        }
    }

    /// Get a handle to wait for the shutdown signal
    pub fn subscribe(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: Arc::clone(&self.shutdown_notify),
        }
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        tracing::info!("initiating graceful shutdown");
        self.shutdown_notify.notify_waiters();
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

/// Handle components wait on for the shutdown signal
#[derive(Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Spawn the ctrl-c listener; returns the coordinator
pub fn install(drain_timeout_seconds: u64) -> Arc<ShutdownCoordinator> {
    let coordinator = Arc::new(ShutdownCoordinator::new(drain_timeout_seconds));
    let trigger = Arc::clone(&coordinator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.shutdown();
        }
    });
    coordinator
}
