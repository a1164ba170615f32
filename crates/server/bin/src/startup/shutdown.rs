//! Graceful Shutdown Module
//!
//! Every background loop of the server takes a `watch::Receiver<bool>` and
//! exits once it flips to `true`. [`GracefulShutdown`] owns the sender, turns
//! SIGINT/SIGTERM into a shutdown, and drains the spawned tasks with a
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Shutdown configuration
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Maximum time to wait for background tasks after the signal
    pub timeout: Duration,
    /// Install SIGINT/SIGTERM handlers
    pub enable_signals: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            enable_signals: true,
        }
    }
}

/// Reason for shutdown
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// SIGTERM signal received
    SigTerm,
    /// SIGINT signal received (Ctrl+C)
    SigInt,
    /// A component requested it
    Programmatic(String),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::SigTerm => write!(f, "SIGTERM"),
            ShutdownReason::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            ShutdownReason::Programmatic(reason) => write!(f, "Programmatic: {}", reason),
        }
    }
}

/// Graceful shutdown coordinator
#[derive(Clone)]
pub struct GracefulShutdown {
    stop_tx: Arc<watch::Sender<bool>>,
    reason_tx: Arc<watch::Sender<Option<ShutdownReason>>>,
    config: Arc<ShutdownConfig>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (reason_tx, _) = watch::channel(None);
        Self {
            stop_tx: Arc::new(stop_tx),
            reason_tx: Arc::new(reason_tx),
            config: Arc::new(config),
        }
    }

    /// Receiver handed to a background loop
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Trigger shutdown; only the first reason is kept
    pub fn shutdown(&self, reason: ShutdownReason) {
        let first = self.reason_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if first {
            info!(reason = %reason, "Triggering shutdown");
        }
        self.stop_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason_tx.borrow().clone()
    }

    /// Wait until shutdown is triggered
    pub async fn wait(&self) -> Option<ShutdownReason> {
        let mut rx = self.reason_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason
    }

    /// Turn the first SIGINT or SIGTERM into a shutdown
    pub fn start_signal_handler(&self) {
        if !self.config.enable_signals {
            return;
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                match signal::ctrl_c().await {
                    Ok(()) => ShutdownReason::SigInt,
                    Err(e) => {
                        error!(error = %e, "Failed to register ctrl-c handler");
                        std::future::pending().await
                    }
                }
            };

            let term = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sig) => {
                        sig.recv().await;
                        ShutdownReason::SigTerm
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to register SIGTERM handler");
                        std::future::pending().await
                    }
                }
            };

            let reason = tokio::select! {
                reason = ctrl_c => reason,
                reason = term => reason,
            };
            coordinator.shutdown(reason);
        });
    }

    /// Await every task, aborting the stragglers once the timeout elapses
    ///
    /// Returns `true` when all tasks finished in time.
    pub async fn drain(&self, tasks: Vec<(&'static str, JoinHandle<()>)>) -> bool {
        info!(tasks = tasks.len(), "Draining background tasks");

        let mut all_done = true;
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        for (name, mut handle) in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, &mut handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) => {
                    error!(task = name, error = %e, "Task failed during shutdown");
                    all_done = false;
                }
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                    all_done = false;
                }
            }
        }
        all_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> GracefulShutdown {
        GracefulShutdown::new(ShutdownConfig {
            timeout: Duration::from_millis(200),
            enable_signals: false,
        })
    }

    #[tokio::test]
    async fn test_shutdown_flips_subscribers() {
        let shutdown = coordinator();
        let mut rx = shutdown.subscribe();
        assert!(!shutdown.is_shutting_down());

        shutdown.shutdown(ShutdownReason::SigInt);

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let shutdown = coordinator();
        let waiter = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.wait().await }
        });

        shutdown.shutdown(ShutdownReason::SigTerm);
        shutdown.shutdown(ShutdownReason::Programmatic("again".to_string()));

        assert_eq!(waiter.await.unwrap(), Some(ShutdownReason::SigTerm));
        assert_eq!(shutdown.reason(), Some(ShutdownReason::SigTerm));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let shutdown = coordinator();
        shutdown.shutdown(ShutdownReason::SigInt);

        assert!(*shutdown.subscribe().borrow());
        assert_eq!(shutdown.wait().await, Some(ShutdownReason::SigInt));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_aborts_stuck_tasks() {
        let shutdown = coordinator();
        let mut rx = shutdown.subscribe();
        let polite = tokio::spawn(async move {
            let _ = rx.wait_for(|stop| *stop).await;
        });
        let stuck = tokio::spawn(std::future::pending::<()>());

        shutdown.shutdown(ShutdownReason::Programmatic("test".to_string()));

        assert!(!shutdown.drain(vec![("polite", polite), ("stuck", stuck)]).await);
    }

    #[tokio::test]
    async fn test_drain_reports_clean_stop() {
        let shutdown = coordinator();
        let mut rx = shutdown.subscribe();
        let task = tokio::spawn(async move {
            let _ = rx.wait_for(|stop| *stop).await;
        });

        shutdown.shutdown(ShutdownReason::SigTerm);

        assert!(shutdown.drain(vec![("loop", task)]).await);
    }
}
