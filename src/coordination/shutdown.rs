//! Graceful Shutdown Handler
//!
//! Stops signal intake, lets in-flight orders reach a terminal state, then
//! flushes the ledger. Each phase is bounded by its own timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Skip the order drain
    Emergency,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Emergency => write!(f, "emergency"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight orders (default: 120s)
    pub order_drain_timeout_secs: u64,
    /// Time to wait for the final ledger flush (default: 30s)
    pub flush_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            order_drain_timeout_secs: 120,
            flush_timeout_secs: 30,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not shutting down
    Running,
    /// No new signals are admitted
    StoppingIntake,
    /// Waiting for in-flight submissions to resolve
    DrainingOrders,
    /// Writing the final ledger snapshot
    Flushing,
    /// Shutdown complete
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingIntake => write!(f, "stopping_intake"),
            ShutdownPhase::DrainingOrders => write!(f, "draining_orders"),
            ShutdownPhase::Flushing => write!(f, "flushing"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Shutdown errors
#[derive(Debug, Clone, Error)]
pub enum ShutdownError {
    #[error("order drain timed out after {0}s")]
    DrainTimeout(u64),
    #[error("ledger flush failed: {0}")]
    FlushFailed(String),
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    requested: watch::Sender<Option<ShutdownSignal>>,
    phase: watch::Sender<ShutdownPhase>,
}

impl GracefulShutdown {
    /// Create a new graceful shutdown handler
    pub fn new(config: ShutdownConfig) -> Self {
        let (requested, _) = watch::channel(None);
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            requested,
            phase,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    /// Get a receiver for phase changes
    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.borrow().is_some()
    }

    /// Get current shutdown phase
    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        let first = self.requested.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });

        if first {
            info!("Shutdown requested: {}", signal);
        } else {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
        }
    }

    /// Token for tasks that must stop when shutdown is requested
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            requested: self.requested.subscribe(),
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Execute the shutdown sequence:
    /// 1. Stop accepting new signals
    /// 2. Wait for in-flight orders (skipped on emergency)
    /// 3. Flush the ledger
    pub async fn execute<F1, Fut1, F2, Fut2, F3, Fut3>(
        &self,
        stop_intake: F1,
        drain_orders: F2,
        flush: F3,
    ) -> Result<(), ShutdownError>
    where
        F1: FnOnce() -> Fut1,
        Fut1: Future<Output = ()>,
        F2: FnOnce() -> Fut2,
        Fut2: Future<Output = bool>,
        F3: FnOnce() -> Fut3,
        Fut3: Future<Output = Result<(), String>>,
    {
        let start = std::time::Instant::now();
        let signal = (*self.requested.borrow()).unwrap_or(ShutdownSignal::Graceful);
        let mut result = Ok(());

        // Phase 1: Stop intake
        self.set_phase(ShutdownPhase::StoppingIntake);
        stop_intake().await;
        debug!("Signal intake stopped");

        // Phase 2: Drain in-flight orders
        self.set_phase(ShutdownPhase::DrainingOrders);
        if signal == ShutdownSignal::Emergency {
            warn!("Emergency shutdown, not waiting for in-flight orders");
        } else {
            let drain_timeout = Duration::from_secs(self.config.order_drain_timeout_secs);
            match tokio::time::timeout(drain_timeout, drain_orders()).await {
                Ok(true) => info!("All in-flight orders resolved"),
                Ok(false) => warn!("Some orders may not have completed during drain"),
                Err(_) => {
                    error!(
                        "Order drain timeout after {}s, proceeding to flush",
                        self.config.order_drain_timeout_secs
                    );
                    result = Err(ShutdownError::DrainTimeout(
                        self.config.order_drain_timeout_secs,
                    ));
                }
            }
        }

        // Phase 3: Flush
        self.set_phase(ShutdownPhase::Flushing);
        let flush_timeout = Duration::from_secs(self.config.flush_timeout_secs);
        match tokio::time::timeout(flush_timeout, flush()).await {
            Ok(Ok(())) => debug!("Ledger flushed"),
            Ok(Err(e)) => {
                error!("Ledger flush failed: {}", e);
                result = result.and(Err(ShutdownError::FlushFailed(e)));
            }
            Err(_) => {
                error!("Ledger flush timeout after {}s", self.config.flush_timeout_secs);
                result = result.and(Err(ShutdownError::FlushFailed("timeout".to_string())));
            }
        }

        self.set_phase(ShutdownPhase::Complete);
        info!("Shutdown completed in {:?}", start.elapsed());
        result
    }
}

/// Token for checking shutdown status in async tasks
#[derive(Clone)]
pub struct ShutdownToken {
    requested: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.borrow().is_some()
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        match self.requested.wait_for(|s| s.is_some()).await {
            Ok(signal) => (*signal).unwrap_or(ShutdownSignal::Emergency),
            // Coordinator dropped
            Err(_) => ShutdownSignal::Emergency,
        }
    }
}

/// Request a graceful shutdown on Ctrl+C, an emergency one on the second
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C");
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received second Ctrl+C");
            shutdown.request_shutdown(ShutdownSignal::Emergency);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_phase_display() {
        assert_eq!(ShutdownPhase::Running.to_string(), "running");
        assert_eq!(ShutdownPhase::DrainingOrders.to_string(), "draining_orders");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_shutdown_request() {
        let shutdown = GracefulShutdown::with_defaults();
        let mut token = shutdown.token();

        assert!(!shutdown.is_shutdown_requested());
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Running);

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        assert!(shutdown.is_shutdown_requested());
        assert!(token.is_shutdown_requested());

        // Duplicate request should be ignored
        shutdown.request_shutdown(ShutdownSignal::Emergency);
        assert_eq!(token.wait_for_shutdown().await, ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn test_execute_runs_phases_in_order() {
        let shutdown = GracefulShutdown::with_defaults();
        shutdown.request_shutdown(ShutdownSignal::Graceful);
        let drained = AtomicBool::new(false);

        let result = shutdown
            .execute(
                || async {},
                || async {
                    drained.store(true, Ordering::SeqCst);
                    true
                },
                || async {
                    assert!(drained.load(Ordering::SeqCst));
                    Ok(())
                },
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_emergency_skips_drain() {
        let shutdown = GracefulShutdown::with_defaults();
        shutdown.request_shutdown(ShutdownSignal::Emergency);
        let drained = AtomicBool::new(false);

        shutdown
            .execute(
                || async {},
                || async {
                    drained.store(true, Ordering::SeqCst);
                    true
                },
                || async { Ok(()) },
            )
            .await
            .unwrap();

        assert!(!drained.load(Ordering::SeqCst));
    }
}
