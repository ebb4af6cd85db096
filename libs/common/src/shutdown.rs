//! Graceful shutdown utilities
//!
//! Signal handling plus a deadline for the shutdown sequence itself.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Source of a shutdown request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Ctrl+C (SIGINT)
    Interrupt,
    /// SIGTERM (Unix only)
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "interrupt signal (CTRL + C)"),
            ShutdownSignal::Terminate => write!(f, "terminate signal (SIGTERM)"),
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
///
/// # Example
///
/// ```ignore
/// let signal = common::shutdown::wait_for_shutdown().await;
/// info!("starting shutdown ... (caused by {})", signal);
/// ```
pub async fn wait_for_shutdown() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(
                    "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => ShutdownSignal::Terminate,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ShutdownSignal::Interrupt
    }
}

/// Run a shutdown sequence under a deadline
///
/// Returns `None` when the deadline fired before `sequence` finished.
pub async fn run_with_watchdog<F, T>(deadline: Duration, sequence: F) -> Option<T>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(deadline, sequence).await {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Shutdown watchdog fired after {:?}", deadline);
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_passes_result() {
        let result = run_with_watchdog(Duration::from_millis(500), async { 3 }).await;
        assert_eq!(result, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires() {
        let result = run_with_watchdog(Duration::from_millis(500), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        assert_eq!(result, None);
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(
            ShutdownSignal::Interrupt.to_string(),
            "interrupt signal (CTRL + C)"
        );
    }
}
