//! Graceful shutdown: one `CancellationToken` fans out to the HTTP server, the
//! bus listener and every session; tracked tasks are then drained.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Register a task to be awaited during shutdown.
    pub fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name, handle));
    }

    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel everything and wait up to `timeout` for tracked tasks.
    /// Tasks still running afterwards are aborted.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        self.token.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        info!(task_count = tasks.len(), timeout_secs = timeout.as_secs(), "shutting down");

        let names: Vec<&'static str> = tasks.iter().map(|(n, _)| *n).collect();
        let aborts: Vec<_> = tasks.iter().map(|(_, h)| h.abort_handle()).collect();
        let drain = futures::future::join_all(tasks.into_iter().map(|(_, h)| h));

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(?names, "shutdown timed out after {timeout:?}, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on ctrl-c (and SIGTERM on unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("ctrl-c received"),
        () = terminate => info!("SIGTERM received"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_propagation() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let child = token.child_token();
        assert!(!coord.is_shutting_down());
        token.cancel();
        assert!(coord.is_shutting_down());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_awaits_tracked_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let finished = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = finished.clone();
        coord.track(
            "worker",
            tokio::spawn(async move {
                token.cancelled().await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            }),
        );
        assert_eq!(coord.tracked(), 1);

        coord.graceful_shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(coord.tracked(), 0);
    }

    #[tokio::test]
    async fn graceful_shutdown_aborts_stragglers() {
        let coord = ShutdownCoordinator::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });
        let abort = handle.abort_handle();
        coord.track("stuck", handle);

        coord.graceful_shutdown(Duration::from_millis(50)).await;
        for _ in 0..10 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(coord.is_shutting_down());
        assert!(abort.is_finished());
    }
}
