//! Supervised background tasks
//!
//! Work spawned from request handlers runs here instead of bare
//! `tokio::spawn`, so it is named, its failures and panics reach the logs,
//! and shutdown can wait for it.

use futures::FutureExt;
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::metrics::BACKGROUND_TASKS_TOTAL;

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named task. Errors and panics are logged, never propagated.
    pub fn spawn<F, E>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.tracker.spawn(async move {
            let status = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {
                    tracing::debug!(task = name, "Background task finished");
                    "ok"
                }
                Ok(Err(error)) => {
                    tracing::warn!(task = name, %error, "Background task failed");
                    "error"
                }
                Err(panic) => {
                    tracing::error!(task = name, panic = %panic_message(&panic), "Background task panicked");
                    "panic"
                }
            };
            BACKGROUND_TASKS_TOTAL.with_label_values(&[name, status]).inc();
        });
    }

    /// Token cancelled when shutdown starts; long-lived loops select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait up to `timeout` for in-flight tasks.
    ///
    /// # Returns
    /// `true` if every task finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();

        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for background tasks");
        }

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    remaining = self.tracker.len(),
                    timeout_secs = timeout.as_secs(),
                    "Background tasks still running at shutdown"
                );
                false
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_work() {
        let tasks = BackgroundTasks::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        tasks.spawn("slow", async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<(), String>(())
        });

        assert!(tasks.shutdown(Duration::from_secs(5)).await);
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(tasks.in_flight(), 0);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("explodes", async {
            if std::hint::black_box(true) {
                panic!("boom");
            }
            Ok::<(), String>(())
        });
        tasks.spawn("fails", async { Err::<(), _>("nope".to_string()) });

        assert!(tasks.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn shutdown_times_out_on_stuck_tasks() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), String>(())
        });

        assert!(!tasks.shutdown(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn shutdown_cancels_token() {
        let tasks = BackgroundTasks::new();
        let token = tasks.shutdown_token();
        tasks.spawn("loop", async move {
            token.cancelled().await;
            Ok::<(), String>(())
        });

        assert!(tasks.shutdown(Duration::from_secs(1)).await);
    }
}
