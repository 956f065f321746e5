//! Named background tasks with unified shutdown.
//!
//! Every long-lived task in the crate (registry actor loop, discovery actor
//! loop, sequence watchers, registration retry timers) is spawned through a
//! [`BackgroundTaskRegistry`] owned by its component. Shutting the component
//! down signals every task, waits a bounded time, then aborts stragglers.
//! Dropping the registry aborts whatever is still running.
//!
//! # Example
//!
//! ```rust,no_run
//! use shardherd::cluster::background_tasks::BackgroundTaskRegistry;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut tasks = BackgroundTaskRegistry::new();
//!
//!     tasks.spawn("pump", async {
//!         loop {
//!             tokio::time::sleep(Duration::from_secs(1)).await;
//!         }
//!     });
//!
//!     tasks.cancel("pump");
//!     tasks.shutdown_all().await;
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Registry of named tasks belonging to one component.
pub struct BackgroundTaskRegistry {
    tasks: HashMap<String, JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Spawn a named task that stops at the shutdown signal.
    ///
    /// A task already registered under `name` is aborted first.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.shutting_down {
            tracing::warn!(task = %name, "Ignoring spawn during shutdown");
            return;
        }

        if let Some(old) = self.tasks.remove(&name) {
            old.abort();
            tracing::debug!(task = %name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    tracing::debug!(task = %task_name, "Task completed");
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(task = %task_name, "Task received shutdown signal");
                }
            }
        });

        tracing::debug!(task = %name, "Spawned background task");
        self.tasks.insert(name, handle);
    }

    /// Abort the task registered under `name`, if any.
    ///
    /// Returns whether a task was still running.
    pub fn cancel(&mut self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                if running {
                    tracing::debug!(task = %name, "Cancelled background task");
                }
                running
            }
            None => false,
        }
    }

    /// Signal every task and wait up to five seconds for them to finish.
    pub async fn shutdown_all(&mut self) {
        self.shutdown_all_with_timeout(Duration::from_secs(5)).await;
    }

    /// Signal every task and wait up to `timeout`; stragglers are aborted.
    pub async fn shutdown_all_with_timeout(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        let _ = self.shutdown_tx.send(());
        let deadline = tokio::time::Instant::now() + timeout;

        for (name, handle) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!(task = %name, "Aborting task (timeout exceeded)");
                handle.abort();
                continue;
            }
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => tracing::debug!(task = %name, "Task shutdown complete"),
                Ok(Err(e)) => tracing::warn!(task = %name, error = %e, "Task panicked during shutdown"),
                Err(_) => tracing::warn!(task = %name, "Task did not respond to shutdown, aborted"),
            }
        }
    }

}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        if !self.shutting_down {
            let _ = self.shutdown_tx.send(());
            for (_, handle) in self.tasks.drain() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Wait until the runtime has dropped every clone of `held` but ours.
    async fn released(held: &Arc<()>) -> bool {
        for _ in 0..100 {
            if Arc::strong_count(held) == 1 {
                return true;
            }
            tokio::task::yield_now().await;
        }
        false
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let held = Arc::new(());
        let guard = held.clone();
        let mut tasks = BackgroundTaskRegistry::new();
        tasks.spawn("forever", async move {
            let _guard = guard;
            std::future::pending::<()>().await
        });

        tasks.shutdown_all_with_timeout(Duration::from_secs(1)).await;
        assert!(released(&held).await);
        assert!(!tasks.cancel("forever"));
    }

    #[tokio::test]
    async fn test_respawn_replaces_task() {
        let first = Arc::new(());
        let guard = first.clone();
        let mut tasks = BackgroundTaskRegistry::new();
        tasks.spawn("a", async move {
            let _guard = guard;
            std::future::pending::<()>().await
        });
        tasks.spawn("a", std::future::pending::<()>());

        assert!(released(&first).await);
        assert!(tasks.cancel("a"));
    }

    #[tokio::test]
    async fn test_cancel_aborts_only_named_task() {
        let cancelled = Arc::new(());
        let kept = Arc::new(());
        let (c, k) = (cancelled.clone(), kept.clone());
        let mut tasks = BackgroundTaskRegistry::new();
        tasks.spawn("timer", async move {
            let _guard = c;
            tokio::time::sleep(Duration::from_secs(60)).await
        });
        tasks.spawn("loop", async move {
            let _guard = k;
            std::future::pending::<()>().await
        });

        assert!(tasks.cancel("timer"));
        assert!(released(&cancelled).await);
        assert_eq!(Arc::strong_count(&kept), 2);
        assert!(!tasks.cancel("timer"));

        tasks.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_finished_task_is_not_reported_as_cancelled() {
        let mut tasks = BackgroundTaskRegistry::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        tasks.spawn("once", async move {
            flag.store(true, Ordering::SeqCst);
        });

        for _ in 0..100 {
            if ran.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ran.load(Ordering::SeqCst));
        assert!(!tasks.cancel("once"));
    }

    #[tokio::test]
    async fn test_spawn_ignored_during_shutdown() {
        let held = Arc::new(());
        let guard = held.clone();
        let mut tasks = BackgroundTaskRegistry::new();
        tasks.shutdown_all().await;
        tasks.spawn("late", async move {
            let _guard = guard;
        });
        assert!(!tasks.cancel("late"));
        assert!(released(&held).await);
    }
}
