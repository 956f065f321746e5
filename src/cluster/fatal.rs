//! Process-ending conditions.
//!
//! Two situations cannot be recovered from without risking double ownership
//! of a shard or a node id:
//!
//! - this node's registration slot (or id reservation) is held by a foreign
//!   live session
//! - this node's registration (or id reservation) vanished while its session
//!   is still alive
//!
//! Components that detect them hand the error to a [`FatalHandler`] instead of
//! returning it to a caller that might drop it. The default handler,
//! [`ExitProcess`], terminates the process.

use std::fmt;
use std::sync::Arc;

use tracing::error;

use super::error::ClusterError;
use crate::constants::FATAL_EXIT_CODE;

/// Receives fatal coordination errors.
pub trait FatalHandler: Send + Sync + fmt::Debug {
    fn on_fatal(&self, error: &ClusterError);
}

/// Shared fatal handler.
pub type SharedFatalHandler = Arc<dyn FatalHandler>;

/// Logs the error and exits with [`FATAL_EXIT_CODE`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitProcess;

impl FatalHandler for ExitProcess {
    fn on_fatal(&self, err: &ClusterError) {
        error!(
            error = %err,
            kind = err.as_metric_label(),
            exit_code = FATAL_EXIT_CODE,
            "Fatal coordination error, terminating process"
        );
        std::process::exit(FATAL_EXIT_CODE);
    }
}

/// Default handler used when none is configured.
pub fn default_handler() -> SharedFatalHandler {
    Arc::new(ExitProcess)
}

#[cfg(any(test, feature = "test-utilities"))]
pub use recording::RecordingFatalHandler;

#[cfg(any(test, feature = "test-utilities"))]
mod recording {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;

    /// Records fatal errors instead of exiting.
    #[derive(Debug, Default)]
    pub struct RecordingFatalHandler {
        errors: Mutex<Vec<String>>,
        labels: Mutex<Vec<&'static str>>,
        notify: Notify,
    }

    impl RecordingFatalHandler {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Rendered messages of every recorded error.
        pub fn messages(&self) -> Vec<String> {
            self.errors.lock().map(|e| e.clone()).unwrap_or_default()
        }

        /// Metric labels of every recorded error, e.g. `node_id_collision`.
        pub fn kinds(&self) -> Vec<&'static str> {
            self.labels.lock().map(|l| l.clone()).unwrap_or_default()
        }

        pub fn count(&self) -> usize {
            self.kinds().len()
        }

        /// Wait until at least one error has been recorded.
        pub async fn wait_for_fatal(&self, timeout: Duration) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let notified = self.notify.notified();
                if self.count() > 0 {
                    return true;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return self.count() > 0;
                }
            }
        }
    }

    impl FatalHandler for RecordingFatalHandler {
        fn on_fatal(&self, err: &ClusterError) {
            error!(error = %err, "Fatal coordination error recorded");
            if let Ok(mut errors) = self.errors.lock() {
                errors.push(err.to_string());
            }
            if let Ok(mut labels) = self.labels.lock() {
                labels.push(err.as_metric_label());
            }
            self.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_recording_handler_collects_errors() {
        let handler = RecordingFatalHandler::new();
        assert!(!handler.wait_for_fatal(Duration::from_millis(10)).await);

        handler.on_fatal(&ClusterError::RegistrationLost(9));
        assert!(handler.wait_for_fatal(Duration::from_millis(10)).await);
        assert_eq!(handler.kinds(), vec!["registration_lost"]);
        assert!(handler.messages()[0].contains("0x0009"));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_later_error() {
        let handler = RecordingFatalHandler::new();
        let waiter = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.wait_for_fatal(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        handler.on_fatal(&ClusterError::NodeIdCollision { node_id: 8, owner: Some(2) });
        assert!(waiter.await.unwrap());
    }
}
