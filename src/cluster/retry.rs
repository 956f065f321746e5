//! Retry policies for transient store failures.
//!
//! All retries in the crate go through the named `backon` policies below so
//! that backoff behavior is consistent and jittered.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `store_policy` | 10ms | 1s | 5 | Single store reads/writes |
//! | `registration_policy` | 50ms | 5s | 10 | Re-registration and re-claiming after reconnect |
//!
//! Fatal errors are never retried: callers pass a condition such as
//! [`ClusterError::is_retryable`](super::error::ClusterError::is_retryable).
//!
//! # Example
//!
//! ```rust,no_run
//! use shardherd::cluster::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let result = (|| async {
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .retry(retry::store_policy())
//!     .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Policy for individual store operations.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for re-registering a node (or re-claiming its id) after the store
/// connection comes back.
///
/// Long max delay and many retries: connectivity often flaps several times
/// before it settles.
pub fn registration_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Execute an async operation with the store retry policy.
pub async fn with_store_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation.retry(store_policy()).when(condition).await
}

/// Execute an async operation with the registration retry policy.
pub async fn with_registration_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation.retry(registration_policy()).when(condition).await
}
