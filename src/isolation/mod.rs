//! Isolation module - bounding and separating untrusted work
//!
//! - [`with_timeout`]: race a future against a deadline
//! - [`run_blocking`]: interpreter work on a blocking thread, cancelled
//!   through a flag when abandoned
//! - [`worker`]: build and run inside a separate `ejudge worker` process
//!
//! The isolation module does NOT:
//! - Classify failures (managers turn timeouts into test cases)
//! - Limit CPU or memory beyond wall-clock time

pub mod worker;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::{JudgeError, Result};

static ISOLATED: AtomicBool = AtomicBool::new(false);

/// Mark this process as an isolated worker
pub fn mark_isolated() {
    ISOLATED.store(true, Ordering::SeqCst);
}

/// Whether this process is already an isolated worker
pub fn in_isolated_worker() -> bool {
    ISOLATED.load(Ordering::SeqCst)
}

/// Reject zero timeouts; `None` means unbounded
pub fn check_timeout(timeout: Option<Duration>) -> Result<()> {
    match timeout {
        Some(limit) if limit.is_zero() => Err(JudgeError::Config(
            "timeout must be positive".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Race `future` against `timeout`. The future is dropped on expiry, which
/// kills any child process it owns.
pub async fn with_timeout<F>(timeout: Option<Duration>, future: F) -> Result<F::Output>
where
    F: Future,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| JudgeError::Timeout(limit)),
        None => Ok(future.await),
    }
}

/// Sets the cancel flag when dropped
#[derive(Debug)]
pub struct CancelOnDrop(Arc<AtomicBool>);

impl CancelOnDrop {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Run a blocking job under a time limit.
///
/// The job must poll `cancel`; it is raised on timeout and whenever the
/// returned future is dropped before completion.
pub async fn run_blocking<T, F>(
    timeout: Option<Duration>,
    cancel: Arc<AtomicBool>,
    job: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let _guard = CancelOnDrop::new(cancel);
    let handle = tokio::task::spawn_blocking(job);

    match with_timeout(timeout, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_error)) => Err(JudgeError::Runtime(format!(
            "interpreter crashed: {}",
            join_error
        ))),
        Err(err) => {
            warn!("Abandoning blocking job: {}", err);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_with_timeout_passes_value_through() {
        let value = assert_ok!(with_timeout(Some(Duration::from_secs(1)), async { 7 }).await);
        assert_eq!(value, 7);
        assert_eq!(with_timeout(None, async { 8 }).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let limit = Duration::from_millis(50);
        let err = assert_err!(with_timeout(Some(limit), tokio::time::sleep(Duration::from_secs(5))).await);
        assert!(matches!(err, JudgeError::Timeout(l) if l == limit));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        assert!(check_timeout(Some(Duration::ZERO)).is_err());
        assert!(check_timeout(None).is_ok());
        assert!(check_timeout(Some(Duration::from_millis(1))).is_ok());
    }

    #[tokio::test]
    async fn test_run_blocking_cancels_on_timeout() {
        let cancel = Arc::new(AtomicBool::new(false));
        let observed = cancel.clone();
        let started = Instant::now();
        let result = run_blocking(Some(Duration::from_millis(100)), cancel.clone(), move || {
            while !observed.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .await;
        assert!(matches!(result, Err(JudgeError::Timeout(_))));
        assert!(cancel.load(Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        let cancel = Arc::new(AtomicBool::new(false));
        let value = run_blocking(None, cancel, || 40 + 2).await.unwrap();
        assert_eq!(value, 42);
    }
}
