/*!
 * Utility functions and helpers for starwire.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "Operation timed out after {} ms",
            duration.as_millis()
        ))),
    }
}

/// Run a blocking closure on the blocking pool and wait for it
///
/// Used for the I/O calls that must not stall the async runtime's workers,
/// such as opening a serial device.
pub async fn run_blocking<F, T>(name: &str, f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::runtime(format!("Blocking task '{}' failed: {}", name, e)))
}

/// Create a task that runs in the background and logs any errors
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, Error>(42) }).await;
        assert_eq!(tokio_test::assert_ok!(result), 42);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        let err = tokio_test::assert_err!(result);
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let value = run_blocking("sum", || (1..=10).sum::<u32>()).await.unwrap();
        assert_eq!(value, 55);
    }

    #[tokio::test]
    async fn test_spawn_and_log_completes() {
        let handle = spawn_and_log("noop", async { Ok::<_, Error>(()) });
        handle.await.unwrap();

        let handle = spawn_and_log("failing", async { Err::<(), _>(Error::other("boom")) });
        handle.await.unwrap();
    }
}
