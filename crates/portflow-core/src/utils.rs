/*!
 * Utility functions and helpers for portflow.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::error::Error;

/// Run a future with a timeout
///
/// The error type of the future only has to be constructible from a core
/// [`Error`], so device-level error types can use this directly.
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `what` - Short description of the operation, used in the error message
/// * `future` - The future to run
pub async fn with_timeout<F, T, E>(duration: Duration, what: &str, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Error>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => {
            debug!("{} timed out after {:?}", what, duration);
            Err(Error::timeout(format!("{} timed out after {:?}", what, duration)).into())
        }
    }
}

/// Convert a Duration to whole milliseconds
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_timeout_success() {
        let result = tokio_test::block_on(with_timeout(Duration::from_secs(1), "answer", async {
            Ok::<_, Error>(42)
        }));
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), "slow read", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, Error>(42)
        })
        .await;
        match result {
            Err(Error::Timeout(msg)) => assert!(msg.starts_with("slow read")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_inner_error() {
        let result: Result<(), Error> =
            with_timeout(Duration::from_secs(1), "write", async { Err(Error::other("nak")) }).await;
        assert!(matches!(result, Err(Error::Other(_))));
    }

    #[test]
    fn test_duration_to_millis() {
        assert_eq!(duration_to_millis(Duration::from_millis(1234)), 1234);
        assert_eq!(duration_to_millis(Duration::from_micros(999)), 0);
    }
}
