//! Timeout constants and helpers shared by the client, the server and connections.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default timeout for establishing a client connection
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a complete login or registration handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the accept loop waits before re-checking for a shutdown request
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Time granted to a stale session to receive its log-out marker
pub const EVICTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Run `fut` to completion or fail with [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_elapsed_maps_to_timeout() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: Result<()> =
            with_timeout_error(async { Err(ProtocolError::ConnectionClosed) }, DEFAULT_TIMEOUT)
                .await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
