//! Retry logic for control-plane requests with error classification.

use reqwest::StatusCode;

/// Maximum number of retry attempts for network operations.
pub const MAX_RETRIES: usize = 3;

/// Delay between retry attempts in milliseconds.
pub const RETRY_DELAY_MS: u64 = 1000;

/// Errors that should not be retried.
#[derive(Debug)]
pub enum NonRetryableError {
    /// Authentication or authorization failed (HTTP 401/403)
    AccessDenied(String),
    /// Resource not found (HTTP 404)
    NotFound(String),
    /// Other client errors that won't succeed on retry
    ClientError(String),
}

impl std::fmt::Display for NonRetryableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NonRetryableError::AccessDenied(msg) => {
                write!(f, "Access denied: {}", msg)
            }
            NonRetryableError::NotFound(msg) => {
                write!(f, "Not found: {}", msg)
            }
            NonRetryableError::ClientError(msg) => {
                write!(f, "Request error: {}", msg)
            }
        }
    }
}

impl std::error::Error for NonRetryableError {}

/// Classifies an error as retryable or non-retryable.
/// Returns Ok(()) if the error is retryable, Err with a message if not.
pub fn classify_error(error: &reqwest::Error) -> Result<(), NonRetryableError> {
    if let Some(status) = error.status() {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(NonRetryableError::AccessDenied(status.to_string()));
            }
            StatusCode::NOT_FOUND => {
                return Err(NonRetryableError::NotFound(error.to_string()));
            }
            s if s.is_client_error() => {
                return Err(NonRetryableError::ClientError(error.to_string()));
            }
            // 5xx and everything else may be transient
            _ => {}
        }
    }
    Ok(())
}

/// Converts a reqwest error into an anyhow error, wrapping it in
/// [`NonRetryableError`] when it should not be retried.
pub fn check_retryable(error: reqwest::Error) -> anyhow::Error {
    match classify_error(&error) {
        Err(non_retryable) => anyhow::Error::new(non_retryable),
        Ok(()) => anyhow::Error::new(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn status_error(status: usize) -> reqwest::Error {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(status)
            .create_async()
            .await;

        reqwest::get(server.url())
            .await
            .unwrap()
            .error_for_status()
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retryable() {
        let err = status_error(404).await;
        assert!(classify_error(&err).is_err());

        let err = status_error(401).await;
        assert!(matches!(
            classify_error(&err),
            Err(NonRetryableError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable() {
        let err = status_error(502).await;
        assert!(classify_error(&err).is_ok());
    }

    #[tokio::test]
    async fn test_check_retryable_preserves_downcast() {
        let err = status_error(400).await;
        let wrapped = check_retryable(err);
        assert!(wrapped.downcast_ref::<NonRetryableError>().is_some());
    }
}
