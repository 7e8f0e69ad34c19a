use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DispatchError;

/// Bounds for a fixed-interval polling loop.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub timeout: Duration,
    pub step: Duration,
}

impl PollConfig {
    pub const fn new(timeout: Duration, step: Duration) -> Self {
        Self { timeout, step }
    }
}

/// Why a bounded polling loop gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    Canceled,
    DeadlineExceeded {
        waited_ms: u64,
        attempts: u32,
        last_error: Option<String>,
    },
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Canceled => write!(f, "canceled"),
            PollError::DeadlineExceeded {
                waited_ms,
                attempts,
                last_error,
            } => {
                write!(f, "deadline exceeded after {}ms ({} attempts)", waited_ms, attempts)?;
                if let Some(e) = last_error {
                    write!(f, ", last error: {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for PollError {}

impl From<PollError> for DispatchError {
    fn from(e: PollError) -> Self {
        match e {
            PollError::Canceled => DispatchError::Canceled,
            PollError::DeadlineExceeded {
                waited_ms,
                last_error,
                ..
            } => DispatchError::DeadlineExceeded {
                waited_ms,
                context: last_error.unwrap_or_else(|| "no attempt completed".to_string()),
            },
        }
    }
}

/// Runs `operation` every `config.step` until it succeeds, the deadline passes
/// or `token` fires.
///
/// A single slow attempt is cut off at the deadline. Cancellation wins over
/// the deadline when both are ready.
pub async fn repeat_with_timeout<T, E, F, Fut>(
    token: &CancellationToken,
    config: PollConfig,
    mut operation: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = Instant::now();
    let deadline = start + config.timeout;
    let mut attempts = 0u32;
    let mut last_error: Option<String> = None;

    loop {
        if token.is_cancelled() {
            return Err(PollError::Canceled);
        }

        attempts += 1;
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(PollError::Canceled),
            res = timeout_at(deadline, operation()) => match res {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    debug!("poll attempt {} failed: {}", attempts, e);
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    return Err(PollError::DeadlineExceeded {
                        waited_ms: start.elapsed().as_millis() as u64,
                        attempts,
                        last_error,
                    })
                }
            },
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::DeadlineExceeded {
                waited_ms: start.elapsed().as_millis() as u64,
                attempts,
                last_error,
            });
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(PollError::Canceled),
            _ = sleep_until((now + config.step).min(deadline)) => {}
        }
    }
}

/// RPC rejections that mean the nonce we just used should be reused on the
/// next attempt instead of advanced.
pub const NONCE_RETRY_PATTERNS: [&str; 6] = [
    "replacement transaction underpriced",
    "transaction underpriced",
    "nonce too low",
    "already known",
    "could not replace existing",
    "fee cap less than block base fee",
];

pub fn is_nonce_retry_error(message: &str) -> bool {
    let message = message.to_lowercase();
    NONCE_RETRY_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_retry_classification() {
        assert!(is_nonce_retry_error(
            "(code: -32000, message: nonce too low, data: None)"
        ));
        assert!(is_nonce_retry_error("Replacement transaction underpriced"));
        assert!(is_nonce_retry_error(
            "max fee per gas: fee cap less than block base fee"
        ));
        assert!(!is_nonce_retry_error("insufficient funds for gas * price + value"));
        assert!(!is_nonce_retry_error("execution reverted"));
    }

    #[test]
    fn test_poll_error_maps_to_dispatch_error() {
        let canceled: DispatchError = PollError::Canceled.into();
        assert!(canceled.is_canceled());

        let deadline: DispatchError = PollError::DeadlineExceeded {
            waited_ms: 10,
            attempts: 2,
            last_error: Some("receipt not found".to_string()),
        }
        .into();
        assert!(deadline.is_deadline());
        assert!(deadline.to_string().contains("receipt not found"));
    }
}
