use core_logic::{is_nonce_retry_error, repeat_with_timeout, PollConfig, PollError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_poll_success_first_try() {
    let token = CancellationToken::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let config = PollConfig::new(Duration::from_secs(1), Duration::from_millis(10));

    let result: Result<&str, PollError> = repeat_with_timeout(&token, config, || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>("mined")
        }
    })
    .await;

    assert_eq!(result, Ok("mined"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_poll_success_after_failures() {
    let token = CancellationToken::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let config = PollConfig::new(Duration::from_secs(2), Duration::from_millis(5));

    let result = repeat_with_timeout(&token, config, || {
        let counter = counter.clone();
        async move {
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if count < 3 {
                Err("receipt not found".to_string())
            } else {
                Ok(count)
            }
        }
    })
    .await;

    assert_eq!(result, Ok(3));
}

#[tokio::test]
async fn test_poll_deadline_exceeded_keeps_last_error() {
    let token = CancellationToken::new();
    let config = PollConfig::new(Duration::from_millis(60), Duration::from_millis(10));

    let result: Result<(), PollError> = repeat_with_timeout(&token, config, || async {
        Err::<(), _>("receipt status is unsuccessful")
    })
    .await;

    match result {
        Err(PollError::DeadlineExceeded {
            attempts,
            last_error,
            ..
        }) => {
            assert!(attempts >= 2);
            assert_eq!(last_error.as_deref(), Some("receipt status is unsuccessful"));
        }
        other => panic!("expected deadline, got {:?}", other),
    }
}

#[tokio::test]
async fn test_poll_slow_attempt_is_cut_at_deadline() {
    let token = CancellationToken::new();
    let config = PollConfig::new(Duration::from_millis(50), Duration::from_millis(10));

    let result: Result<(), PollError> = repeat_with_timeout(&token, config, || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<_, String>(())
    })
    .await;

    assert!(matches!(result, Err(PollError::DeadlineExceeded { .. })));
}

#[tokio::test]
async fn test_poll_cancellation_is_distinct() {
    let token = CancellationToken::new();
    let config = PollConfig::new(Duration::from_secs(10), Duration::from_millis(10));

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let result: Result<(), PollError> =
        repeat_with_timeout(&token, config, || async { Err::<(), _>("pending") }).await;

    assert_eq!(result, Err(PollError::Canceled));
}

#[test]
fn test_fatal_errors_are_not_retried() {
    assert!(is_nonce_retry_error("already known"));
    assert!(is_nonce_retry_error("could not replace existing tx"));
    assert!(!is_nonce_retry_error("connection refused"));
    assert!(!is_nonce_retry_error("gas limit reached"));
}
