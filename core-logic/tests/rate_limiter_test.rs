use core_logic::{AdmissionConfig, AdmissionLimiter, DispatchError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[test]
fn test_backlog_above_target_halves_rate() {
    let limiter = AdmissionLimiter::new(AdmissionConfig {
        initial_rate: 100.0,
        steady_state_backlog: 1000,
        increment: 50.0,
        backoff_factor: 2.0,
        min_rate: 1.0,
    });

    assert_eq!(limiter.retune(1500), 50.0);
    assert_eq!(limiter.rate(), 50.0);
}

#[test]
fn test_rate_increases_monotonically_below_target() {
    let limiter = AdmissionLimiter::new(AdmissionConfig::with_rate(4.0));
    let mut previous = limiter.rate();

    for backlog in [0, 10, 500, 999] {
        let rate = limiter.retune(backlog);
        assert_eq!(rate, previous + 50.0);
        previous = rate;
    }
}

#[test]
fn test_rate_decreases_by_factor_down_to_floor() {
    let limiter = AdmissionLimiter::new(AdmissionConfig::with_rate(16.0));

    let rates: Vec<f64> = (0..6).map(|_| limiter.retune(5000)).collect();
    assert_eq!(rates, vec![8.0, 4.0, 2.0, 1.0, 1.0, 1.0]);
}

#[tokio::test]
async fn test_wait_paces_tokens() {
    let limiter = AdmissionLimiter::new(AdmissionConfig::with_rate(20.0));
    let token = CancellationToken::new();

    let start = Instant::now();
    for _ in 0..5 {
        limiter.wait(&token).await.unwrap();
    }

    // first token is free, four more at 50ms each
    assert!(start.elapsed() >= Duration::from_millis(190));
}

#[tokio::test]
async fn test_wait_is_canceled() {
    let limiter = Arc::new(AdmissionLimiter::new(AdmissionConfig::with_rate(1.0)));
    let token = CancellationToken::new();

    limiter.wait(&token).await.unwrap();

    let waiter = {
        let limiter = limiter.clone();
        let token = token.clone();
        tokio::spawn(async move { limiter.wait(&token).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(DispatchError::Canceled)));
}

#[tokio::test]
async fn test_canceled_waiters_do_not_consume_tokens() {
    let limiter = Arc::new(AdmissionLimiter::new(AdmissionConfig::with_rate(10.0)));
    limiter.wait(&CancellationToken::new()).await.unwrap();

    let doomed = CancellationToken::new();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let limiter = limiter.clone();
            let token = doomed.clone();
            tokio::spawn(async move { limiter.wait(&token).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    doomed.cancel();
    for waiter in waiters {
        assert!(matches!(waiter.await.unwrap(), Err(DispatchError::Canceled)));
    }

    // next token is still due 100ms after the first, not 400ms
    let start = Instant::now();
    limiter.wait(&CancellationToken::new()).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(250));
}

#[tokio::test]
async fn test_wait_on_canceled_token_fails_fast() {
    let limiter = AdmissionLimiter::new(AdmissionConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    assert!(matches!(
        limiter.wait(&token).await,
        Err(DispatchError::Canceled)
    ));
}
