//! # Core Logic - Admission Control
//!
//! Token bucket with a single token of burst capacity whose refill rate is
//! retuned from the node's reported backlog (additive increase while the
//! backlog is under target, multiplicative decrease while it is above).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DispatchError;

/// Configuration for adaptive admission
#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    /// Starting rate in tokens per second
    pub initial_rate: f64,
    /// Backlog (pending + queued) the limiter steers towards
    pub steady_state_backlog: u64,
    /// Added to the rate while backlog is below target
    pub increment: f64,
    /// Rate is divided by this while backlog is above target
    pub backoff_factor: f64,
    /// Floor for the rate
    pub min_rate: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            initial_rate: 4.0,
            steady_state_backlog: 1000,
            increment: 50.0,
            backoff_factor: 2.0,
            min_rate: 1.0,
        }
    }
}

impl AdmissionConfig {
    pub fn with_rate(rate: f64) -> Self {
        Self {
            initial_rate: rate,
            ..Default::default()
        }
    }
}

/// Rate limiter gating every send path.
///
/// The rate has a single writer (the backlog poll calling [`retune`]); any
/// number of senders may [`wait`] concurrently.
///
/// [`retune`]: AdmissionLimiter::retune
/// [`wait`]: AdmissionLimiter::wait
#[derive(Debug)]
pub struct AdmissionLimiter {
    config: AdmissionConfig,
    rate_bits: AtomicU64,
    next_slot: Mutex<Option<Instant>>,
}

impl AdmissionLimiter {
    pub fn new(config: AdmissionConfig) -> Self {
        let initial = config.initial_rate.max(config.min_rate);
        Self {
            config,
            rate_bits: AtomicU64::new(initial.to_bits()),
            next_slot: Mutex::new(None),
        }
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Block until a token is available or `token` fires.
    ///
    /// A waiter claims its token only once it is due, so a canceled waiter
    /// leaves the schedule untouched.
    pub async fn wait(&self, token: &CancellationToken) -> Result<(), DispatchError> {
        loop {
            if token.is_cancelled() {
                return Err(DispatchError::Canceled);
            }

            let due = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(due) => due,
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DispatchError::Canceled),
                _ = sleep_until(due) => {}
            }
        }
    }

    /// Takes the token if it is due, otherwise reports when it will be.
    fn try_acquire(&self) -> Result<(), Instant> {
        let mut next = self
            .next_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *next {
            Some(at) if at > now => Err(at),
            _ => {
                *next = Some(now + Duration::from_secs_f64(1.0 / self.rate()));
                Ok(())
            }
        }
    }

    /// Feed the observed backlog and return the new rate.
    pub fn retune(&self, backlog: u64) -> f64 {
        let current = self.rate();
        let next = if backlog < self.config.steady_state_backlog {
            current + self.config.increment
        } else if backlog > self.config.steady_state_backlog {
            (current / self.config.backoff_factor).max(self.config.min_rate)
        } else {
            current
        };

        self.rate_bits.store(next.to_bits(), Ordering::Release);
        debug!(
            target: "admission",
            "backlog {} (target {}): rate {:.2} -> {:.2}",
            backlog,
            self.config.steady_state_backlog,
            current,
            next
        );
        next
    }
}
