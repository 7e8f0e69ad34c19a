//! # Utilities Module
//!
//! Logging, admission control, bounded polling and the worker runner.

pub(crate) mod logger;
pub(crate) mod rate_limiter;
pub(crate) mod retry;
pub(crate) mod runner;

pub use logger::{setup_logger, LOAD_RESULT_TARGET};
pub use rate_limiter::{AdmissionConfig, AdmissionLimiter};
pub use retry::{
    is_nonce_retry_error, repeat_with_timeout, PollConfig, PollError, NONCE_RETRY_PATTERNS,
};
pub use runner::WorkerRunner;
