//! # Core Logic - Shared Utilities for the Load Test Engine
//!
//! Chain-agnostic building blocks used by the chain crates.
//!
//! ## Modules
//!
//! - [`database`] - Latency index on SQLite with a batched async writer
//! - [`error`] - Typed error handling with thiserror
//! - [`metrics`] - Tagged sample collection and JSON export
//! - [`traits`] - Worker seam driven by [`WorkerRunner`]
//! - `utils` - Logger, admission limiter, bounded polling, runner

pub mod database;
pub mod error;
pub mod metrics;
pub mod traits;
pub(crate) mod utils;

pub use database::{AsyncDbConfig, DbMetrics, DbMetricsSnapshot, LatencyEntry, LatencyIndex};
pub use error::{ConfigError, CoreError, DatabaseError, DispatchError, NetworkError, WalletError};
pub use metrics::{MetricsCollector, MetricsSnapshot, SeriesSnapshot};
pub use traits::{Worker, WorkerStats};

pub use utils::{
    is_nonce_retry_error, repeat_with_timeout, setup_logger, AdmissionConfig, AdmissionLimiter,
    PollConfig, PollError, WorkerRunner, LOAD_RESULT_TARGET, NONCE_RETRY_PATTERNS,
};
