use core_logic::metrics::names;
use core_logic::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;

use crate::rpc::PoolStatus;

/// Numbers derived from one newly observed block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockReport {
    pub number: u64,
    pub txs: u64,
    pub gas_used: u64,
    pub tps: f64,
    pub mgas: f64,
    pub block_time_ms: u64,
    /// Local time minus the block timestamp, after correcting for the node's
    /// clock skew measured at connect.
    pub head_lag_ms: i64,
}

impl BlockReport {
    /// `elapsed_ms` is the wall time since the previously reported block.
    pub fn compute(number: u64, txs: u64, gas_used: u64, elapsed_ms: u64) -> Self {
        let secs = elapsed_ms / 1000;
        let tps = if secs == 0 {
            txs as f64
        } else {
            txs as f64 / secs as f64
        };
        let mgas = if elapsed_ms == 0 {
            0.0
        } else {
            gas_used as f64 / (elapsed_ms as f64 / 1000.0) / 1e6
        };

        Self {
            number,
            txs,
            gas_used,
            tps,
            mgas,
            block_time_ms: elapsed_ms,
            head_lag_ms: 0,
        }
    }

    pub fn with_head_lag(mut self, observed_at_ms: i64, block_timestamp_secs: u64, skew_ms: i64) -> Self {
        let mined_at_ms = (block_timestamp_secs as i64).saturating_mul(1000) + skew_ms;
        self.head_lag_ms = observed_at_ms - mined_at_ms;
        self
    }
}

/// Tags every sample with the client and run it came from.
#[derive(Debug, Clone)]
pub struct Reporter {
    metrics: Arc<MetricsCollector>,
    client_uid: String,
    run_uid: String,
}

impl Reporter {
    pub fn new(metrics: Arc<MetricsCollector>, client_uid: String, run_uid: String) -> Self {
        Self {
            metrics,
            client_uid,
            run_uid,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    fn record(&self, name: &str, value: f64, extra: Option<(&str, &str)>) {
        let mut tags = vec![
            ("client_uid", self.client_uid.as_str()),
            ("run_uid", self.run_uid.as_str()),
        ];
        tags.extend(extra);
        self.metrics.record(name, value, &tags);
    }

    pub fn req_duration(&self, call: &str, elapsed: Duration) {
        self.record(
            names::REQ_DURATION,
            elapsed.as_secs_f64() * 1000.0,
            Some(("call", call)),
        );
    }

    pub fn eoa(&self, tx_type: &str) {
        self.record(names::EOA, 1.0, Some(("tx_type", tx_type)));
    }

    pub fn time_to_mine(&self, ms: f64) {
        self.record(names::TIME_TO_MINE, ms, None);
    }

    pub fn pool(&self, status: &PoolStatus) {
        self.record(names::POOL_PENDING, status.pending.as_u64() as f64, None);
        self.record(names::POOL_QUEUED, status.queued.as_u64() as f64, None);
    }

    pub fn block(&self, report: &BlockReport) {
        self.record(names::TXS, report.txs as f64, None);
        self.record(names::GAS_USED, report.gas_used as f64, None);
        self.record(names::TPS, report.tps, None);
        self.record(names::MGAS, report.mgas, None);
        self.record(names::BLOCK_TIME, report.block_time_ms as f64, None);
    }
}
