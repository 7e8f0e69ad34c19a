use anyhow::Result;
use async_trait::async_trait;
use core_logic::{Worker, WorkerStats, LOAD_RESULT_TARGET};
use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::Clients;
use crate::dispatcher::{TxKind, TxOptions};

pub const SEND_PAUSE: Duration = Duration::from_millis(10);
pub const POOL_STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Sends `kind` to every endpoint in a loop until canceled.
pub struct LoadWorker {
    name: String,
    clients: Arc<Clients>,
    kind: TxKind,
    opts: TxOptions,
    shared_wallet: bool,
}

impl LoadWorker {
    pub fn new(id: usize, clients: Arc<Clients>, kind: TxKind, opts: TxOptions) -> Self {
        Self {
            name: format!("load-{:03}", id),
            clients,
            kind,
            opts,
            shared_wallet: false,
        }
    }

    /// Pin one shared wallet per endpoint for the worker's lifetime.
    pub fn with_shared_wallet(mut self, enabled: bool) -> Self {
        self.shared_wallet = enabled;
        self
    }

    async fn reserve_wallets(&self) -> Vec<Address> {
        let mut pinned = Vec::new();
        for (uid, res) in self.clients.request_shared_wallet().await {
            match res {
                Ok(address) => pinned.push(address),
                Err(e) => warn!(client = %uid, "No shared wallet: {}", e),
            }
        }
        pinned
    }
}

#[async_trait]
impl Worker for LoadWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancellation_token: CancellationToken) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        let mut opts = self.opts.clone();
        if self.shared_wallet {
            opts.pinned = self.reserve_wallets().await;
        }

        while !cancellation_token.is_cancelled() {
            let results = self
                .clients
                .send_transaction(self.kind, &opts, &cancellation_token)
                .await;

            for (uid, res) in results {
                match res {
                    Ok(hash) => {
                        stats.success += 1;
                        info!(target: LOAD_RESULT_TARGET, "SUCCESS {} {} {:?}", self.kind.label(), uid, hash);
                    }
                    Err(e) if e.is_canceled() => {}
                    Err(e) => {
                        stats.failed += 1;
                        info!(target: LOAD_RESULT_TARGET, "FAILED {} {}: {}", self.kind.label(), uid, e);
                    }
                }
            }

            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = sleep(SEND_PAUSE) => {}
            }
        }

        if !opts.pinned.is_empty() {
            self.clients.release_shared_wallet(&opts.pinned).await;
        }
        Ok(stats)
    }
}

/// Emits block throughput for every endpoint on a fixed cadence.
pub struct BlockReportWorker {
    clients: Arc<Clients>,
    every: Duration,
}

impl BlockReportWorker {
    pub fn new(clients: Arc<Clients>, every: Duration) -> Self {
        Self { clients, every }
    }
}

#[async_trait]
impl Worker for BlockReportWorker {
    fn name(&self) -> &str {
        "block-report"
    }

    async fn run(&self, cancellation_token: CancellationToken) -> Result<WorkerStats> {
        let mut reports = 0u64;
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for (uid, res) in self.clients.report_block_metrics().await {
                match res {
                    Ok(Some(report)) => {
                        reports += 1;
                        info!(
                            target: LOAD_RESULT_TARGET,
                            "block {} on {}: {} txs, {:.1} tps, {:.2} mgas/s, {}ms (lag {}ms)",
                            report.number,
                            uid,
                            report.txs,
                            report.tps,
                            report.mgas,
                            report.block_time_ms,
                            report.head_lag_ms
                        );
                    }
                    Ok(None) => {}
                    Err(e) if e.is_canceled() => {}
                    Err(e) => warn!(client = %uid, "Block report failed: {}", e),
                }
            }
        }
        debug!(reports, "Block reporting stopped");
        Ok(WorkerStats::default())
    }
}

/// Samples the polled pool status of every endpoint once a second.
pub struct PoolStatusWorker {
    clients: Arc<Clients>,
}

impl PoolStatusWorker {
    pub fn new(clients: Arc<Clients>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl Worker for PoolStatusWorker {
    fn name(&self) -> &str {
        "pool-status"
    }

    async fn run(&self, cancellation_token: CancellationToken) -> Result<WorkerStats> {
        let mut ticker = interval(POOL_STATUS_INTERVAL);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for (uid, res) in self.clients.tx_pool_status().await {
                if let Ok(status) = res {
                    debug!(client = %uid, pending = %status.pending, queued = %status.queued, "Pool status");
                }
            }
        }
        Ok(WorkerStats::default())
    }
}
