use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub success: u64,
    pub failed: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: WorkerStats) {
        self.success += other.success;
        self.failed += other.failed;
    }

    pub fn total(&self) -> u64 {
        self.success + self.failed
    }
}

/// A long-running unit of load driven by [`crate::WorkerRunner`].
#[async_trait]
pub trait Worker: Send + Sync {
    /// Short label used in the worker span
    fn name(&self) -> &str;

    /// Run until `cancellation_token` fires or the worker decides it is done.
    async fn run(&self, cancellation_token: CancellationToken) -> Result<WorkerStats>;
}
