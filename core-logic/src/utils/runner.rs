use crate::traits::{Worker, WorkerStats};
use anyhow::Result;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

pub struct WorkerRunner;

impl WorkerRunner {
    /// Spawns every worker as its own task and waits for all of them.
    ///
    /// Ctrl+C cancels `token`; so does the caller (for a fixed duration run).
    /// Worker failures are logged and counted, never propagated.
    pub async fn run_workers(
        workers: Vec<Box<dyn Worker>>,
        token: CancellationToken,
    ) -> Result<WorkerStats> {
        let mut set = JoinSet::new();

        let signal_token = token.clone();
        let signal_task = tokio::spawn(async move {
            tokio::select! {
                res = signal::ctrl_c() => match res {
                    Ok(()) => {
                        info!("🛑 Received Ctrl+C. Initiating graceful shutdown...");
                        signal_token.cancel();
                    }
                    Err(err) => {
                        error!("Unable to listen for shutdown signal: {}", err);
                    }
                },
                _ = signal_token.cancelled() => {}
            }
        });

        let start_time = std::time::Instant::now();
        info!("Starting {} load workers...", workers.len());

        for (i, worker) in workers.into_iter().enumerate() {
            let id = i + 1;
            let span = tracing::info_span!(
                "worker",
                worker_id = format!("{:03}", id),
                kind = worker.name().to_string()
            );
            let child_token = token.child_token();

            set.spawn(
                async move {
                    match worker.run(child_token).await {
                        Ok(stats) => Ok(stats),
                        Err(e) => {
                            error!("Worker {} failed: {:?}", id, e);
                            Err(e)
                        }
                    }
                }
                .instrument(span),
            );
        }

        let mut total = WorkerStats::default();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(Ok(stats)) => total.merge(stats),
                Ok(Err(_)) => total.failed += 1,
                Err(e) => {
                    error!("A worker task panicked or failed to join: {:?}", e);
                }
            }
        }

        signal_task.abort();

        let total_duration = start_time.elapsed();
        let rate = if total.total() > 0 {
            (total.success as f64 / total.total() as f64) * 100.0
        } else {
            0.0
        };

        info!("🛑 Shutdown Complete.");
        info!(
            "Total Time: {:.1}s | Total Success: {} | Total Fail: {} | Success Rate: {:.2}%",
            total_duration.as_secs_f64(),
            total.success,
            total.failed,
            rate
        );

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct CountingWorker {
        iterations: u64,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, token: CancellationToken) -> Result<WorkerStats> {
            let mut stats = WorkerStats::default();
            for _ in 0..self.iterations {
                if token.is_cancelled() {
                    break;
                }
                stats.success += 1;
            }
            Ok(stats)
        }
    }

    struct FailingWorker;

    #[async_trait]
    impl Worker for FailingWorker {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, _token: CancellationToken) -> Result<WorkerStats> {
            anyhow::bail!("boom")
        }
    }

    struct BlockingWorker;

    #[async_trait]
    impl Worker for BlockingWorker {
        fn name(&self) -> &str {
            "blocking"
        }

        async fn run(&self, token: CancellationToken) -> Result<WorkerStats> {
            token.cancelled().await;
            Ok(WorkerStats {
                success: 1,
                failed: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_stats_are_aggregated() {
        let workers: Vec<Box<dyn Worker>> = vec![
            Box::new(CountingWorker { iterations: 3 }),
            Box::new(CountingWorker { iterations: 4 }),
            Box::new(FailingWorker),
        ];

        let stats = WorkerRunner::run_workers(workers, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats, WorkerStats { success: 7, failed: 1 });
    }

    #[tokio::test]
    async fn test_cancellation_stops_workers() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let workers: Vec<Box<dyn Worker>> = vec![Box::new(BlockingWorker), Box::new(BlockingWorker)];
        let stats = WorkerRunner::run_workers(workers, token).await.unwrap();
        assert_eq!(stats.success, 2);
    }
}
