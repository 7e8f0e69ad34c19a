use anyhow::{Context, Result};
use chrono::Local;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, DatabaseError};

/// Configuration for the queued write path
#[derive(Debug, Clone, Copy)]
pub struct AsyncDbConfig {
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for AsyncDbConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10_000,
            batch_size: 200,
            flush_interval_ms: 200,
        }
    }
}

/// Submission timestamp waiting to be flushed
#[derive(Debug, Clone)]
pub struct LatencyEntry {
    pub key: String,
    pub submitted_at_ms: i64,
}

/// Durable `tx hash -> submission time` index.
///
/// Writes from the send path go through [`LatencyIndex::record`], which never
/// blocks: entries are queued and flushed in batches by a background worker.
/// Lookups that miss are normal (the transaction was sent by another run or
/// never tracked) and return `Ok(None)`.
///
/// Not Clone; share it behind an `Arc`.
#[derive(Debug)]
pub struct LatencyIndex {
    pool: SqlitePool,
    path: PathBuf,
    metrics: Arc<DbMetrics>,
    sender: Mutex<Option<mpsc::Sender<LatencyEntry>>>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
pub struct DbMetrics {
    pub total_queries: AtomicU64,
    pub total_errors: AtomicU64,
    pub total_inserts: AtomicU64,
    pub total_selects: AtomicU64,
    pub queued_entries: AtomicU64,
    pub dropped_entries: AtomicU64,
    pub batch_flush_count: AtomicU64,
}

impl LatencyIndex {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

    /// Open a fresh index at `db_path`.
    ///
    /// A database left by a previous run is renamed with a timestamp suffix so
    /// each run starts empty.
    pub async fn open(db_path: impl AsRef<Path>, config: AsyncDbConfig) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_str = path.display().to_string();

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::IoError {
                path: dir.display().to_string(),
                msg: e.to_string(),
            })?;
        }

        if path.exists() {
            let archived = archive_existing(&path)?;
            info!("Archived previous latency index to {}", archived.display());
        }

        std::fs::File::create(&path).map_err(|e| ConfigError::IoError {
            path: path_str.clone(),
            msg: e.to_string(),
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_millis(Self::DEFAULT_TIMEOUT_MS))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous=NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite://{}", path_str))
            .await
            .map_err(|e| DatabaseError::TransactionFailed { msg: e.to_string() })?;

        init_schema(&pool).await?;

        let metrics = Arc::new(DbMetrics::default());
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let worker_pool = pool.clone();
        let worker_metrics = metrics.clone();
        let flush_handle = tokio::spawn(async move {
            db_flush_worker(rx, worker_pool, config, worker_metrics).await;
        });

        info!(
            "Latency index opened at {} (channel: {}, batch: {}, interval: {}ms)",
            path_str, config.channel_capacity, config.batch_size, config.flush_interval_ms
        );

        Ok(Self {
            pool,
            path,
            metrics,
            sender: Mutex::new(Some(tx)),
            flush_handle: Mutex::new(Some(flush_handle)),
        })
    }

    /// Insert or replace one entry and wait for the write.
    pub async fn put(&self, key: &str, submitted_at_ms: i64) -> Result<()> {
        let start = Instant::now();
        let result = sqlx::query(
            "INSERT OR REPLACE INTO tx_submissions (tx_hash, submitted_at_ms) VALUES (?, ?)",
        )
        .bind(key)
        .bind(submitted_at_ms)
        .execute(&self.pool)
        .await;

        self.record_query_time(start, result.is_ok());
        result.map_err(|e| DatabaseError::TransactionFailed { msg: e.to_string() })?;
        self.metrics.total_inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue an entry for the background writer. Never blocks; a full queue
    /// drops the entry with a warning.
    pub fn record(&self, key: String, submitted_at_ms: i64) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(sender) = sender else {
            self.metrics.dropped_entries.fetch_add(1, Ordering::Relaxed);
            warn!("Latency index is shut down, dropping entry for {}", key);
            return;
        };

        match sender.try_send(LatencyEntry {
            key,
            submitted_at_ms,
        }) {
            Ok(()) => {
                self.metrics.queued_entries.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(entry)) => {
                self.metrics.dropped_entries.fetch_add(1, Ordering::Relaxed);
                warn!("Latency queue full, dropping entry for {}", entry.key);
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                self.metrics.dropped_entries.fetch_add(1, Ordering::Relaxed);
                warn!("Latency writer stopped, dropping entry for {}", entry.key);
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<i64>> {
        let start = Instant::now();
        let result = sqlx::query("SELECT submitted_at_ms FROM tx_submissions WHERE tx_hash = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await;

        self.record_query_time(start, result.is_ok());
        self.metrics.total_selects.fetch_add(1, Ordering::Relaxed);

        let row = result.map_err(|e| DatabaseError::TransactionFailed { msg: e.to_string() })?;
        match row {
            Some(row) => {
                let value: i64 = row
                    .try_get("submitted_at_ms")
                    .map_err(|_| DatabaseError::CorruptEntry {
                        key: key.to_string(),
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tx_submissions")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count latency entries")?;
        Ok(count)
    }

    /// Flush queued entries and stop the background writer.
    pub async fn shutdown(&self) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let handle = self
            .flush_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.await.context("Latency flush worker panicked")?;
        }

        let snapshot = self.get_metrics();
        info!(
            "Latency index {} closed ({} queued, {} dropped, {:.2}% query errors)",
            self.path.display(),
            self.metrics.queued_entries.load(Ordering::Relaxed),
            snapshot.dropped_entries,
            snapshot.error_rate() * 100.0
        );
        Ok(())
    }

    pub fn get_metrics(&self) -> DbMetricsSnapshot {
        DbMetricsSnapshot {
            total_queries: self.metrics.total_queries.load(Ordering::Relaxed),
            total_errors: self.metrics.total_errors.load(Ordering::Relaxed),
            total_inserts: self.metrics.total_inserts.load(Ordering::Relaxed),
            total_selects: self.metrics.total_selects.load(Ordering::Relaxed),
            dropped_entries: self.metrics.dropped_entries.load(Ordering::Relaxed),
            batch_flush_count: self.metrics.batch_flush_count.load(Ordering::Relaxed),
        }
    }

    fn record_query_time(&self, start: Instant, success: bool) {
        self.metrics.total_queries.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            target: "database",
            "query finished in {:.2}ms (ok: {})",
            start.elapsed().as_secs_f64() * 1000.0,
            success
        );
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DbMetricsSnapshot {
    pub total_queries: u64,
    pub total_errors: u64,
    pub total_inserts: u64,
    pub total_selects: u64,
    pub dropped_entries: u64,
    pub batch_flush_count: u64,
}

impl DbMetricsSnapshot {
    pub fn error_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_queries as f64
        }
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tx_submissions (
            tx_hash TEXT PRIMARY KEY,
            submitted_at_ms INTEGER NOT NULL
        );",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::TransactionFailed { msg: e.to_string() })?;

    debug!("Latency index schema initialized.");
    Ok(())
}

/// Rename `path` (and its WAL side files) to `<stem>_<timestamp>.<ext>`.
fn archive_existing(path: &Path) -> Result<PathBuf> {
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "latency".to_string());
    let file_name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, stamp, ext.to_string_lossy()),
        None => format!("{}_{}", stem, stamp),
    };
    let archived = path.with_file_name(file_name);

    std::fs::rename(path, &archived).map_err(|e| DatabaseError::ArchiveFailed {
        path: path.display().to_string(),
        msg: e.to_string(),
    })?;

    for suffix in ["-wal", "-shm"] {
        let side = PathBuf::from(format!("{}{}", path.display(), suffix));
        if side.exists() {
            let target = PathBuf::from(format!("{}{}", archived.display(), suffix));
            if let Err(e) = std::fs::rename(&side, &target) {
                warn!("Failed to archive {}: {}", side.display(), e);
            }
        }
    }

    Ok(archived)
}

/// Background worker that drains the write queue into SQLite.
///
/// Flushes when a batch fills up or on every interval tick, and once more when
/// the channel closes.
async fn db_flush_worker(
    mut rx: mpsc::Receiver<LatencyEntry>,
    pool: SqlitePool,
    config: AsyncDbConfig,
    metrics: Arc<DbMetrics>,
) {
    let mut batch = Vec::with_capacity(config.batch_size);
    let mut flush_interval = tokio::time::interval(Duration::from_millis(config.flush_interval_ms));

    debug!(
        "Latency flush worker started (batch: {}, interval: {}ms)",
        config.batch_size, config.flush_interval_ms
    );

    loop {
        tokio::select! {
            Some(entry) = rx.recv() => {
                batch.push(entry);
                if batch.len() >= config.batch_size {
                    flush_and_count(&mut batch, &pool, &metrics).await;
                }
            }

            _ = flush_interval.tick() => {
                if !batch.is_empty() {
                    flush_and_count(&mut batch, &pool, &metrics).await;
                }
            }

            else => {
                debug!("Latency channel closed, performing final flush");
                break;
            }
        }
    }

    if !batch.is_empty() {
        flush_and_count(&mut batch, &pool, &metrics).await;
    }

    debug!("Latency flush worker stopped");
}

async fn flush_and_count(batch: &mut Vec<LatencyEntry>, pool: &SqlitePool, metrics: &DbMetrics) {
    match flush_batch(batch, pool).await {
        Ok(()) => {
            metrics
                .total_inserts
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            metrics.batch_flush_count.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            metrics.total_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to flush {} latency entries: {}", batch.len(), e);
        }
    }
    batch.clear();
}

/// Write a batch in a single SQLite transaction
async fn flush_batch(batch: &[LatencyEntry], pool: &SqlitePool) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let start = Instant::now();

    let mut tx = pool.begin().await?;
    for entry in batch {
        sqlx::query(
            "INSERT OR REPLACE INTO tx_submissions (tx_hash, submitted_at_ms) VALUES (?, ?)",
        )
        .bind(entry.key.as_str())
        .bind(entry.submitted_at_ms)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let elapsed = start.elapsed();
    debug!(
        target: "database",
        "Flushed {} entries in {:.2}ms ({:.0} entries/sec)",
        batch.len(),
        elapsed.as_secs_f64() * 1000.0,
        batch.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    Ok(())
}
