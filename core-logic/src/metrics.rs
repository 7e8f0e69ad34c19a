use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Sample names emitted by the load clients.
pub mod names {
    pub const REQ_DURATION: &str = "req_duration";
    pub const TIME_TO_MINE: &str = "time_to_mine";
    pub const GAS_USED: &str = "gas_used";
    pub const TXS: &str = "txs";
    pub const TPS: &str = "tps";
    pub const MGAS: &str = "mgas";
    pub const BLOCK_TIME: &str = "block_time";
    pub const EOA: &str = "eoa";
    pub const POOL_PENDING: &str = "pool_pending";
    pub const POOL_QUEUED: &str = "pool_queued";
}

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    tags: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
struct SeriesStats {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl SeriesStats {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
            last: value,
        }
    }

    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub name: String,
    pub tags: Tags,
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_secs: f64,
    pub series: Vec<SeriesSnapshot>,
}

/// In-process sink for named numeric samples.
///
/// Each distinct `(name, tags)` pair is one series; the collector keeps
/// count/sum/min/max/last per series and exports them as JSON.
#[derive(Debug)]
pub struct MetricsCollector {
    series: Mutex<HashMap<SeriesKey, SeriesStats>>,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }
}

impl MetricsCollector {
    pub fn global() -> &'static Self {
        static INSTANCE: std::sync::OnceLock<MetricsCollector> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(MetricsCollector::default)
    }

    pub fn record(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let mut tags: Vec<(String, String)> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        tags.sort();

        let key = SeriesKey {
            name: name.to_string(),
            tags,
        };

        let mut series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        series
            .entry(key)
            .and_modify(|s| s.push(value))
            .or_insert_with(|| SeriesStats::new(value));
    }

    pub fn record_duration(&self, name: &str, duration: Duration, tags: &[(&str, &str)]) {
        self.record(name, duration.as_secs_f64() * 1000.0, tags);
    }

    /// All series recorded under `name`.
    pub fn series(&self, name: &str) -> Vec<SeriesSnapshot> {
        self.snapshot()
            .series
            .into_iter()
            .filter(|s| s.name == name)
            .collect()
    }

    /// Total number of samples recorded under `name` across all tag sets.
    pub fn sample_count(&self, name: &str) -> u64 {
        self.series(name).iter().map(|s| s.count).sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<SeriesSnapshot> = series
            .iter()
            .map(|(key, stats)| SeriesSnapshot {
                name: key.name.clone(),
                tags: key.tags.iter().cloned().collect(),
                count: stats.count,
                sum: stats.sum,
                avg: stats.sum / stats.count as f64,
                min: stats.min,
                max: stats.max,
                last: stats.last,
            })
            .collect();
        drop(series);

        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));

        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            uptime_secs: self.uptime().as_secs_f64(),
            series: out,
        }
    }

    pub fn to_json(&self) -> String {
        let snapshot = self.snapshot();
        serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn to_compact_json(&self) -> String {
        let snapshot = self.snapshot();
        serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    pub async fn export_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = self.to_json();
        tokio::fs::write(path, json).await
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
