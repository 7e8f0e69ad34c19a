use core_logic::{AsyncDbConfig, LatencyIndex};
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test]
async fn test_put_then_get() {
    let dir = tempdir().unwrap();
    let index = LatencyIndex::open(dir.path().join("load_test.db"), AsyncDbConfig::default())
        .await
        .unwrap();

    index.put("0xabc", 1_700_000_000_123).await.unwrap();

    assert_eq!(index.get("0xabc").await.unwrap(), Some(1_700_000_000_123));
    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_key_is_not_an_error() {
    let dir = tempdir().unwrap();
    let index = LatencyIndex::open(dir.path().join("load_test.db"), AsyncDbConfig::default())
        .await
        .unwrap();

    assert_eq!(index.get("0xdoesnotexist").await.unwrap(), None);
    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queued_records_are_flushed() {
    let dir = tempdir().unwrap();
    let config = AsyncDbConfig {
        channel_capacity: 100,
        batch_size: 10,
        flush_interval_ms: 20,
    };
    let index = LatencyIndex::open(dir.path().join("load_test.db"), config)
        .await
        .unwrap();

    for i in 0..25 {
        index.record(format!("0x{:02x}", i), 1000 + i);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(index.count().await.unwrap(), 25);
    assert_eq!(index.get("0x18").await.unwrap(), Some(1024));

    index.shutdown().await.unwrap();
    assert_eq!(index.get_metrics().dropped_entries, 0);
}

#[tokio::test]
async fn test_shutdown_flushes_pending_entries() {
    let dir = tempdir().unwrap();
    let config = AsyncDbConfig {
        channel_capacity: 100,
        batch_size: 1000,
        flush_interval_ms: 60_000,
    };
    let index = LatencyIndex::open(dir.path().join("load_test.db"), config)
        .await
        .unwrap();

    index.record("0x01".to_string(), 42);
    index.shutdown().await.unwrap();

    assert_eq!(index.get("0x01").await.unwrap(), Some(42));
}

#[tokio::test]
async fn test_record_after_shutdown_is_dropped() {
    let dir = tempdir().unwrap();
    let index = LatencyIndex::open(dir.path().join("load_test.db"), AsyncDbConfig::default())
        .await
        .unwrap();

    index.shutdown().await.unwrap();
    index.record("0x02".to_string(), 7);

    assert_eq!(index.get_metrics().dropped_entries, 1);
    assert_eq!(index.get("0x02").await.unwrap(), None);
}

#[tokio::test]
async fn test_previous_run_is_archived() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("load_test.db");

    let first = LatencyIndex::open(&path, AsyncDbConfig::default())
        .await
        .unwrap();
    first.put("0xold", 1).await.unwrap();
    first.shutdown().await.unwrap();
    drop(first);

    let second = LatencyIndex::open(&path, AsyncDbConfig::default())
        .await
        .unwrap();
    assert_eq!(second.get("0xold").await.unwrap(), None);

    let archived = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("load_test_") && name.ends_with(".db"))
        .count();
    assert_eq!(archived, 1);

    second.shutdown().await.unwrap();
}
