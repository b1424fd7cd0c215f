//! Integration tests for the daemon's offline commands.

use std::sync::Arc;

use tempfile::TempDir;

use mirror_daemon::{load_settings, read_status, reset_checkpoint, Overrides};
use mirror_storage::{CheckpointStore, LocalIndex, Storage};
use mirror_types::{CheckpointPatch, SearchIndex, Settings, Stage};
use serde_json::json;

fn open(temp_dir: &TempDir) -> Arc<Storage> {
    Arc::new(Storage::open(temp_dir.path()).expect("Failed to open storage"))
}

#[tokio::test]
async fn test_status_reports_checkpoint_and_counts() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open(&temp_dir);
    let settings = Settings::default();

    let store = CheckpointStore::new(storage.clone(), false);
    store.check().await.unwrap();
    store.save(CheckpointPatch::sequence(77)).await.unwrap();
    store.save(CheckpointPatch::stage(Stage::Watch)).await.unwrap();

    let index = LocalIndex::new(storage.clone());
    for name in ["a", "b"] {
        index
            .upsert(&settings.indices.production, json!({"objectID": name}))
            .await
            .unwrap();
    }
    index
        .upsert(&settings.indices.watch_queue, json!({"objectID": "c", "retries": 1}))
        .await
        .unwrap();

    let report = read_status(storage, &settings).await.unwrap();
    assert_eq!(report.checkpoint.sequence, Some(77));
    assert_eq!(report.checkpoint.stage, Stage::Watch);
    assert_eq!(report.production_records, 2);
    assert_eq!(report.watch_queue, 1);
    assert_eq!(report.bootstrap_queue, 0);

    let printed = serde_json::to_value(&report).unwrap();
    assert_eq!(printed["production_records"], 2);
}

#[tokio::test]
async fn test_reset_writes_zero_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open(&temp_dir);

    let store = CheckpointStore::new(storage.clone(), false);
    store.check().await.unwrap();
    store.save(CheckpointPatch::sequence(5)).await.unwrap();
    store.save(CheckpointPatch::last_key("m")).await.unwrap();

    let reset = reset_checkpoint(storage.clone()).await.unwrap();
    assert_eq!(reset.sequence, None);

    // A fresh store reads what was persisted, not a cache
    let reread = CheckpointStore::new(storage, false).get().await.unwrap();
    assert_eq!(reread.sequence, None);
    assert_eq!(reread.bootstrap_last_key, None);
    assert!(!reread.bootstrap_done);
}

#[test]
fn test_cli_overrides_win() {
    let overrides = Overrides {
        config_path: None,
        db_path: Some("/tmp/mirror-test-db"),
        log_level: Some("debug"),
        seed: true,
    };
    let settings = load_settings(&overrides).unwrap();
    assert_eq!(settings.db_path, "/tmp/mirror-test-db");
    assert_eq!(settings.log_level, "debug");
    assert!(settings.pipeline.seed);
}
