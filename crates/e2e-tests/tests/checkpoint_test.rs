//! E2E tests for checkpoint persistence across restarts.

use std::sync::Arc;

use chrono::Utc;
use pretty_assertions::assert_eq;

use e2e_tests::{FakeRegistry, TestHarness};
use mirror_storage::CheckpointStore;
use mirror_types::{Checkpoint, CheckpointPatch, Stage};

#[tokio::test]
async fn test_partial_saves_merge_and_survive_reopen() {
    let harness = TestHarness::new();
    let initial = harness.checkpoint.check().await.unwrap();
    assert_eq!(initial, Checkpoint::default());

    harness.checkpoint.save(CheckpointPatch::sequence(7)).await.unwrap();
    harness.checkpoint.save(CheckpointPatch::last_key("m")).await.unwrap();
    let finished_at = Utc::now();
    harness
        .checkpoint
        .save(CheckpointPatch::bootstrap_finished(finished_at))
        .await
        .unwrap();
    harness
        .checkpoint
        .save(CheckpointPatch::stage(Stage::Watch))
        .await
        .unwrap();

    let reopened = CheckpointStore::new(harness.storage.clone(), false);
    let checkpoint = reopened.check().await.unwrap();
    assert_eq!(checkpoint.sequence, Some(7));
    assert_eq!(checkpoint.bootstrap_last_key.as_deref(), Some("m"));
    assert!(checkpoint.bootstrap_done);
    assert_eq!(checkpoint.stage, Stage::Watch);
}

#[tokio::test]
async fn test_seed_resets_on_first_check() {
    let harness = TestHarness::new();
    harness.checkpoint.check().await.unwrap();
    harness.checkpoint.save(CheckpointPatch::sequence(99)).await.unwrap();

    let seeded = CheckpointStore::new(harness.storage.clone(), true);
    let checkpoint = seeded.check().await.unwrap();
    assert_eq!(checkpoint, Checkpoint::default());
}

#[tokio::test]
async fn test_bootstrap_cursor_never_moves_backwards() {
    let harness = TestHarness::new();
    harness.checkpoint.check().await.unwrap();
    assert!(harness.checkpoint.advance_last_key("k").await.unwrap());
    assert!(!harness.checkpoint.advance_last_key("c").await.unwrap());
    assert!(!harness.checkpoint.advance_last_key("k").await.unwrap());
    assert!(harness.checkpoint.advance_last_key("q").await.unwrap());

    let checkpoint = harness.checkpoint.get().await.unwrap();
    assert_eq!(checkpoint.bootstrap_last_key.as_deref(), Some("q"));
}

#[tokio::test]
async fn test_prefetch_resumes_after_saved_key() {
    let harness = TestHarness::new();
    harness.checkpoint.check().await.unwrap();
    harness.checkpoint.save(CheckpointPatch::last_key("b")).await.unwrap();
    let registry = Arc::new(FakeRegistry::with_packages(&["a", "b", "c", "d"]));

    let bootstrap = harness.bootstrap(registry.clone());
    assert!(bootstrap.run().await.unwrap());

    let mut fetched: Vec<String> = registry.fetched().into_iter().map(|(id, _)| id).collect();
    fetched.sort();
    assert_eq!(fetched, vec!["c", "d"]);
}
