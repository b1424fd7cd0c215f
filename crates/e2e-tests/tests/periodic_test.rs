//! E2E tests for the periodic downloads refresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

use e2e_tests::{eventually, FakeDownloads, FakeRegistry, TestHarness};
use mirror_indexing::{Indexer, PeriodicConfig, PeriodicIndices, PeriodicStrategy};
use mirror_types::{DownloadTotals, SearchIndex, TracingReporter, PERIODIC_FACET};

const TWO_YEARS_AGO: &str = "2024-09-01T00:00:00.000Z";

fn record(name: &str) -> serde_json::Value {
    let created = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();
    json!({
        "objectID": name,
        "name": name,
        "created": created.timestamp_millis(),
        PERIODIC_FACET: 0,
    })
}

fn periodic_indexer(
    harness: &TestHarness,
    registry: Arc<FakeRegistry>,
    downloads: Arc<FakeDownloads>,
) -> Indexer<PeriodicStrategy> {
    let indices = &harness.settings.indices;
    let strategy = PeriodicStrategy::new(
        registry,
        harness.index.clone(),
        downloads,
        Arc::new(DownloadTotals::with_total(1_000_000)),
        PeriodicIndices {
            production: indices.production.clone(),
            data: indices.data.clone(),
            not_found: indices.not_found.clone(),
        },
        PeriodicConfig {
            batch_size: 10,
            refresh: chrono::Duration::hours(24),
            deleted_check_min_age: chrono::Duration::days(365),
        },
    );
    Indexer::new(
        strategy,
        harness.index.clone(),
        Arc::new(TracingReporter),
        harness.indexer_config(),
    )
}

#[tokio::test]
async fn test_unused_package_deleted_upstream_is_removed() {
    let harness = TestHarness::new();
    let production = harness.production().to_string();
    let data = harness.settings.indices.data.clone();
    let not_found = harness.settings.indices.not_found.clone();

    let registry = Arc::new(FakeRegistry::default());
    for name in ["abandoned", "quiet", "popular"] {
        registry.add_package(name, TWO_YEARS_AGO);
        harness.index.upsert(&production, record(name)).await.unwrap();
    }
    registry.remove_silently("abandoned");
    harness
        .index
        .upsert(&data, json!({"objectID": "abandoned", "downloadsLast30Days": 0}))
        .await
        .unwrap();

    let downloads = Arc::new(FakeDownloads::default());
    downloads.set("popular", 50_000);

    let indexer = periodic_indexer(&harness, registry.clone(), downloads.clone());
    let background = indexer.clone();
    let handle = tokio::spawn(async move { background.run().await });

    eventually(Duration::from_secs(10), || async {
        harness.index.get(&not_found, "abandoned").await.unwrap().is_some()
            && harness.index.get(&data, "quiet").await.unwrap().is_some()
            && harness.index.get(&data, "popular").await.unwrap().is_some()
    })
    .await;
    indexer.stop(false).await;
    handle.await.unwrap().unwrap();

    assert!(harness.index.get(&production, "abandoned").await.unwrap().is_none());
    assert!(harness.index.get(&data, "abandoned").await.unwrap().is_none());
    let entry = harness.index.get(&not_found, "abandoned").await.unwrap().unwrap();
    assert_eq!(entry["movedBy"], "periodicIndexer");

    // Still published upstream, so kept despite zero downloads
    let quiet = harness.index.get(&production, "quiet").await.unwrap().unwrap();
    assert_eq!(quiet["downloadsLast30Days"], 0);
    assert!(quiet[PERIODIC_FACET].as_i64().unwrap() > Utc::now().timestamp_millis());

    let popular = harness.index.get(&production, "popular").await.unwrap().unwrap();
    assert_eq!(popular["downloadsLast30Days"], 50_000);
    assert_eq!(popular["humanDownloadsLast30Days"], "50k");
    assert_eq!(popular["popular"], true);

    // Only suspects are looked up upstream
    let lookups: Vec<String> = registry.fetched().into_iter().map(|(id, _)| id).collect();
    assert!(lookups.contains(&"abandoned".to_string()));
    assert!(!lookups.contains(&"popular".to_string()));
}
