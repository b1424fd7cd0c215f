//! Enrichment collaborators and the derivations built on them.
//!
//! Download counts and file listings come from auxiliary services behind
//! the [`Downloads`] and [`FileListing`] traits. Changelog location and
//! type-support classification are pure functions of a file listing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::EnrichError;

/// Share of total downloads (in percent) above which a package is popular.
pub const POPULAR_RATIO: f64 = 0.005;

/// Downloads API.
#[async_trait]
pub trait Downloads: Send + Sync {
    /// Last-30-day downloads for each name. Names the API has no record of
    /// are absent from the map.
    async fn downloads(&self, names: &[String]) -> Result<HashMap<String, u64>, EnrichError>;

    /// Last-30-day downloads across the whole registry.
    async fn total(&self) -> Result<u64, EnrichError>;
}

/// One file of a published package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFile {
    /// Path from the package root, with a leading `/`
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

/// Package file listing API.
#[async_trait]
pub trait FileListing: Send + Sync {
    async fn files(&self, name: &str, version: &str) -> Result<Vec<PackageFile>, EnrichError>;
}

/// Registry-wide download total.
///
/// Owned by the daemon, loaded once with [`DownloadTotals::load`] before
/// the periodic indexer starts, then only read. Reloading replaces the
/// value atomically.
#[derive(Debug, Default)]
pub struct DownloadTotals {
    total: AtomicU64,
}

impl DownloadTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-loaded total, mainly for tests.
    pub fn with_total(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
        }
    }

    pub async fn load(&self, source: &dyn Downloads) -> Result<u64, EnrichError> {
        let total = source.total().await?;
        self.total.store(total, Ordering::SeqCst);
        info!(total, "Loaded registry download total");
        Ok(total)
    }

    /// `None` until loaded.
    pub fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    /// Popularity fields for a package with `downloads` in the last 30 days.
    pub fn popularity(&self, downloads: u64) -> Value {
        let ratio = match self.total() {
            Some(total) => downloads as f64 / total as f64 * 100.0,
            None => 0.0,
        };
        json!({
            "downloadsLast30Days": downloads,
            "humanDownloadsLast30Days": human_downloads(downloads),
            "downloadsRatio": ratio,
            "popular": ratio > POPULAR_RATIO,
        })
    }
}

/// Compact download count: `950`, `1.2k`, `3.4m`.
pub fn human_downloads(n: u64) -> String {
    match n {
        0..=999 => n.to_string(),
        1_000..=999_999 => trim_decimal(n as f64 / 1_000.0, "k"),
        1_000_000..=999_999_999 => trim_decimal(n as f64 / 1_000_000.0, "m"),
        _ => trim_decimal(n as f64 / 1_000_000_000.0, "b"),
    }
}

fn trim_decimal(value: f64, unit: &str) -> String {
    let rounded = format!("{:.1}", value);
    let rounded = rounded.strip_suffix(".0").unwrap_or(&rounded);
    format!("{rounded}{unit}")
}

/// Root-level changelog names, most specific first.
const CHANGELOG_NAMES: &[&str] = &[
    "changelog.md",
    "changelog",
    "changes.md",
    "changes",
    "history.md",
    "history",
    "news.md",
    "releases.md",
];

/// Path of the package's changelog, if it ships one at its root.
pub fn changelog_filename(files: &[PackageFile]) -> Option<String> {
    CHANGELOG_NAMES.iter().find_map(|candidate| {
        files
            .iter()
            .find(|file| {
                let path = file.name.trim_start_matches('/');
                !path.contains('/') && path.eq_ignore_ascii_case(candidate)
            })
            .map(|file| file.name.clone())
    })
}

/// TypeScript support: `included` when the manifest declares types or a
/// declaration file ships in the tarball.
pub fn type_support(record: &Value, files: &[PackageFile]) -> Value {
    let declared = record
        .get("types")
        .and_then(|t| t.get("ts"))
        .and_then(Value::as_str)
        == Some("included");
    let shipped = files
        .iter()
        .any(|f| f.name.ends_with(".d.ts") || f.name.ends_with(".d.mts"));

    if declared || shipped {
        json!({ "ts": "included" })
    } else {
        json!({ "ts": false })
    }
}

/// Module formats inferred from file extensions.
pub fn module_types(files: &[PackageFile]) -> Vec<&'static str> {
    let mut types = Vec::new();
    if files.iter().any(|f| f.name.ends_with(".mjs")) {
        types.push("esm");
    }
    if files
        .iter()
        .any(|f| f.name.ends_with(".cjs") || f.name.ends_with(".js"))
    {
        types.push("cjs");
    }
    if types.is_empty() {
        types.push("unknown");
    }
    types
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> PackageFile {
        PackageFile {
            name: name.to_string(),
            size: 1,
        }
    }

    #[test]
    fn test_changelog_prefers_root_changelog() {
        let files = vec![
            file("/docs/CHANGELOG.md"),
            file("/HISTORY.md"),
            file("/CHANGELOG.md"),
            file("/index.js"),
        ];
        assert_eq!(changelog_filename(&files).as_deref(), Some("/CHANGELOG.md"));
    }

    #[test]
    fn test_changelog_falls_back_to_history() {
        let files = vec![file("/History.md"), file("/lib/changes.md")];
        assert_eq!(changelog_filename(&files).as_deref(), Some("/History.md"));
        assert_eq!(changelog_filename(&[file("/index.js")]), None);
    }

    #[test]
    fn test_type_support() {
        let plain = json!({"objectID": "a"});
        assert_eq!(type_support(&plain, &[file("/index.d.ts")]), json!({"ts": "included"}));
        assert_eq!(type_support(&plain, &[file("/index.js")]), json!({"ts": false}));

        let declared = json!({"objectID": "a", "types": {"ts": "included"}});
        assert_eq!(type_support(&declared, &[]), json!({"ts": "included"}));
    }

    #[test]
    fn test_module_types() {
        assert_eq!(module_types(&[file("/a.mjs"), file("/b.js")]), vec!["esm", "cjs"]);
        assert_eq!(module_types(&[file("/README.md")]), vec!["unknown"]);
    }

    #[test]
    fn test_human_downloads() {
        assert_eq!(human_downloads(950), "950");
        assert_eq!(human_downloads(1_000), "1k");
        assert_eq!(human_downloads(1_260), "1.3k");
        assert_eq!(human_downloads(3_400_000), "3.4m");
    }

    #[test]
    fn test_popularity_uses_loaded_total() {
        let totals = DownloadTotals::new();
        assert_eq!(totals.total(), None);
        assert_eq!(totals.popularity(10)["popular"], false);

        let totals = DownloadTotals::with_total(1_000_000);
        let fields = totals.popularity(1_000);
        assert_eq!(fields["downloadsLast30Days"], 1_000);
        assert_eq!(fields["popular"], true);
        assert_eq!(totals.popularity(0)["popular"], false);
    }
}
