//! Configuration loading for registry-mirror.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/registry-mirror/config.toml.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::MirrorError;

/// Upstream endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// CouchDB-compatible registry base URL
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Downloads API base URL
    #[serde(default = "default_downloads_url")]
    pub downloads_url: String,

    /// Package file listing API base URL
    #[serde(default = "default_files_url")]
    pub files_url: String,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_registry_url() -> String {
    "https://replicate.npmjs.com".to_string()
}

fn default_downloads_url() -> String {
    "https://api.npmjs.org/downloads".to_string()
}

fn default_files_url() -> String {
    "https://data.jsdelivr.com/v1/package/npm".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            downloads_url: default_downloads_url(),
            files_url: default_files_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Names of the indices the pipeline reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Production search index
    #[serde(default = "default_production_index")]
    pub production: String,

    /// Target of the one-time full pass, copied to production when done
    #[serde(default = "default_bootstrap_index")]
    pub bootstrap: String,

    /// Retry bookkeeping for bootstrap work items
    #[serde(default = "default_bootstrap_queue_index")]
    pub bootstrap_queue: String,

    /// Retry bookkeeping for watch work items
    #[serde(default = "default_watch_queue_index")]
    pub watch_queue: String,

    /// Ledger of packages confirmed deleted upstream
    #[serde(default = "default_not_found_index")]
    pub not_found: String,

    /// Periodic data (downloads) kept apart from production
    #[serde(default = "default_data_index")]
    pub data: String,
}

fn default_production_index() -> String {
    "npm-search".to_string()
}

fn default_bootstrap_index() -> String {
    "npm-search.bootstrap".to_string()
}

fn default_bootstrap_queue_index() -> String {
    "npm-search.bootstrap.queue".to_string()
}

fn default_watch_queue_index() -> String {
    "npm-search.watch.queue".to_string()
}

fn default_not_found_index() -> String {
    "npm-search.notFound".to_string()
}

fn default_data_index() -> String {
    "npm-search.data".to_string()
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            production: default_production_index(),
            bootstrap: default_bootstrap_index(),
            bootstrap_queue: default_bootstrap_queue_index(),
            watch_queue: default_watch_queue_index(),
            not_found: default_not_found_index(),
            data: default_data_index(),
        }
    }
}

/// Tuning knobs for the replication pipeline.
///
/// `record_concurrency` must stay above `task_concurrency` so discovery
/// never starves execution; [`PipelineSettings::validate`] enforces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Force a fresh bootstrap on startup
    #[serde(default)]
    pub seed: bool,

    /// Registry listing page size
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Maximum listing rows buffered ahead of the indexer
    #[serde(default = "default_prefetch_window")]
    pub prefetch_window: usize,

    /// Hits per facet scan page
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,

    /// Record (discovery) queue concurrency
    #[serde(default = "default_record_concurrency")]
    pub record_concurrency: usize,

    /// Task (execution) queue concurrency
    #[serde(default = "default_task_concurrency")]
    pub task_concurrency: usize,

    /// Minimum seconds between facet value enumerations
    #[serde(default = "default_facet_refresh_secs")]
    pub facet_refresh_secs: u64,

    /// Minimum seconds between two discovery passes
    #[serde(default = "default_min_pass_delay_secs")]
    pub min_pass_delay_secs: u64,

    /// Changes requested per feed poll
    #[serde(default = "default_changes_batch_size")]
    pub changes_batch_size: usize,

    /// Sleep after an empty changes batch
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// First backoff delay after a feed error
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Pause after an upstream rate-limit response
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,

    /// Bootstrap progress log interval
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,

    /// Failed attempts before an item is moved to the not-found ledger
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long refreshed download data stays fresh
    #[serde(default = "default_periodic_refresh_hours")]
    pub periodic_refresh_hours: u64,

    /// Zero-download packages older than this are checked for deletion
    #[serde(default = "default_deleted_check_min_age_days")]
    pub deleted_check_min_age_days: u64,

    /// Unscoped packages per downloads batch
    #[serde(default = "default_periodic_batch_size")]
    pub periodic_batch_size: usize,
}

fn default_page_size() -> usize {
    100
}

fn default_prefetch_window() -> usize {
    1000
}

fn default_scan_page_size() -> usize {
    1000
}

fn default_record_concurrency() -> usize {
    240
}

fn default_task_concurrency() -> usize {
    120
}

fn default_facet_refresh_secs() -> u64 {
    60
}

fn default_min_pass_delay_secs() -> u64 {
    10
}

fn default_changes_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_rate_limit_cooldown_secs() -> u64 {
    30
}

fn default_progress_interval_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_periodic_refresh_hours() -> u64 {
    24 * 7
}

fn default_deleted_check_min_age_days() -> u64 {
    365
}

fn default_periodic_batch_size() -> usize {
    127
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            seed: false,
            page_size: default_page_size(),
            prefetch_window: default_prefetch_window(),
            scan_page_size: default_scan_page_size(),
            record_concurrency: default_record_concurrency(),
            task_concurrency: default_task_concurrency(),
            facet_refresh_secs: default_facet_refresh_secs(),
            min_pass_delay_secs: default_min_pass_delay_secs(),
            changes_batch_size: default_changes_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            progress_interval_secs: default_progress_interval_secs(),
            max_retries: default_max_retries(),
            periodic_refresh_hours: default_periodic_refresh_hours(),
            deleted_check_min_age_days: default_deleted_check_min_age_days(),
            periodic_batch_size: default_periodic_batch_size(),
        }
    }
}

impl PipelineSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.page_size == 0 || self.scan_page_size == 0 || self.changes_batch_size == 0 {
            return Err("page sizes must be > 0".to_string());
        }
        if self.task_concurrency == 0 {
            return Err("task_concurrency must be > 0".to_string());
        }
        if self.record_concurrency <= self.task_concurrency {
            return Err(format!(
                "record_concurrency ({}) must exceed task_concurrency ({})",
                self.record_concurrency, self.task_concurrency
            ));
        }
        if self.periodic_batch_size == 0 {
            return Err("periodic_batch_size must be > 0".to_string());
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err("backoff_initial_ms must not exceed backoff_max_ms".to_string());
        }
        Ok(())
    }

    pub fn facet_refresh(&self) -> Duration {
        Duration::from_secs(self.facet_refresh_secs)
    }

    pub fn min_pass_delay(&self) -> Duration {
        Duration::from_secs(self.min_pass_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn periodic_refresh(&self) -> chrono::Duration {
        chrono::Duration::hours(self.periodic_refresh_hours as i64)
    }

    pub fn deleted_check_min_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.deleted_check_min_age_days as i64)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the RocksDB directory (checkpoint + local indices)
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds to wait for graceful drain before a hard exit
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub indices: IndexSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "registry-mirror")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            registry: RegistrySettings::default(),
            indices: IndexSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/registry-mirror/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (MIRROR_*, `__` between sections)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, MirrorError> {
        let config_dir = ProjectDirs::from("", "", "registry-mirror")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| MirrorError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| MirrorError::Config(e.to_string()))?
            .set_default("shutdown_timeout_secs", default_shutdown_timeout_secs() as i64)
            .map_err(|e| MirrorError::Config(e.to_string()))?
            .set_default("registry.url", default_registry_url())
            .map_err(|e| MirrorError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // MIRROR_DB_PATH, MIRROR_PIPELINE__SEED, MIRROR_INDICES__PRODUCTION, ...
        builder = builder.add_source(
            Environment::with_prefix("MIRROR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| MirrorError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| MirrorError::Config(e.to_string()))?;

        settings
            .pipeline
            .validate()
            .map_err(MirrorError::Config)?;

        Ok(settings)
    }

    /// Expand ~ in db_path to the home directory
    pub fn expanded_db_path(&self) -> PathBuf {
        if let Some(rest) = self.db_path.strip_prefix("~/") {
            if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.indices.production, "npm-search");
        assert_eq!(settings.pipeline.record_concurrency, 240);
        assert_eq!(settings.pipeline.task_concurrency, 120);
        assert!(!settings.pipeline.seed);
    }

    #[test]
    fn test_load_with_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.pipeline.periodic_batch_size, 127);
        assert_eq!(settings.registry.url, "https://replicate.npmjs.com");
    }

    #[test]
    fn test_pipeline_validation() {
        let mut pipeline = PipelineSettings::default();
        assert!(pipeline.validate().is_ok());

        pipeline.record_concurrency = 10;
        pipeline.task_concurrency = 10;
        assert!(pipeline.validate().is_err());

        pipeline.record_concurrency = 20;
        assert!(pipeline.validate().is_ok());

        pipeline.page_size = 0;
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_partial_pipeline_deserialization() {
        let json = r#"{"seed": true, "page_size": 2}"#;
        let pipeline: PipelineSettings = serde_json::from_str(json).unwrap();
        assert!(pipeline.seed);
        assert_eq!(pipeline.page_size, 2);
        assert_eq!(pipeline.max_retries, 5);
    }

    #[test]
    fn test_expanded_db_path_plain() {
        let settings = Settings {
            db_path: "/var/lib/mirror".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.expanded_db_path(), PathBuf::from("/var/lib/mirror"));
    }
}
