//! One-time background strategy: changelog location and file-derived
//! fields, computed once per published version.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mirror_types::{
    changelog_filename, due_bucket, module_types, object_id, type_support, EnrichError, FileListing,
    SearchIndex, ONE_TIME_DONE, ONE_TIME_FACET,
};
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::{IndexTask, IndexerStrategy, Outcome};
use crate::error::IndexingError;

/// Days before a failed package is looked at again.
pub const ONE_TIME_RETRY_DAYS: i64 = 7;

pub struct OneTimeTask {
    pub object_id: String,
    pub record: Value,
}

impl IndexTask for OneTimeTask {
    fn object_ids(&self) -> Vec<&str> {
        vec![self.object_id.as_str()]
    }
}

pub struct OneTimeStrategy {
    index: Arc<dyn SearchIndex>,
    files: Arc<dyn FileListing>,
    production: String,
}

impl OneTimeStrategy {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        files: Arc<dyn FileListing>,
        production: impl Into<String>,
    ) -> Self {
        Self {
            index,
            files,
            production: production.into(),
        }
    }

    async fn patch(&self, object_id: &str, fields: Value) -> Result<(), IndexingError> {
        let mut record = fields;
        if let Some(obj) = record.as_object_mut() {
            obj.insert("objectID".into(), json!(object_id));
        }
        self.index
            .upsert_partial(&self.production, record, false)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IndexerStrategy for OneTimeStrategy {
    type Task = OneTimeTask;

    fn name(&self) -> &'static str {
        "one-time"
    }

    fn index_name(&self) -> &str {
        &self.production
    }

    fn facet_field(&self) -> &'static str {
        ONE_TIME_FACET
    }

    /// Due timestamps at or before now, excluding the done marker.
    fn facet_filter(&self, value: &str, now: DateTime<Utc>) -> bool {
        match value.parse::<i64>() {
            Ok(due) => due != ONE_TIME_DONE && due <= now.timestamp_millis(),
            Err(_) => false,
        }
    }

    async fn on_record(&self, hit: Value) -> Result<Vec<Self::Task>, IndexingError> {
        let id = object_id(&hit)
            .ok_or_else(|| IndexingError::InvalidRecord("missing objectID".to_string()))?
            .to_string();
        Ok(vec![OneTimeTask {
            object_id: id,
            record: hit,
        }])
    }

    async fn execute(&self, task: &Self::Task) -> Result<Outcome, IndexingError> {
        let name = task.record.get("name").and_then(Value::as_str).unwrap_or(task.object_id.as_str());
        let Some(version) = task.record.get("version").and_then(Value::as_str) else {
            self.patch(&task.object_id, json!({ ONE_TIME_FACET: ONE_TIME_DONE })).await?;
            return Ok(Outcome::Dropped("record has no version".to_string()));
        };

        let files = match self.files.files(name, version).await {
            Ok(files) => files,
            // Nothing published for this version, derive from the manifest alone
            Err(EnrichError::Missing(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let changelog = changelog_filename(&files);
        debug!(object_id = %task.object_id, changelog = ?changelog, files = files.len(), "One-time data");
        self.patch(
            &task.object_id,
            json!({
                "changelogFilename": changelog,
                "types": type_support(&task.record, &files),
                "moduleTypes": module_types(&files),
                ONE_TIME_FACET: ONE_TIME_DONE,
            }),
        )
        .await?;
        Ok(Outcome::Done)
    }

    async fn on_failure(&self, task: &Self::Task, _error: &IndexingError) -> Result<(), IndexingError> {
        let due = due_bucket(Utc::now() + Duration::days(ONE_TIME_RETRY_DAYS));
        self.patch(&task.object_id, json!({ ONE_TIME_FACET: due })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{local_index, MockFiles};
    use mirror_types::{PackageFile, DUE_BUCKET_MS};
    use std::collections::HashMap;

    fn file(name: &str) -> PackageFile {
        PackageFile {
            name: name.to_string(),
            size: 1,
        }
    }

    #[test]
    fn test_facet_filter() {
        let (index, _temp) = local_index();
        let strategy = OneTimeStrategy::new(index, Arc::new(MockFiles::default()), "prod");
        let now = Utc::now();

        assert!(strategy.facet_filter(&(now.timestamp_millis() - 1).to_string(), now));
        assert!(strategy.facet_filter(&now.timestamp_millis().to_string(), now));
        assert!(!strategy.facet_filter("0", now));
        assert!(!strategy.facet_filter(&(now.timestamp_millis() + 1000).to_string(), now));
        assert!(!strategy.facet_filter("soon", now));
    }

    #[tokio::test]
    async fn test_patches_changelog_and_marks_done() {
        let (index, _temp) = local_index();
        let record = json!({
            "objectID": "left-pad",
            "name": "left-pad",
            "version": "1.3.0",
            "types": {"ts": false},
            ONE_TIME_FACET: 1,
        });
        index.upsert("prod", record.clone()).await.unwrap();

        let files = MockFiles {
            files: HashMap::from([(
                "left-pad".to_string(),
                vec![file("/index.js"), file("/index.d.ts"), file("/CHANGELOG.md")],
            )]),
            fail: false,
        };
        let strategy = OneTimeStrategy::new(index.clone(), Arc::new(files), "prod");
        let task = strategy.on_record(record).await.unwrap().remove(0);

        assert_eq!(strategy.execute(&task).await.unwrap(), Outcome::Done);
        let stored = index.get("prod", "left-pad").await.unwrap().unwrap();
        assert_eq!(stored["changelogFilename"], "/CHANGELOG.md");
        assert_eq!(stored["types"], json!({"ts": "included"}));
        assert_eq!(stored["moduleTypes"], json!(["cjs"]));
        assert_eq!(stored[ONE_TIME_FACET], ONE_TIME_DONE);
        assert_eq!(stored["version"], "1.3.0");
    }

    #[tokio::test]
    async fn test_failure_reschedules_a_week_out() {
        let (index, _temp) = local_index();
        let record = json!({"objectID": "x", "name": "x", "version": "1.0.0", ONE_TIME_FACET: 1});
        index.upsert("prod", record.clone()).await.unwrap();

        let files = MockFiles {
            fail: true,
            ..Default::default()
        };
        let strategy = OneTimeStrategy::new(index.clone(), Arc::new(files), "prod");
        let task = strategy.on_record(record).await.unwrap().remove(0);

        let err = strategy.execute(&task).await.unwrap_err();
        strategy.on_failure(&task, &err).await.unwrap();

        let due = index.get("prod", "x").await.unwrap().unwrap()[ONE_TIME_FACET]
            .as_i64()
            .unwrap();
        let expected = (Utc::now() + Duration::days(ONE_TIME_RETRY_DAYS)).timestamp_millis();
        assert!(due <= expected);
        assert!(expected - due < DUE_BUCKET_MS + 60_000);
    }
}
