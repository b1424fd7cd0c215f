//! Registry document to search record.
//!
//! Formatting is a pure transform. A document that cannot be turned into
//! a usable record (design documents, fully unpublished packages) yields
//! `None` and is dropped by the caller.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::package::{due_bucket, Document, ONE_TIME_FACET, PERIODIC_FACET};

/// Hard ceiling on a serialized record.
pub const MAX_RECORD_BYTES: usize = 100_000;

/// Readme length kept in the record before the size check.
const MAX_README_CHARS: usize = 50_000;

/// Build the production record for `doc`, with both enrichment facets due at `now`.
pub fn format_document(doc: &Document, now: DateTime<Utc>) -> Option<Value> {
    if doc.id.starts_with("_design/") {
        return None;
    }
    let body = doc.body.as_object()?;

    let name = body
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&doc.id)
        .to_string();

    let latest = body
        .get("dist-tags")
        .and_then(|tags| tags.get("latest"))
        .and_then(Value::as_str)?;
    let manifest = body
        .get("versions")
        .and_then(|versions| versions.get(latest))
        .and_then(Value::as_object)?;

    let field = |key: &str| manifest.get(key).or_else(|| body.get(key));
    let time = body.get("time");

    let mut record = Map::new();
    record.insert("objectID".into(), json!(name));
    record.insert("name".into(), json!(name));
    record.insert("version".into(), json!(latest));
    record.insert("rev".into(), json!(doc.rev));
    record.insert(
        "description".into(),
        field("description").cloned().unwrap_or(Value::Null),
    );
    record.insert("keywords".into(), json!(keywords(field("keywords"))));
    record.insert("license".into(), json!(license(field("license"))));
    record.insert("homepage".into(), field("homepage").cloned().unwrap_or(Value::Null));
    record.insert("repository".into(), json!(repository(field("repository"))));
    record.insert(
        "deprecated".into(),
        manifest.get("deprecated").cloned().unwrap_or(json!(false)),
    );
    record.insert(
        "dependencies".into(),
        json!(manifest
            .get("dependencies")
            .and_then(Value::as_object)
            .map_or(0, Map::len)),
    );
    record.insert("types".into(), declared_types(manifest));
    record.insert("created".into(), json!(timestamp(time, "created")));
    record.insert("modified".into(), json!(timestamp(time, "modified")));
    record.insert(
        "readme".into(),
        json!(body
            .get("readme")
            .and_then(Value::as_str)
            .map(|r| r.chars().take(MAX_README_CHARS).collect::<String>())
            .unwrap_or_default()),
    );
    record.insert(ONE_TIME_FACET.into(), json!(due_bucket(now)));
    record.insert(PERIODIC_FACET.into(), json!(due_bucket(now)));

    enforce_size(Value::Object(record))
}

/// Drop the readme of an oversized record; reject it if that is not enough.
pub fn enforce_size(mut record: Value) -> Option<Value> {
    if serialized_len(&record) <= MAX_RECORD_BYTES {
        return Some(record);
    }
    if let Some(obj) = record.as_object_mut() {
        obj.insert("readme".into(), json!(""));
    }
    (serialized_len(&record) <= MAX_RECORD_BYTES).then_some(record)
}

fn serialized_len(record: &Value) -> usize {
    serde_json::to_vec(record).map_or(usize::MAX, |bytes| bytes.len())
}

fn keywords(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn license(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("type").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn repository(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn declared_types(manifest: &Map<String, Value>) -> Value {
    if manifest.contains_key("types") || manifest.contains_key("typings") {
        json!({ "ts": "included" })
    } else {
        json!({ "ts": false })
    }
}

fn timestamp(time: Option<&Value>, key: &str) -> Option<i64> {
    time?
        .get(key)?
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
}
