//! Pipeline checkpoint.
//!
//! A single record tracks how far the mirror has progressed: the last
//! applied change-feed sequence, the bootstrap listing cursor and whether
//! the one-time bootstrap pass has completed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

/// Which phase currently owns the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Full registry traversal
    #[default]
    Bootstrap,
    /// Live change-feed consumption
    Watch,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Bootstrap => write!(f, "bootstrap"),
            Stage::Watch => write!(f, "watch"),
        }
    }
}

/// Durable progress record.
///
/// Once `bootstrap_done` is true and `sequence` is set the bootstrap pass
/// never runs again; only [`Checkpoint::default`] (a reset) clears both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last fully-applied change-feed position
    pub sequence: Option<u64>,

    pub bootstrap_done: bool,

    /// Last listing key whose rows are persisted in the bootstrap queue
    pub bootstrap_last_key: Option<String>,

    /// Milliseconds since epoch
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub bootstrap_last_done_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub stage: Stage,
}

/// Partial checkpoint update. `None` fields leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointPatch {
    pub sequence: Option<u64>,
    pub bootstrap_done: Option<bool>,
    pub bootstrap_last_key: Option<String>,
    pub bootstrap_last_done_at: Option<DateTime<Utc>>,
    pub stage: Option<Stage>,
}

impl CheckpointPatch {
    pub fn sequence(sequence: u64) -> Self {
        Self {
            sequence: Some(sequence),
            ..Default::default()
        }
    }

    pub fn last_key(key: impl Into<String>) -> Self {
        Self {
            bootstrap_last_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    /// Marks the bootstrap pass complete at `at`.
    pub fn bootstrap_finished(at: DateTime<Utc>) -> Self {
        Self {
            bootstrap_done: Some(true),
            bootstrap_last_done_at: Some(at),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == CheckpointPatch::default()
    }
}

impl Checkpoint {
    /// Field-wise override of `self` by the fields present in `patch`.
    pub fn merge(&self, patch: &CheckpointPatch) -> Checkpoint {
        Checkpoint {
            sequence: patch.sequence.or(self.sequence),
            bootstrap_done: patch.bootstrap_done.unwrap_or(self.bootstrap_done),
            bootstrap_last_key: patch
                .bootstrap_last_key
                .clone()
                .or_else(|| self.bootstrap_last_key.clone()),
            bootstrap_last_done_at: patch.bootstrap_last_done_at.or(self.bootstrap_last_done_at),
            stage: patch.stage.unwrap_or(self.stage),
        }
    }

    /// True when the one-time pass must not run again.
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrap_done && self.sequence.is_some()
    }

    /// Serialize to JSON bytes for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, MirrorError> {
        serde_json::to_vec(self).map_err(MirrorError::from)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MirrorError> {
        serde_json::from_slice(bytes).map_err(MirrorError::from)
    }
}
