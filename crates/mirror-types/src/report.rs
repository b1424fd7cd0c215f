//! Error-tracking collaborator.

use tracing::error;

/// Sink for unexpected task failures.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, source: &str, object_id: &str, retries: u32, error: &str);
}

/// Reports through the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, source: &str, object_id: &str, retries: u32, error: &str) {
        error!(source, object_id, retries, error, "Unexpected task failure");
    }
}
