//! Core logging types: resource entries, status, and the [`Log`] trait.

/// Per-resource result for summary reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    /// Resource label (`kind locator`).
    pub name: String,
    /// Final status of the resource.
    pub status: ResourceStatus,
    /// Optional detail message (e.g., skip reason or error description).
    pub message: Option<String>,
}

/// Status of a processed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    /// State was captured or applied.
    Ok,
    /// The live state already matched the record.
    Unchanged,
    /// Nothing to do (e.g., no record for an optional resource).
    Skipped,
    /// Dry-run mode; no changes were made.
    DryRun,
    /// The resource failed.
    Failed,
}

/// Abstraction over logging backends.
///
/// The executor and providers log through this trait so tests can observe
/// recorded entries without a global subscriber.
pub trait Log: Send + Sync {
    /// Log a stage header (major section).
    fn stage(&self, msg: &str);
    /// Log an informational message.
    fn info(&self, msg: &str);
    /// Log a debug message (may be suppressed on console).
    fn debug(&self, msg: &str);
    /// Log a warning message.
    fn warn(&self, msg: &str);
    /// Log an error message.
    fn error(&self, msg: &str);
    /// Log a dry-run action message.
    fn dry_run(&self, msg: &str);
    /// Record a resource result for the summary.
    fn record(&self, name: &str, status: ResourceStatus, message: Option<&str>);
}
