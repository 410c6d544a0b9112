//! Structured logger with dry-run awareness and summary collection.
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::{Log, ResourceEntry, ResourceStatus};
use super::files::log_file_path;

/// Implement the display methods of [`Log`] by delegating to inherent methods
/// of the same name on the implementing type.
macro_rules! forward_log_methods {
    ($($method:ident),+ $(,)?) => {
        $(
            fn $method(&self, msg: &str) {
                self.$method(msg);
            }
        )+
    };
}

/// Structured logger with dry-run awareness and summary collection.
///
/// All messages also land in the run log `<log dir>/<command>.log` as
/// timestamped plain text, regardless of the verbose flag. The log dir is
/// `$SNAPSTATE_LOG_DIR`, else `%LOCALAPPDATA%\snapstate\logs` on Windows
/// and `$XDG_STATE_HOME/snapstate/logs` (or `~/.local/state/...`) elsewhere.
#[derive(Debug, Default)]
pub struct Logger {
    entries: Mutex<Vec<ResourceEntry>>,
    log_file: Option<PathBuf>,
}

impl Logger {
    /// Create a logger for `command`.
    ///
    /// Stores the log file path for display in the run summary. The file
    /// itself is written by the subscriber installed with
    /// [`init_subscriber`](super::subscriber::init_subscriber).
    #[must_use]
    pub fn new(command: &str) -> Self {
        Self::with_log_file(log_file_path(command))
    }

    /// Create a logger that reports `log_file` in its summary.
    #[must_use]
    pub fn with_log_file(log_file: Option<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            log_file,
        }
    }

    /// Return the log file path, if available.
    #[must_use]
    pub fn log_path(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Return a clone of all recorded entries.
    #[must_use]
    pub fn entries(&self) -> Vec<ResourceEntry> {
        self.entries.lock().map_or_else(|_| vec![], |g| g.clone())
    }

    /// Log an error message.
    pub fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }

    /// Log a warning message.
    pub fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
    }

    /// Log a stage header (major section).
    pub fn stage(&self, msg: &str) {
        tracing::info!(target: "snapstate::stage", "{msg}");
    }

    /// Log an informational message.
    pub fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    /// Log a debug message (suppressed on console unless verbose; always
    /// written to the log file).
    pub fn debug(&self, msg: &str) {
        tracing::debug!("{msg}");
    }

    /// Log a dry-run action message.
    pub fn dry_run(&self, msg: &str) {
        tracing::info!(target: "snapstate::dry_run", "{msg}");
    }

    /// Record a resource result for the summary.
    pub fn record(&self, name: &str, status: ResourceStatus, message: Option<&str>) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.push(ResourceEntry {
                name: name.to_string(),
                status,
                message: message.map(String::from),
            });
        }
    }

    /// Count the number of failed resources.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.entries.lock().map_or(0, |guard| {
            guard
                .iter()
                .filter(|t| t.status == ResourceStatus::Failed)
                .count()
        })
    }

    /// Print the summary of all recorded resources.
    pub fn print_summary(&self) {
        let entries = self.entries();
        if entries.is_empty() {
            return;
        }

        self.stage("Summary");

        let mut ok = 0u32;
        let mut unchanged = 0u32;
        let mut skipped = 0u32;
        let mut dry_run = 0u32;
        let mut failed = 0u32;

        for entry in &entries {
            let (icon, color) = match entry.status {
                ResourceStatus::Ok => {
                    ok += 1;
                    ("✓", "\x1b[32m")
                }
                ResourceStatus::Unchanged => {
                    unchanged += 1;
                    ("·", "\x1b[2m")
                }
                ResourceStatus::Skipped => {
                    skipped += 1;
                    ("○", "\x1b[33m")
                }
                ResourceStatus::DryRun => {
                    dry_run += 1;
                    ("~", "\x1b[37m")
                }
                ResourceStatus::Failed => {
                    failed += 1;
                    ("✗", "\x1b[31m")
                }
            };

            let suffix = entry
                .message
                .as_ref()
                .map_or_else(String::new, |msg| format!(" ({msg})"));

            self.info(&format!("{color}{icon} {}{suffix}\x1b[0m", entry.name));
        }

        let total = ok + unchanged + skipped + dry_run + failed;
        self.info(&format!(
            "{total} resources: \x1b[32m{ok} ok\x1b[0m, \x1b[2m{unchanged} unchanged\x1b[0m, \x1b[33m{skipped} skipped\x1b[0m, \x1b[37m{dry_run} dry-run\x1b[0m, \x1b[31m{failed} failed\x1b[0m"
        ));

        if let Some(path) = &self.log_file {
            self.info(&format!("\x1b[2mlog: {}\x1b[0m", path.display()));
        }
    }
}

impl Log for Logger {
    forward_log_methods!(stage, info, debug, warn, error, dry_run);

    fn record(&self, name: &str, status: ResourceStatus, message: Option<&str>) {
        self.record(name, status, message);
    }
}
