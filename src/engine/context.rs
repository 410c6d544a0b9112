use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::crypto::EncryptionContext;
use crate::exec::Executor;
use crate::locator::Environment;
use crate::logging::Log;
use crate::platform::Platform;

/// Shared context for one executor invocation.
pub struct Context {
    /// Encryption service used to seal and open fields.
    pub crypto: Arc<EncryptionContext>,
    /// Command executor (for testing or real system calls).
    pub executor: Arc<dyn Executor>,
    /// Logger for output and resource recording.
    pub log: Arc<dyn Log>,
    /// Home directory and variables used to expand locators into paths.
    pub env: Arc<Environment>,
    /// Detected platform information.
    pub platform: Arc<Platform>,
    /// Whether to preview changes without writing anything.
    pub dry_run: bool,
    /// Set from the Ctrl-C handler; checked between descriptors.
    pub cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("crypto", &self.crypto)
            .field("executor", &"<dyn Executor>")
            .field("log", &"<dyn Log>")
            .field("env", &self.env)
            .field("platform", &self.platform)
            .field("dry_run", &self.dry_run)
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl Context {
    /// Creates a context that is not yet cancelled.
    #[must_use]
    pub fn new(
        crypto: Arc<EncryptionContext>,
        executor: Arc<dyn Executor>,
        log: Arc<dyn Log>,
        env: Arc<Environment>,
        platform: Arc<Platform>,
        dry_run: bool,
    ) -> Self {
        Self {
            crypto,
            executor,
            log,
            env,
            platform,
            dry_run,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned cancellation flag.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}
