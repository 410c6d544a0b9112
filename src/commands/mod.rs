//! Subcommand implementations.
pub mod analyze;
pub mod execute;
pub mod plan;
pub mod records;
pub mod show;
pub mod validate;
pub mod version;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::cli::GlobalOpts;
use crate::config::Settings;
use crate::engine::{Context, TemplateExecutor};
use crate::error::TemplateError;
use crate::exec::SystemExecutor;
use crate::locator::{Environment, Normalizer};
use crate::logging::{Log, Logger};
use crate::platform::Platform;
use crate::resources::ProviderRegistry;
use crate::template::{DirectorySource, ResolvedTemplate, load_template};

/// Shared state produced by the common command setup sequence.
///
/// Encapsulates platform detection, settings loading and path resolution so
/// that each command does not have to repeat the boilerplate.
#[derive(Debug)]
pub struct CommandSetup {
    /// Detected platform.
    pub platform: Platform,
    /// Loaded settings.
    pub settings: Settings,
    /// Normalizer with configured drive mappings.
    pub normalizer: Normalizer,
    /// Resolved template directory.
    pub templates: PathBuf,
    /// Resolved snapshot directory.
    pub state_dir: PathBuf,
}

impl CommandSetup {
    /// Detect the platform, load settings and resolve directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be loaded or a drive
    /// mapping is malformed.
    pub fn init(global: &GlobalOpts, log: &Logger) -> Result<Self> {
        let platform = Platform::detect();
        let settings = Settings::load(global.config.as_deref())?;
        let normalizer = settings.normalizer(&platform)?;
        let templates = canonical(settings.templates_dir(global.templates.as_deref()));
        let state_dir = canonical(settings.state_dir(global.state_dir.as_deref()));

        log.debug(&format!("platform: {} ({})", platform.os, platform.machine_name));
        log.debug(&format!("templates: {}", templates.display()));
        log.debug(&format!("snapshot: {}", state_dir.display()));
        if !settings.drives.is_empty() {
            log.debug(&format!("{} drive mapping(s)", settings.drives.len()));
        }

        Ok(Self {
            platform,
            settings,
            normalizer,
            templates,
            state_dir,
        })
    }

    /// Load and resolve `name` from the template directory.
    ///
    /// # Errors
    ///
    /// Returns the loader error.
    pub fn load(&self, name: &str) -> Result<ResolvedTemplate, TemplateError> {
        load_template(name, &DirectorySource::new(&self.templates), &self.normalizer)
    }

    /// Executor over the template directory with the built-in providers.
    #[must_use]
    pub fn executor(&self) -> TemplateExecutor {
        TemplateExecutor::new(
            DirectorySource::new(&self.templates),
            self.normalizer.clone(),
            ProviderRegistry::standard(),
        )
    }

    /// Context for a run on this host.
    #[must_use]
    pub fn context(
        &self,
        global: &GlobalOpts,
        log: Arc<Logger>,
        cancel: Arc<AtomicBool>,
    ) -> Context {
        Context::new(
            Arc::new(self.settings.encryption_context()),
            Arc::new(SystemExecutor),
            log as Arc<dyn Log>,
            Arc::new(Environment::from_process()),
            Arc::new(self.platform.clone()),
            global.dry_run,
        )
        .with_cancel(cancel)
    }
}

/// Resolve an existing directory without the `\\?\` prefix Windows adds.
fn canonical(path: PathBuf) -> PathBuf {
    dunce::canonicalize(&path).unwrap_or(path)
}

/// Log every validation problem of a failed load.
pub fn report_template_error(err: &TemplateError, log: &Logger) {
    log.error(&err.to_string());
    if let TemplateError::Load { errors, .. } = err {
        for problem in errors {
            log.error(&format!("  {problem}"));
        }
    }
}
