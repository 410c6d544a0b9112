// Shared helpers for integration tests.
//
// Provides a sandbox of temporary directories (a fake home, a template
// directory and a snapshot directory) plus a context wired to it, so each
// integration test can run the executor end to end without touching the
// real machine.
//
// Used by all integration test binaries that declare `mod common;`.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapstate::crypto::{EncryptionContext, KeySource, StaticKey};
use snapstate::engine::{Context, TemplateExecutor};
use snapstate::exec::{ExecResult, Executor};
use snapstate::locator::{Environment, Normalizer};
use snapstate::logging::{Log, Logger};
use snapstate::platform::{Os, Platform};
use snapstate::resources::registry::MemoryRegistry;
use snapstate::resources::{FileProvider, ProviderRegistry, RegistryProvider};
use snapstate::template::DirectorySource;

/// Executor that refuses every command.
///
/// File and in-memory registry providers never shell out, so any call here
/// shows up as a failed resource.
#[derive(Debug)]
pub struct NoCommands;

impl Executor for NoCommands {
    fn run(&self, program: &str, _: &[&str]) -> anyhow::Result<ExecResult> {
        anyhow::bail!("{program} is not available in tests")
    }

    fn run_unchecked(&self, program: &str, args: &[&str]) -> anyhow::Result<ExecResult> {
        self.run(program, args)
    }

    fn run_with_env(
        &self,
        program: &str,
        args: &[&str],
        _: &[(&str, &str)],
    ) -> anyhow::Result<ExecResult> {
        self.run(program, args)
    }

    fn which(&self, _: &str) -> bool {
        false
    }
}

/// An isolated machine backed by [`tempfile::TempDir`]s.
pub struct Sandbox {
    /// Stands in for the user's home directory.
    pub home: tempfile::TempDir,
    /// Template directory.
    pub templates: tempfile::TempDir,
    /// Snapshot directory.
    pub state: tempfile::TempDir,
    /// Registry shared by every executor built from this sandbox.
    pub registry: MemoryRegistry,
}

impl Sandbox {
    /// Create an empty sandbox.
    pub fn new() -> Self {
        Self {
            home: tempfile::tempdir().expect("create home dir"),
            templates: tempfile::tempdir().expect("create template dir"),
            state: tempfile::tempdir().expect("create state dir"),
            registry: MemoryRegistry::new(),
        }
    }

    /// Write `<name>.toml` into the template directory.
    pub fn template(&self, name: &str, toml: &str) -> &Self {
        std::fs::write(self.templates.path().join(format!("{name}.toml")), toml)
            .expect("write template");
        self
    }

    /// Write `content` to `relative` under the fake home.
    pub fn home_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.home.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        std::fs::write(&path, content).expect("write home file");
        path
    }

    /// Read `relative` under the fake home.
    pub fn read_home(&self, relative: &str) -> String {
        std::fs::read_to_string(self.home.path().join(relative)).expect("read home file")
    }

    /// Snapshot directory path.
    pub fn state_dir(&self) -> &Path {
        self.state.path()
    }

    /// Executor over the template directory with file and registry providers.
    pub fn executor(&self) -> TemplateExecutor {
        TemplateExecutor::new(
            DirectorySource::new(self.templates.path()),
            Normalizer::default(),
            ProviderRegistry::new()
                .with(FileProvider)
                .with(RegistryProvider::with_backend(self.registry.clone())),
        )
    }

    /// Context keyed with `key`, resolving `~` to the fake home.
    pub fn context_with(&self, key: impl KeySource + 'static, dry_run: bool) -> (Context, Arc<Logger>) {
        let log = Arc::new(Logger::with_log_file(None));
        let home = self.home.path().display().to_string();
        let ctx = Context::new(
            Arc::new(EncryptionContext::new(key)),
            Arc::new(NoCommands),
            Arc::clone(&log) as Arc<dyn Log>,
            Arc::new(Environment::default().with_home(home)),
            Arc::new(Platform::new(Os::Linux, "sandbox")),
            dry_run,
        );
        (ctx, log)
    }

    /// Context keyed with the default test key.
    pub fn context(&self) -> (Context, Arc<Logger>) {
        self.context_with(StaticKey::new([42; 32]), false)
    }
}
