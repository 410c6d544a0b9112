//! Template executor: runs a Backup or Restore across every descriptor of a
//! resolved template.
//!
//! Descriptors are visited one at a time in
//! [`ResourceKind::EXECUTION_ORDER`]. Each failure is recorded against its
//! resource and the run continues, unless the descriptor is `required`, in
//! which case the run stops and the partial result travels inside
//! [`ExecutionError::Aborted`].
pub mod context;

pub use context::Context;

use std::fmt;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::error::TemplateError;
use crate::locator::{Normalizer, ResourceKind};
use crate::logging::ResourceStatus;
use crate::resources::{Manifest, Outcome, ProviderError, ProviderRegistry, ResourceChange, StateStore};
use crate::template::{Descriptor, ResolvedTemplate, TemplateSource, load_template};

/// Direction of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// System to snapshot store.
    Backup,
    /// Snapshot store to system.
    Restore,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup => f.write_str("backup"),
            Self::Restore => f.write_str("restore"),
        }
    }
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Nothing has run yet.
    #[default]
    Idle,
    /// Fetching and resolving the template.
    Loading,
    /// The template could not be loaded; nothing was touched.
    LoadFailed,
    /// The template resolved; no resource has been visited yet.
    Resolved,
    /// Visiting descriptors.
    Running,
    /// Every descriptor succeeded.
    Completed,
    /// At least one optional descriptor failed.
    CompletedWithErrors,
    /// A required descriptor failed and the run stopped.
    Aborted,
    /// Cancellation was requested between descriptors.
    Cancelled,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::LoadFailed => "load failed",
            Self::Resolved => "resolved",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed with errors",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result for one descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceOutcome {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Canonical locator.
    pub locator: String,
    /// Whether the resource succeeded.
    pub ok: bool,
    /// Failure message when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// What happened when `ok` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<ResourceChange>,
}

impl ResourceOutcome {
    fn succeeded(descriptor: &Descriptor, change: ResourceChange) -> Self {
        Self {
            kind: descriptor.kind(),
            locator: descriptor.locator.to_string(),
            ok: true,
            error: None,
            change: Some(change),
        }
    }

    fn failed(descriptor: &Descriptor, error: &ProviderError) -> Self {
        Self {
            kind: descriptor.kind(),
            locator: descriptor.locator.to_string(),
            ok: false,
            error: Some(error.to_string()),
            change: None,
        }
    }

    /// Summary label (`kind locator`).
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} {}", self.kind, self.locator)
    }
}

/// Outcome of one invocation, built fresh each time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Template that was run.
    pub template: String,
    /// Direction of the run.
    pub action: Action,
    /// Whether every visited descriptor succeeded.
    pub success: bool,
    /// Whether any applied change needs a reboot.
    pub requires_reboot: bool,
    /// Final state.
    pub state: RunState,
    /// Per-descriptor results in execution order.
    pub per_resource: Vec<ResourceOutcome>,
}

impl ExecutionResult {
    fn new(template: &str, action: Action) -> Self {
        Self {
            template: template.to_string(),
            action,
            success: true,
            requires_reboot: false,
            state: RunState::Running,
            per_resource: Vec::new(),
        }
    }

    /// Number of failed resources.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.per_resource.iter().filter(|r| !r.ok).count()
    }
}

/// Hard failures of an invocation.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The template or one of its ancestors could not be loaded.
    #[error("failed to load template '{name}': {source}")]
    LoadFailed {
        /// Requested template.
        name: String,
        /// Underlying loader error.
        source: TemplateError,
    },

    /// A required descriptor failed.
    #[error("required {kind} resource '{locator}' failed: {source}")]
    Aborted {
        /// Kind of the failing descriptor.
        kind: ResourceKind,
        /// Locator of the failing descriptor.
        locator: String,
        /// Provider failure.
        source: ProviderError,
        /// Results gathered before the run stopped.
        partial: Box<ExecutionResult>,
    },
}

/// Loads a template and runs one [`Action`] over it.
pub struct TemplateExecutor {
    source: Box<dyn TemplateSource>,
    normalizer: Normalizer,
    providers: ProviderRegistry,
    state: RunState,
}

impl fmt::Debug for TemplateExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateExecutor")
            .field("source", &self.source)
            .field("providers", &self.providers)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl TemplateExecutor {
    /// Create an executor over `source` with the given providers.
    #[must_use]
    pub fn new(
        source: impl TemplateSource + 'static,
        normalizer: Normalizer,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            source: Box::new(source),
            normalizer,
            providers,
            state: RunState::Idle,
        }
    }

    /// State reached by the most recent invocation.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Load and resolve `name` without touching any resource.
    ///
    /// # Errors
    ///
    /// Returns the loader error.
    pub fn resolve(&self, name: &str) -> Result<ResolvedTemplate, TemplateError> {
        load_template(name, self.source.as_ref(), &self.normalizer)
    }

    /// Run `action` for template `name` against the store at `state_dir`.
    ///
    /// Optional failures are recorded in the result, which is returned with
    /// [`RunState::CompletedWithErrors`]. Cancellation returns normally with
    /// [`RunState::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::LoadFailed`] before any resource is touched,
    /// or [`ExecutionError::Aborted`] when a required descriptor fails.
    pub fn invoke(
        &mut self,
        name: &str,
        action: Action,
        state_dir: &Path,
        ctx: &Context,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.state = RunState::Loading;
        ctx.log.stage(&format!("Loading template {name}"));
        let template = match self.resolve(name) {
            Ok(template) => template,
            Err(source) => {
                self.state = RunState::LoadFailed;
                return Err(ExecutionError::LoadFailed {
                    name: name.to_string(),
                    source,
                });
            }
        };
        self.state = RunState::Resolved;
        ctx.log.info(&format!(
            "{} v{}: {} resource(s) from {}",
            template.name,
            template.version,
            template.len(),
            template.ancestry.join(" -> ")
        ));

        let store = StateStore::new(state_dir);
        if action == Action::Restore {
            check_manifest(&template, &store, ctx);
        }

        self.state = RunState::Running;
        ctx.log.stage(match action {
            Action::Backup => "Capturing state",
            Action::Restore => "Restoring state",
        });

        let mut result = ExecutionResult::new(&template.name, action);
        for descriptor in template.iter() {
            if ctx.is_cancelled() {
                ctx.log.warn("cancelled; remaining resources were not visited");
                result.success = false;
                return Ok(self.finish(result, RunState::Cancelled));
            }
            match self.run_one(descriptor, action, &store, ctx) {
                Ok(outcome) => {
                    let entry = ResourceOutcome::succeeded(descriptor, outcome.change);
                    record(ctx, &entry);
                    result.requires_reboot |= outcome.requires_reboot;
                    result.per_resource.push(entry);
                }
                Err(source) => {
                    let entry = ResourceOutcome::failed(descriptor, &source);
                    ctx.log.error(&format!("{}: {source}", entry.label()));
                    record(ctx, &entry);
                    result.success = false;
                    result.per_resource.push(entry);
                    if descriptor.policy.required {
                        let partial = self.finish(result, RunState::Aborted);
                        return Err(ExecutionError::Aborted {
                            kind: descriptor.kind(),
                            locator: descriptor.locator.to_string(),
                            source,
                            partial: Box::new(partial),
                        });
                    }
                }
            }
        }

        if action == Action::Backup && !ctx.dry_run {
            let manifest = build_manifest(&template, &result, ctx);
            if let Err(e) = store.write_manifest(&manifest) {
                ctx.log.error(&format!("failed to write snapshot manifest: {e}"));
                result.success = false;
            }
        }

        let state = if result.success {
            RunState::Completed
        } else {
            RunState::CompletedWithErrors
        };
        Ok(self.finish(result, state))
    }

    fn run_one(
        &self,
        descriptor: &Descriptor,
        action: Action,
        store: &StateStore,
        ctx: &Context,
    ) -> Result<Outcome, ProviderError> {
        let kind = descriptor.kind();
        let provider = self
            .providers
            .get(kind)
            .ok_or_else(|| ctx.platform.unsupported(&format!("{kind} resources")))?;
        match action {
            Action::Backup => provider.capture(descriptor, store, ctx),
            Action::Restore => provider.apply(descriptor, store, ctx),
        }
    }

    fn finish(&mut self, mut result: ExecutionResult, state: RunState) -> ExecutionResult {
        self.state = state;
        result.state = state;
        result
    }
}

fn record(ctx: &Context, entry: &ResourceOutcome) {
    let label = entry.label();
    match (&entry.change, &entry.error) {
        (Some(change), _) => {
            let detail = match change {
                ResourceChange::Skipped { reason } => Some(reason.as_str()),
                _ => None,
            };
            if change.status() == ResourceStatus::DryRun {
                ctx.log.dry_run(&format!("{change}: {label}"));
            } else {
                ctx.log.debug(&format!("{change}: {label}"));
            }
            ctx.log.record(&label, change.status(), detail);
        }
        (None, error) => ctx.log.record(&label, ResourceStatus::Failed, error.as_deref()),
    }
}

fn build_manifest(template: &ResolvedTemplate, result: &ExecutionResult, ctx: &Context) -> Manifest {
    let records = template
        .iter()
        .zip(&result.per_resource)
        .filter(|(_, outcome)| {
            matches!(
                outcome.change,
                Some(ResourceChange::Captured | ResourceChange::CapturedAbsent)
            )
        })
        .map(|(descriptor, _)| {
            StateStore::record_file_name(descriptor.kind(), &descriptor.locator.record_key())
        })
        .collect();
    Manifest {
        template: template.name.clone(),
        version: template.version.clone(),
        ancestry: template.ancestry.clone(),
        machine: ctx.platform.machine_name.clone(),
        created_at: Utc::now(),
        records,
    }
}

fn check_manifest(template: &ResolvedTemplate, store: &StateStore, ctx: &Context) {
    match store.read_manifest() {
        Ok(Some(manifest)) => {
            if manifest.template != template.name {
                ctx.log.warn(&format!(
                    "snapshot in {} was captured from template '{}', not '{}'",
                    store.dir().display(),
                    manifest.template,
                    template.name
                ));
            }
            if manifest.machine != ctx.platform.machine_name {
                ctx.log.info(&format!(
                    "snapshot was captured on {} at {}",
                    manifest.machine,
                    manifest.created_at.format("%Y-%m-%d %H:%M UTC")
                ));
            }
        }
        Ok(None) => ctx
            .log
            .debug(&format!("no snapshot manifest in {}", store.dir().display())),
        Err(e) => ctx.log.warn(&format!("ignoring snapshot manifest: {e}")),
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::resources::registry::{MemoryRegistry, RegistryKey};
    use crate::resources::test_helpers::make_context;
    use crate::resources::{FieldValue, FileProvider, RegistryProvider};
    use crate::template::MemorySource;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn app_key() -> RegistryKey {
        RegistryKey::from_locator(
            &crate::locator::normalize(r"HKCU\Software\App", ResourceKind::Registry).unwrap(),
        )
    }

    fn template(files: &[&Path], required: bool) -> String {
        let mut doc = String::from(
            "[metadata]\nname = \"desk\"\nversion = \"2\"\n\n\
             [[resources.registry]]\nlocator = 'HKCU\\Software\\App'\n\
             fields = { Theme = \"string\" }\n",
        );
        for file in files {
            doc.push_str(&format!(
                "\n[[resources.file]]\nlocator = '{}'\npolicy = {{ required = {required} }}\n",
                file.display()
            ));
        }
        doc
    }

    fn executor(doc: &str, registry: MemoryRegistry) -> TemplateExecutor {
        TemplateExecutor::new(
            MemorySource::new().with_toml("desk", doc),
            Normalizer::default(),
            ProviderRegistry::new()
                .with(FileProvider)
                .with(RegistryProvider::with_backend(registry)),
        )
    }

    #[test]
    fn backup_then_restore_round_trips() {
        let sys = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let rc = sys.path().join("rc");
        fs::write(&rc, "alias ll='ls -l'\n").unwrap();
        let registry = MemoryRegistry::new().with_value(
            &app_key(),
            "Theme",
            FieldValue::String("dark".into()),
        );
        let mut exec = executor(&template(&[&rc], false), registry.clone());
        let (ctx, _log) = make_context(false);

        let backup = exec.invoke("desk", Action::Backup, state.path(), &ctx).unwrap();
        assert_eq!(backup.state, RunState::Completed);
        assert_eq!(backup.per_resource.len(), 2);
        assert_eq!(backup.per_resource[0].kind, ResourceKind::Registry);

        fs::write(&rc, "changed").unwrap();
        registry.insert(&app_key(), "Theme", FieldValue::String("light".into()));

        let restore = exec.invoke("desk", Action::Restore, state.path(), &ctx).unwrap();
        assert!(restore.success);
        assert_eq!(exec.state(), RunState::Completed);
        assert_eq!(fs::read_to_string(&rc).unwrap(), "alias ll='ls -l'\n");
        assert_eq!(
            registry.value(&app_key(), "Theme"),
            Some(FieldValue::String("dark".into()))
        );
    }

    #[test]
    fn backup_writes_manifest() {
        let state = tempfile::tempdir().unwrap();
        let mut exec = executor(&template(&[], false), MemoryRegistry::new());
        let (ctx, _log) = make_context(false);
        exec.invoke("desk", Action::Backup, state.path(), &ctx).unwrap();

        let manifest = StateStore::new(state.path()).read_manifest().unwrap().unwrap();
        assert_eq!(manifest.template, "desk");
        assert_eq!(manifest.machine, "test-host");
        assert_eq!(manifest.records.len(), 1);
        assert!(manifest.records[0].starts_with("registry-"));
    }

    #[test]
    fn load_failure_touches_nothing() {
        let state = tempfile::tempdir().unwrap();
        let mut exec = executor("[metadata]\nname = \"desk\"\nextends = \"gone\"\n", MemoryRegistry::new());
        let (ctx, log) = make_context(false);
        let err = exec
            .invoke("desk", Action::Backup, state.path(), &ctx)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::LoadFailed { .. }));
        assert_eq!(exec.state(), RunState::LoadFailed);
        assert!(log.entries().is_empty());
        assert_eq!(fs::read_dir(state.path()).unwrap().count(), 0);
    }

    #[test]
    fn optional_failure_is_recorded_and_run_continues() {
        let sys = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let dir_as_file = sys.path().join("sub");
        fs::create_dir(&dir_as_file).unwrap();
        let ok = sys.path().join("ok");
        fs::write(&ok, "x").unwrap();

        let mut exec = executor(&template(&[&dir_as_file, &ok], false), MemoryRegistry::new());
        let (ctx, log) = make_context(false);
        let result = exec.invoke("desk", Action::Backup, state.path(), &ctx).unwrap();

        assert_eq!(result.state, RunState::CompletedWithErrors);
        assert!(!result.success);
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.per_resource.len(), 3);
        assert!(result.per_resource[2].ok);
        assert_eq!(log.failure_count(), 1);
    }

    #[test]
    fn required_failure_aborts_with_partial_results() {
        let sys = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let missing = sys.path().join("missing");
        let later = sys.path().join("later");
        fs::write(&later, "x").unwrap();

        let mut exec = executor(&template(&[&missing, &later], true), MemoryRegistry::new());
        let (ctx, _log) = make_context(false);
        match exec.invoke("desk", Action::Backup, state.path(), &ctx) {
            Err(ExecutionError::Aborted {
                kind,
                source,
                partial,
                ..
            }) => {
                assert_eq!(kind, ResourceKind::File);
                assert!(matches!(source, ProviderError::ResourceMissing { .. }));
                assert_eq!(partial.state, RunState::Aborted);
                assert_eq!(partial.per_resource.len(), 2);
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(exec.state(), RunState::Aborted);
        assert!(
            StateStore::new(state.path()).read_manifest().unwrap().is_none(),
            "aborted backup must not write a manifest"
        );
    }

    #[test]
    fn cancellation_stops_between_descriptors() {
        let state = tempfile::tempdir().unwrap();
        let mut exec = executor(&template(&[], false), MemoryRegistry::new());
        let (ctx, _log) = make_context(false);
        let ctx = ctx.with_cancel(Arc::new(AtomicBool::new(true)));
        let result = exec.invoke("desk", Action::Backup, state.path(), &ctx).unwrap();
        assert_eq!(result.state, RunState::Cancelled);
        assert!(result.per_resource.is_empty());
    }

    #[test]
    fn dry_run_backup_writes_nothing() {
        let state = tempfile::tempdir().unwrap();
        let mut exec = executor(&template(&[], false), MemoryRegistry::new());
        let (ctx, _log) = make_context(true);
        let result = exec.invoke("desk", Action::Backup, state.path(), &ctx).unwrap();
        assert_eq!(
            result.per_resource[0].change,
            Some(ResourceChange::WouldCapture)
        );
        assert_eq!(fs::read_dir(state.path()).unwrap().count(), 0);
    }

    #[test]
    fn restore_without_records_skips_optional_resources() {
        let state = tempfile::tempdir().unwrap();
        let mut exec = executor(&template(&[], false), MemoryRegistry::new());
        let (ctx, _log) = make_context(false);
        let result = exec.invoke("desk", Action::Restore, state.path(), &ctx).unwrap();
        assert!(result.success);
        assert!(matches!(
            result.per_resource[0].change,
            Some(ResourceChange::Skipped { .. })
        ));
    }

    #[test]
    fn missing_provider_is_a_per_resource_failure() {
        let state = tempfile::tempdir().unwrap();
        let mut exec = TemplateExecutor::new(
            MemorySource::new().with_toml("desk", &template(&[], false)),
            Normalizer::default(),
            ProviderRegistry::new(),
        );
        let (ctx, _log) = make_context(false);
        let result = exec.invoke("desk", Action::Backup, state.path(), &ctx).unwrap();
        assert_eq!(result.failure_count(), 1);
        assert!(
            result.per_resource[0]
                .error
                .as_deref()
                .unwrap()
                .contains("not supported")
        );
    }

    #[test]
    fn run_state_display() {
        assert_eq!(RunState::CompletedWithErrors.to_string(), "completed with errors");
        assert_eq!(Action::Restore.to_string(), "restore");
    }
}
