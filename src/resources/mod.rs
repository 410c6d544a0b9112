//! Resource state providers: read and write live state, capture and apply
//! records.
pub mod application;
pub mod error;
pub mod file;
pub mod fs;
pub mod record;
pub mod registry;
pub mod scheduled_task;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

pub use application::ApplicationProvider;
pub use error::ProviderError;
pub use file::FileProvider;
pub use record::{
    AttributeSnapshot, FieldValue, LiveState, NativeType, StateRecord, StoredField,
};
pub use registry::RegistryProvider;
pub use scheduled_task::ScheduledTaskProvider;
pub use store::{Manifest, StateStore};

use crate::engine::Context;
use crate::locator::ResourceKind;
use crate::logging::ResourceStatus;
use crate::template::Descriptor;

/// Result of capturing or applying one resource.
///
/// # Examples
///
/// ```
/// use snapstate::resources::ResourceChange;
///
/// let applied = ResourceChange::Applied;
/// let skipped = ResourceChange::Skipped { reason: "no captured state".into() };
///
/// assert_ne!(applied, skipped);
/// assert_eq!(applied.to_string(), "applied");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceChange {
    /// Live values were written to a record.
    Captured,
    /// The resource did not exist; an absent record was written.
    CapturedAbsent,
    /// Dry run: a record would have been written.
    WouldCapture,
    /// Recorded values were written to the system.
    Applied,
    /// The system already matched the record.
    AlreadyCorrect,
    /// Dry run: the system differs from the record.
    WouldApply,
    /// Nothing was done.
    Skipped {
        /// Why the resource was skipped.
        reason: String,
    },
}

impl ResourceChange {
    /// Summary status for the run log.
    #[must_use]
    pub const fn status(&self) -> ResourceStatus {
        match self {
            Self::Captured | Self::CapturedAbsent | Self::Applied => ResourceStatus::Ok,
            Self::AlreadyCorrect => ResourceStatus::Unchanged,
            Self::WouldCapture | Self::WouldApply => ResourceStatus::DryRun,
            Self::Skipped { .. } => ResourceStatus::Skipped,
        }
    }
}

impl fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Captured => f.write_str("captured"),
            Self::CapturedAbsent => f.write_str("captured (absent)"),
            Self::WouldCapture => f.write_str("would capture"),
            Self::Applied => f.write_str("applied"),
            Self::AlreadyCorrect => f.write_str("already correct"),
            Self::WouldApply => f.write_str("would apply"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// A change plus whether it needs a reboot to take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// What happened.
    pub change: ResourceChange,
    /// Whether the change needs a reboot.
    pub requires_reboot: bool,
}

impl From<ResourceChange> for Outcome {
    fn from(change: ResourceChange) -> Self {
        Self {
            change,
            requires_reboot: false,
        }
    }
}

/// Reads and writes the live state of one resource kind.
///
/// Implementors supply [`read_live`](Self::read_live) and
/// [`write_live`](Self::write_live); capture and apply are shared.
pub trait Provider: Send + Sync + fmt::Debug {
    /// Kind handled by this provider.
    fn kind(&self) -> ResourceKind;

    /// Read the declared fields of the live resource.
    ///
    /// Returns `None` when the resource does not exist. Fields the resource
    /// lacks are left out of the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource exists but cannot be read.
    fn read_live(
        &self,
        descriptor: &Descriptor,
        ctx: &Context,
    ) -> Result<Option<LiveState>, ProviderError>;

    /// Write `desired` to the system, all or nothing.
    ///
    /// The returned flag is the requires-reboot signal: `true` means the
    /// written change only takes effect after a reboot, and it ends up in
    /// [`Outcome::requires_reboot`]. It says nothing about whether anything
    /// was written.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::ApplyFailed`] if the write fails; any partial
    /// change has been undone.
    fn write_live(
        &self,
        descriptor: &Descriptor,
        desired: &LiveState,
        current: Option<&LiveState>,
        ctx: &Context,
    ) -> Result<bool, ProviderError>;

    /// Whether `current` already holds everything in `desired`.
    fn is_satisfied(
        &self,
        _descriptor: &Descriptor,
        desired: &LiveState,
        current: Option<&LiveState>,
    ) -> bool {
        let Some(current) = current else {
            return false;
        };
        desired
            .fields
            .iter()
            .all(|(name, value)| current.fields.get(name) == Some(value))
            && desired
                .attributes
                .as_ref()
                .is_none_or(|want| want.satisfied_by(current.attributes.as_ref()))
    }

    /// Capture the live resource into `store`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::ResourceMissing`] for a missing required
    /// resource, or any read, type, encryption or store error.
    fn capture(
        &self,
        descriptor: &Descriptor,
        store: &StateStore,
        ctx: &Context,
    ) -> Result<Outcome, ProviderError> {
        capture_resource(self, descriptor, store, ctx)
    }

    /// Apply the recorded state from `store` to the system.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::RecordNotFound`] for a required resource with
    /// no record, [`ProviderError::Decryption`] listing every field that
    /// could not be opened, or any read or write error.
    fn apply(
        &self,
        descriptor: &Descriptor,
        store: &StateStore,
        ctx: &Context,
    ) -> Result<Outcome, ProviderError> {
        apply_resource(self, descriptor, store, ctx)
    }
}

fn capture_resource<P: Provider + ?Sized>(
    provider: &P,
    descriptor: &Descriptor,
    store: &StateStore,
    ctx: &Context,
) -> Result<Outcome, ProviderError> {
    let kind = descriptor.kind();
    let locator = descriptor.locator.to_string();

    let Some(live) = provider.read_live(descriptor, ctx)? else {
        if descriptor.policy.required {
            return Err(ProviderError::ResourceMissing { kind, locator });
        }
        ctx.log.debug(&format!("{kind} {locator} does not exist"));
        let record = StateRecord::new(descriptor, false);
        return persist(store, &record, ctx, ResourceChange::CapturedAbsent);
    };

    let mut record = StateRecord::new(descriptor, true);
    for (name, decl) in &descriptor.fields {
        let Some(value) = live.fields.get(name) else {
            record.missing_fields.push(name.clone());
            continue;
        };
        let value = value
            .clone()
            .coerce(decl.ty)
            .map_err(|found| ProviderError::FieldType {
                locator: locator.clone(),
                field: name.clone(),
                expected: decl.ty,
                found: found.field_type(),
            })?;
        let sealed = descriptor.encrypts(name);
        let stored = if sealed {
            StoredField::seal(&value, &ctx.crypto)?
        } else {
            StoredField::Plain(value)
        };
        record.fields.insert(name.clone(), stored);
        record.field_is_encrypted.insert(name.clone(), sealed);
    }
    record.attributes = live
        .attributes
        .as_ref()
        .and_then(|a| a.filtered(&descriptor.policy));

    if !record.missing_fields.is_empty() {
        ctx.log.debug(&format!(
            "{kind} {locator}: not present: {}",
            record.missing_fields.join(", ")
        ));
    }
    persist(store, &record, ctx, ResourceChange::Captured)
}

fn persist(
    store: &StateStore,
    record: &StateRecord,
    ctx: &Context,
    change: ResourceChange,
) -> Result<Outcome, ProviderError> {
    if ctx.dry_run {
        ctx.log.dry_run(&format!(
            "would capture {} {} ({} field(s))",
            record.kind,
            record.locator,
            record.fields.len()
        ));
        return Ok(ResourceChange::WouldCapture.into());
    }
    let path = store.write(record)?;
    ctx.log.debug(&format!("wrote {}", path.display()));
    Ok(change.into())
}

fn apply_resource<P: Provider + ?Sized>(
    provider: &P,
    descriptor: &Descriptor,
    store: &StateStore,
    ctx: &Context,
) -> Result<Outcome, ProviderError> {
    let kind = descriptor.kind();
    let locator = descriptor.locator.to_string();

    let Some(record) = store.read(kind, &descriptor.locator.record_key())? else {
        if descriptor.policy.required {
            return Err(ProviderError::RecordNotFound { kind, locator });
        }
        return Ok(ResourceChange::Skipped {
            reason: "no captured state".to_string(),
        }
        .into());
    };
    if !record.present {
        return Ok(ResourceChange::Skipped {
            reason: "resource was absent at capture".to_string(),
        }
        .into());
    }

    let desired = open_record(descriptor, &record, ctx)?;
    let current = provider.read_live(descriptor, ctx)?;
    if provider.is_satisfied(descriptor, &desired, current.as_ref()) {
        return Ok(ResourceChange::AlreadyCorrect.into());
    }
    if ctx.dry_run {
        ctx.log
            .dry_run(&format!("would apply {kind} {locator} from {}", record.captured_at));
        return Ok(ResourceChange::WouldApply.into());
    }
    let requires_reboot = provider.write_live(descriptor, &desired, current.as_ref(), ctx)?;
    Ok(Outcome {
        change: ResourceChange::Applied,
        requires_reboot,
    })
}

/// Recover the declared fields of `record` as plain values.
fn open_record(
    descriptor: &Descriptor,
    record: &StateRecord,
    ctx: &Context,
) -> Result<LiveState, ProviderError> {
    let locator = descriptor.locator.to_string();
    let mut fields = BTreeMap::new();
    let mut failures = Vec::new();
    for (name, decl) in &descriptor.fields {
        let Some(stored) = record.fields.get(name) else {
            continue;
        };
        match stored.open(record.is_encrypted(name), &ctx.crypto) {
            Ok(value) => {
                let value = value
                    .coerce(decl.ty)
                    .map_err(|found| ProviderError::FieldType {
                        locator: locator.clone(),
                        field: name.clone(),
                        expected: decl.ty,
                        found: found.field_type(),
                    })?;
                fields.insert(name.clone(), value);
            }
            Err(e) => failures.push((name.clone(), e)),
        }
    }
    if !failures.is_empty() {
        return Err(ProviderError::Decryption { locator, failures });
    }
    Ok(LiveState {
        fields,
        attributes: record
            .attributes
            .as_ref()
            .and_then(|a| a.filtered(&descriptor.policy)),
    })
}

/// Static mapping from kind to provider.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ResourceKind, Box<dyn Provider>>,
}

impl ProviderRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in providers for this host.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with(FileProvider)
            .with(RegistryProvider::native())
            .with(ApplicationProvider)
            .with(ScheduledTaskProvider)
    }

    /// Register `provider`, replacing any provider for the same kind.
    #[must_use]
    pub fn with(mut self, provider: impl Provider + 'static) -> Self {
        self.providers.insert(provider.kind(), Box::new(provider));
        self
    }

    /// Provider for `kind`, if registered.
    #[must_use]
    pub fn get(&self, kind: ResourceKind) -> Option<&dyn Provider> {
        self.providers.get(&kind).map(Box::as_ref)
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
    use super::test_helpers::{descriptor, make_context};
    use super::*;
    use crate::crypto::{EncryptionContext, StaticKey};
    use crate::template::FieldType;
    use std::sync::{Arc, Mutex};

    /// In-memory provider whose live state is a shared map.
    #[derive(Debug, Default)]
    struct MapProvider {
        live: Mutex<Option<BTreeMap<String, FieldValue>>>,
        writes: Mutex<usize>,
    }

    impl MapProvider {
        fn with_live(fields: &[(&str, FieldValue)]) -> Self {
            Self {
                live: Mutex::new(Some(
                    fields
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), v.clone()))
                        .collect(),
                )),
                writes: Mutex::new(0),
            }
        }

        fn set(&self, name: &str, value: FieldValue) {
            if let Some(map) = self.live.lock().unwrap().as_mut() {
                map.insert(name.to_string(), value);
            }
        }

        fn get(&self, name: &str) -> Option<FieldValue> {
            self.live
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|m| m.get(name).cloned())
        }
    }

    impl Provider for MapProvider {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Registry
        }

        fn read_live(
            &self,
            descriptor: &Descriptor,
            _ctx: &Context,
        ) -> Result<Option<LiveState>, ProviderError> {
            Ok(self.live.lock().unwrap().as_ref().map(|map| {
                LiveState::from_fields(
                    map.iter()
                        .filter(|(k, _)| descriptor.fields.contains_key(*k))
                        .map(|(k, v)| (k.clone(), v.clone())),
                )
            }))
        }

        fn write_live(
            &self,
            _descriptor: &Descriptor,
            desired: &LiveState,
            _current: Option<&LiveState>,
            _ctx: &Context,
        ) -> Result<bool, ProviderError> {
            let mut guard = self.live.lock().unwrap();
            let map = guard.get_or_insert_with(BTreeMap::new);
            for (k, v) in &desired.fields {
                map.insert(k.clone(), v.clone());
            }
            *self.writes.lock().unwrap() += 1;
            Ok(false)
        }
    }

    fn app_key() -> Descriptor {
        descriptor(
            ResourceKind::Registry,
            r"HKCU\Software\App",
            &[("Theme", FieldType::String), ("Size", FieldType::Integer)],
        )
    }

    // -----------------------------------------------------------------------
    // capture
    // -----------------------------------------------------------------------

    #[test]
    fn capture_then_apply_restores_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let provider = MapProvider::with_live(&[
            ("Theme", FieldValue::String("dark".into())),
            ("Size", FieldValue::Integer(12)),
        ]);
        let desc = app_key();

        let captured = provider.capture(&desc, &store, &ctx).unwrap();
        assert_eq!(captured.change, ResourceChange::Captured);

        provider.set("Theme", FieldValue::String("light".into()));
        let applied = provider.apply(&desc, &store, &ctx).unwrap();
        assert_eq!(applied.change, ResourceChange::Applied);
        assert_eq!(provider.get("Theme"), Some(FieldValue::String("dark".into())));

        let again = provider.apply(&desc, &store, &ctx).unwrap();
        assert_eq!(again.change, ResourceChange::AlreadyCorrect);
    }

    #[test]
    fn capture_records_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let provider = MapProvider::with_live(&[("Theme", FieldValue::String("dark".into()))]);
        let desc = app_key();
        provider.capture(&desc, &store, &ctx).unwrap();
        let record = store
            .read(desc.kind(), &desc.locator.record_key())
            .unwrap()
            .unwrap();
        assert_eq!(record.missing_fields, vec!["Size".to_string()]);
        assert!(record.present);
    }

    #[test]
    fn capture_missing_optional_resource_writes_absent_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let provider = MapProvider::default();
        let desc = app_key();
        let outcome = provider.capture(&desc, &store, &ctx).unwrap();
        assert_eq!(outcome.change, ResourceChange::CapturedAbsent);
        let record = store
            .read(desc.kind(), &desc.locator.record_key())
            .unwrap()
            .unwrap();
        assert!(!record.present);

        let applied = provider.apply(&desc, &store, &ctx).unwrap();
        assert!(matches!(applied.change, ResourceChange::Skipped { .. }));
    }

    #[test]
    fn capture_missing_required_resource_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let mut desc = app_key();
        desc.policy.required = true;
        let err = MapProvider::default()
            .capture(&desc, &store, &ctx)
            .unwrap_err();
        assert!(matches!(err, ProviderError::ResourceMissing { .. }));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn capture_rejects_wrong_live_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let provider = MapProvider::with_live(&[("Size", FieldValue::Boolean(true))]);
        let err = provider.capture(&app_key(), &store, &ctx).unwrap_err();
        assert!(matches!(
            err,
            ProviderError::FieldType {
                expected: FieldType::Integer,
                found: FieldType::Boolean,
                ..
            }
        ));
    }

    #[test]
    fn dry_run_capture_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(true);
        let provider = MapProvider::with_live(&[("Theme", FieldValue::String("dark".into()))]);
        let outcome = provider.capture(&app_key(), &store, &ctx).unwrap();
        assert_eq!(outcome.change, ResourceChange::WouldCapture);
        assert!(store.list().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // encryption
    // -----------------------------------------------------------------------

    #[test]
    fn encrypted_fields_are_sealed_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let provider = MapProvider::with_live(&[
            ("Theme", FieldValue::String("dark".into())),
            ("Size", FieldValue::Integer(12)),
        ]);
        let mut desc = app_key();
        desc.fields.get_mut("Theme").unwrap().encrypt = true;
        provider.capture(&desc, &store, &ctx).unwrap();

        let record = store
            .read(desc.kind(), &desc.locator.record_key())
            .unwrap()
            .unwrap();
        assert!(record.is_encrypted("Theme"));
        assert!(!record.is_encrypted("Size"));
        assert!(matches!(record.fields["Theme"], StoredField::Sealed(_)));
        let on_disk = std::fs::read_to_string(
            store.record_path(desc.kind(), &desc.locator.record_key()),
        )
        .unwrap();
        assert!(!on_disk.contains("dark"));
    }

    #[test]
    fn foreign_key_fails_only_with_decryption_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let provider = MapProvider::with_live(&[
            ("Theme", FieldValue::String("dark".into())),
            ("Size", FieldValue::Integer(12)),
        ]);
        let mut desc = app_key();
        desc.policy.encrypt = true;
        provider.capture(&desc, &store, &ctx).unwrap();

        let mut other = ctx;
        other.crypto = Arc::new(EncryptionContext::new(StaticKey::new([9; 32])));
        provider.set("Theme", FieldValue::String("light".into()));
        let err = provider.apply(&desc, &store, &other).unwrap_err();
        let ProviderError::Decryption { failures, .. } = err else {
            panic!("expected decryption error, got {err:?}");
        };
        assert_eq!(failures.len(), 2);
        assert_eq!(*provider.writes.lock().unwrap(), 0);
    }

    // -----------------------------------------------------------------------
    // apply
    // -----------------------------------------------------------------------

    #[test]
    fn apply_without_record_skips_optional() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let outcome = MapProvider::default()
            .apply(&app_key(), &store, &ctx)
            .unwrap();
        assert_eq!(
            outcome.change,
            ResourceChange::Skipped {
                reason: "no captured state".into()
            }
        );
    }

    #[test]
    fn apply_without_record_fails_required() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let mut desc = app_key();
        desc.policy.required = true;
        let err = MapProvider::default()
            .apply(&desc, &store, &ctx)
            .unwrap_err();
        assert!(matches!(err, ProviderError::RecordNotFound { .. }));
    }

    #[test]
    fn dry_run_apply_reports_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let provider = MapProvider::with_live(&[("Theme", FieldValue::String("dark".into()))]);
        let (ctx, _log) = make_context(false);
        provider.capture(&app_key(), &store, &ctx).unwrap();
        provider.set("Theme", FieldValue::String("light".into()));

        let (dry, _log) = make_context(true);
        let outcome = provider.apply(&app_key(), &store, &dry).unwrap();
        assert_eq!(outcome.change, ResourceChange::WouldApply);
        assert_eq!(provider.get("Theme"), Some(FieldValue::String("light".into())));
    }

    #[test]
    fn apply_never_modifies_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let provider = MapProvider::with_live(&[("Theme", FieldValue::String("dark".into()))]);
        let desc = app_key();
        provider.capture(&desc, &store, &ctx).unwrap();
        let path = store.record_path(desc.kind(), &desc.locator.record_key());
        let before = std::fs::read(&path).unwrap();
        provider.set("Theme", FieldValue::String("light".into()));
        provider.apply(&desc, &store, &ctx).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    // -----------------------------------------------------------------------
    // registry of providers
    // -----------------------------------------------------------------------

    #[test]
    fn standard_registry_covers_every_kind() {
        let registry = ProviderRegistry::standard();
        for kind in ResourceKind::ALL {
            let provider = registry.get(kind).expect("provider registered");
            assert_eq!(provider.kind(), kind);
        }
    }

    #[test]
    fn with_replaces_provider_of_same_kind() {
        let registry = ProviderRegistry::new().with(MapProvider::default());
        assert!(registry.get(ResourceKind::Registry).is_some());
        assert!(registry.get(ResourceKind::File).is_none());
    }

    #[test]
    fn change_status_mapping() {
        assert_eq!(ResourceChange::Applied.status(), ResourceStatus::Ok);
        assert_eq!(
            ResourceChange::AlreadyCorrect.status(),
            ResourceStatus::Unchanged
        );
        assert_eq!(ResourceChange::WouldApply.status(), ResourceStatus::DryRun);
    }
}
