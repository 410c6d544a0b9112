//! Registry provider: named values under one key.
//!
//! Access goes through [`RegistryBackend`]: the native Windows backend uses
//! the `winreg` crate, and [`MemoryRegistry`] serves tests and non-Windows
//! hosts that only inspect snapshots.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use super::error::ProviderError;
use super::record::{AttributeSnapshot, FieldValue, LiveState, NativeType};
use super::Provider;
use crate::engine::Context;
use crate::locator::{Locator, ResourceKind};
use crate::template::{Descriptor, FieldType};

/// Key paths under `HKLM` whose values only take effect after a reboot.
const REBOOT_PREFIXES: &[&[&str]] = &[
    &["system", "currentcontrolset", "control"],
    &["system", "currentcontrolset", "services"],
];

/// Field names that address a key's default value.
const DEFAULT_VALUE_NAMES: &[&str] = &["(default)", "@"];

/// A registry key split into hive and sub-key path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryKey {
    /// Short hive name (`HKLM`, `HKCU`, ...).
    pub hive: String,
    /// Backslash-separated sub-key path.
    pub path: String,
}

impl RegistryKey {
    /// Split a registry locator.
    #[must_use]
    pub fn from_locator(locator: &Locator) -> Self {
        Self {
            hive: locator.root().to_ascii_uppercase(),
            path: locator
                .segments()
                .get(1..)
                .unwrap_or_default()
                .join("\\"),
        }
    }

    /// Whether changed values under this key need a reboot.
    #[must_use]
    pub fn signals_reboot(&self) -> bool {
        if self.hive != "HKLM" {
            return false;
        }
        let segments: Vec<String> = self
            .path
            .split('\\')
            .map(str::to_ascii_lowercase)
            .collect();
        REBOOT_PREFIXES.iter().any(|prefix| {
            segments.len() >= prefix.len()
                && prefix.iter().zip(&segments).all(|(want, have)| *want == have)
        })
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.hive)
        } else {
            write!(f, "{}\\{}", self.hive, self.path)
        }
    }
}

/// Value name as the registry API expects it.
fn value_name(field: &str) -> &str {
    if DEFAULT_VALUE_NAMES
        .iter()
        .any(|d| d.eq_ignore_ascii_case(field))
    {
        ""
    } else {
        field
    }
}

/// One registry value with its native type when that is not the default for
/// its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryValue {
    /// Value data.
    pub data: FieldValue,
    /// `REG_EXPAND_SZ` or `REG_QWORD`; `None` for the plain type.
    pub native: Option<NativeType>,
}

impl RegistryValue {
    /// Value stored with an explicit native type.
    #[must_use]
    pub const fn typed(data: FieldValue, native: NativeType) -> Self {
        Self {
            data,
            native: Some(native),
        }
    }
}

impl From<FieldValue> for RegistryValue {
    fn from(data: FieldValue) -> Self {
        Self { data, native: None }
    }
}

/// Raw registry access.
#[cfg_attr(test, mockall::automock)]
pub trait RegistryBackend: Send + Sync {
    /// Whether `key` exists.
    ///
    /// # Errors
    ///
    /// Returns a message if the key cannot be queried.
    fn key_exists(&self, key: &RegistryKey) -> Result<bool, String>;

    /// Read one value; `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a message if the value cannot be read.
    fn get_value(&self, key: &RegistryKey, name: &str) -> Result<Option<RegistryValue>, String>;

    /// Write one value with its native type, creating the key if needed.
    ///
    /// # Errors
    ///
    /// Returns a message if the value cannot be written.
    fn set_value(&self, key: &RegistryKey, name: &str, value: &RegistryValue)
    -> Result<(), String>;

    /// Delete one value; deleting a missing value succeeds.
    ///
    /// # Errors
    ///
    /// Returns a message if the value cannot be deleted.
    fn delete_value(&self, key: &RegistryKey, name: &str) -> Result<(), String>;
}

/// In-memory registry. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    keys: Arc<Mutex<BTreeMap<String, BTreeMap<String, RegistryValue>>>>,
}

impl MemoryRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` under `key`, creating the key (for seeding).
    #[must_use]
    pub fn with_value(self, key: &RegistryKey, name: &str, value: impl Into<RegistryValue>) -> Self {
        self.insert(key, name, value);
        self
    }

    /// Create `key` with no values.
    #[must_use]
    pub fn with_key(self, key: &RegistryKey) -> Self {
        self.lock().entry(Self::slot(key)).or_default();
        self
    }

    /// Current data of `name` under `key`.
    #[must_use]
    pub fn value(&self, key: &RegistryKey, name: &str) -> Option<FieldValue> {
        self.entry(key, name).map(|v| v.data)
    }

    /// Native type of `name` under `key`, if it is not the plain one.
    #[must_use]
    pub fn native_type(&self, key: &RegistryKey, name: &str) -> Option<NativeType> {
        self.entry(key, name).and_then(|v| v.native)
    }

    /// Set `name` under `key`, creating the key.
    pub fn insert(&self, key: &RegistryKey, name: &str, value: impl Into<RegistryValue>) {
        self.lock()
            .entry(Self::slot(key))
            .or_default()
            .insert(value_name(name).to_ascii_lowercase(), value.into());
    }

    fn entry(&self, key: &RegistryKey, name: &str) -> Option<RegistryValue> {
        self.lock()
            .get(&Self::slot(key))
            .and_then(|values| values.get(&value_name(name).to_ascii_lowercase()))
            .cloned()
    }

    fn slot(key: &RegistryKey) -> String {
        key.to_string().to_ascii_lowercase()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, RegistryValue>>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegistryBackend for MemoryRegistry {
    fn key_exists(&self, key: &RegistryKey) -> Result<bool, String> {
        Ok(self.lock().contains_key(&Self::slot(key)))
    }

    fn get_value(&self, key: &RegistryKey, name: &str) -> Result<Option<RegistryValue>, String> {
        Ok(self.entry(key, name))
    }

    fn set_value(
        &self,
        key: &RegistryKey,
        name: &str,
        value: &RegistryValue,
    ) -> Result<(), String> {
        self.insert(key, name, value.clone());
        Ok(())
    }

    fn delete_value(&self, key: &RegistryKey, name: &str) -> Result<(), String> {
        if let Some(values) = self.lock().get_mut(&Self::slot(key)) {
            values.remove(&value_name(name).to_ascii_lowercase());
        }
        Ok(())
    }
}

/// Native registry through `winreg`.
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsRegistry;

#[cfg(windows)]
impl WindowsRegistry {
    fn hive(key: &RegistryKey) -> Result<winreg::RegKey, String> {
        use winreg::RegKey;
        use winreg::enums::{
            HKEY_CLASSES_ROOT, HKEY_CURRENT_CONFIG, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE,
            HKEY_USERS,
        };
        let predef = match key.hive.as_str() {
            "HKLM" => HKEY_LOCAL_MACHINE,
            "HKCU" => HKEY_CURRENT_USER,
            "HKCR" => HKEY_CLASSES_ROOT,
            "HKU" => HKEY_USERS,
            "HKCC" => HKEY_CURRENT_CONFIG,
            other => return Err(format!("unknown hive {other}")),
        };
        Ok(RegKey::predef(predef))
    }

    fn open(key: &RegistryKey, flags: u32) -> std::io::Result<winreg::RegKey> {
        let hive = Self::hive(key).map_err(std::io::Error::other)?;
        hive.open_subkey_with_flags(&key.path, flags)
    }
}

#[cfg(windows)]
impl RegistryBackend for WindowsRegistry {
    fn key_exists(&self, key: &RegistryKey) -> Result<bool, String> {
        use winreg::enums::KEY_READ;
        match Self::open(key, KEY_READ) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.to_string()),
        }
    }

    fn get_value(&self, key: &RegistryKey, name: &str) -> Result<Option<RegistryValue>, String> {
        use winreg::enums::KEY_READ;
        use winreg::enums::RegType::{REG_DWORD, REG_EXPAND_SZ, REG_MULTI_SZ, REG_QWORD, REG_SZ};
        let name = value_name(name);
        let handle = match Self::open(key, KEY_READ) {
            Ok(handle) => handle,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };
        let raw = match handle.get_raw_value(name) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };
        let value = match raw.vtype {
            REG_SZ => handle
                .get_value::<String, _>(name)
                .map(|s| FieldValue::String(s).into()),
            REG_EXPAND_SZ => handle
                .get_value::<String, _>(name)
                .map(|s| RegistryValue::typed(FieldValue::String(s), NativeType::ExpandString)),
            REG_DWORD => handle
                .get_value::<u32, _>(name)
                .map(|n| FieldValue::Integer(i64::from(n)).into()),
            REG_QWORD => handle
                .get_value::<u64, _>(name)
                .map(|n| RegistryValue::typed(FieldValue::Integer(n.cast_signed()), NativeType::Qword)),
            REG_MULTI_SZ => handle
                .get_value::<Vec<String>, _>(name)
                .map(|items| FieldValue::List(items).into()),
            _ => Ok(FieldValue::Binary(raw.bytes.to_vec()).into()),
        };
        value.map(Some).map_err(|e| e.to_string())
    }

    fn set_value(
        &self,
        key: &RegistryKey,
        name: &str,
        value: &RegistryValue,
    ) -> Result<(), String> {
        use winreg::RegValue;
        use winreg::enums::RegType::{REG_BINARY, REG_EXPAND_SZ};
        use winreg::types::ToRegValue as _;
        let hive = Self::hive(key)?;
        let (handle, _) = hive.create_subkey(&key.path).map_err(|e| e.to_string())?;
        let name = value_name(name);
        let result = match (&value.data, value.native) {
            (FieldValue::String(s), Some(NativeType::ExpandString)) => {
                let mut raw = s.to_reg_value();
                raw.vtype = REG_EXPAND_SZ;
                handle.set_raw_value(name, &raw)
            }
            (FieldValue::String(s), _) => handle.set_value(name, s),
            (FieldValue::Integer(n), Some(NativeType::Qword)) => {
                handle.set_value(name, &n.cast_unsigned())
            }
            (FieldValue::Integer(n), _) => match u32::try_from(*n) {
                Ok(dword) => handle.set_value(name, &dword),
                Err(_) => handle.set_value(name, &n.cast_unsigned()),
            },
            (FieldValue::Boolean(b), _) => handle.set_value(name, &u32::from(*b)),
            (FieldValue::List(items), _) => handle.set_value(name, items),
            (FieldValue::Binary(bytes), _) => handle.set_raw_value(
                name,
                &RegValue {
                    bytes: bytes.clone().into(),
                    vtype: REG_BINARY,
                },
            ),
        };
        result.map_err(|e| e.to_string())
    }

    fn delete_value(&self, key: &RegistryKey, name: &str) -> Result<(), String> {
        use winreg::enums::KEY_SET_VALUE;
        let handle = match Self::open(key, KEY_SET_VALUE) {
            Ok(handle) => handle,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.to_string()),
        };
        match handle.delete_value(value_name(name)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.to_string()),
            _ => Ok(()),
        }
    }
}

/// Captures and restores registry values.
pub struct RegistryProvider {
    backend: Option<Box<dyn RegistryBackend>>,
}

impl fmt::Debug for RegistryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryProvider")
            .field("backend", &self.backend.as_ref().map(|_| "<dyn RegistryBackend>"))
            .finish()
    }
}

impl RegistryProvider {
    /// Provider over the host registry; without one, every access reports
    /// an unsupported platform.
    #[must_use]
    pub fn native() -> Self {
        #[cfg(windows)]
        {
            Self::with_backend(WindowsRegistry)
        }
        #[cfg(not(windows))]
        {
            Self { backend: None }
        }
    }

    /// Provider over an explicit backend.
    #[must_use]
    pub fn with_backend(backend: impl RegistryBackend + 'static) -> Self {
        Self {
            backend: Some(Box::new(backend)),
        }
    }

    fn backend(&self, ctx: &Context) -> Result<&dyn RegistryBackend, ProviderError> {
        self.backend
            .as_deref()
            .ok_or_else(|| ctx.platform.unsupported("registry access").into())
    }
}

/// Registry types are looser than field types: DWORD 0/1 reads as boolean.
fn adapt(value: FieldValue, ty: FieldType) -> FieldValue {
    match (value, ty) {
        (FieldValue::Integer(n @ (0 | 1)), FieldType::Boolean) => FieldValue::Boolean(n == 1),
        (v, _) => v,
    }
}

impl Provider for RegistryProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Registry
    }

    fn read_live(
        &self,
        descriptor: &Descriptor,
        ctx: &Context,
    ) -> Result<Option<LiveState>, ProviderError> {
        let backend = self.backend(ctx)?;
        let key = RegistryKey::from_locator(&descriptor.locator);
        let fail = |e: String| ProviderError::read_failed(&key, e);
        if !backend.key_exists(&key).map_err(fail)? {
            return Ok(None);
        }
        let mut live = LiveState::default();
        let mut types = BTreeMap::new();
        for (name, decl) in &descriptor.fields {
            if let Some(value) = backend.get_value(&key, name).map_err(fail)? {
                if let Some(native) = value.native {
                    types.insert(name.clone(), native);
                }
                live.fields.insert(name.clone(), adapt(value.data, decl.ty));
            }
        }
        if !types.is_empty() {
            live.attributes = Some(AttributeSnapshot {
                value_types: types,
                ..AttributeSnapshot::default()
            });
        }
        Ok(Some(live))
    }

    fn write_live(
        &self,
        descriptor: &Descriptor,
        desired: &LiveState,
        current: Option<&LiveState>,
        ctx: &Context,
    ) -> Result<bool, ProviderError> {
        let backend = self.backend(ctx)?;
        let key = RegistryKey::from_locator(&descriptor.locator);
        let mut written: Vec<(&str, Option<RegistryValue>)> = Vec::new();

        for (name, data) in &desired.fields {
            let native = native_type(Some(desired), name);
            if current.and_then(|c| c.fields.get(name)) == Some(data)
                && native_type(current, name) == native
            {
                continue;
            }
            let value = RegistryValue {
                data: data.clone(),
                native,
            };
            let step = backend
                .get_value(&key, name)
                .and_then(|previous| backend.set_value(&key, name, &value).map(|()| previous));
            match step {
                Ok(previous) => written.push((name.as_str(), previous)),
                Err(e) => {
                    rollback(backend, &key, &written, ctx);
                    return Err(ProviderError::apply_failed(
                        &key,
                        format!("value {name}: {e}"),
                    ));
                }
            }
        }

        ctx.log
            .debug(&format!("{key}: wrote {} value(s)", written.len()));
        Ok(!written.is_empty() && key.signals_reboot())
    }
}

fn native_type(state: Option<&LiveState>, name: &str) -> Option<NativeType> {
    state
        .and_then(|s| s.attributes.as_ref())
        .and_then(|a| a.value_types.get(name).copied())
}

/// Undo already-written values, newest first.
fn rollback(
    backend: &dyn RegistryBackend,
    key: &RegistryKey,
    written: &[(&str, Option<RegistryValue>)],
    ctx: &Context,
) {
    for (name, previous) in written.iter().rev() {
        let result = match previous {
            Some(value) => backend.set_value(key, name, value),
            None => backend.delete_value(key, name),
        };
        if let Err(e) = result {
            ctx.log
                .warn(&format!("rollback of {key}\\{name} failed: {e}"));
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::locator::normalize;
    use crate::resources::store::StateStore;
    use crate::resources::test_helpers::{descriptor, make_context};
    use crate::resources::{ProviderError, ResourceChange};
    use mockall::predicate::{always, eq};

    fn key(raw: &str) -> RegistryKey {
        RegistryKey::from_locator(&normalize(raw, ResourceKind::Registry).unwrap())
    }

    fn app_descriptor() -> Descriptor {
        descriptor(
            ResourceKind::Registry,
            r"HKCU\Software\App",
            &[
                ("Theme", FieldType::String),
                ("Size", FieldType::Integer),
                ("Enabled", FieldType::Boolean),
            ],
        )
    }

    // -----------------------------------------------------------------------
    // RegistryKey
    // -----------------------------------------------------------------------

    #[test]
    fn key_splits_hive_and_path() {
        let k = key(r"HKEY_LOCAL_MACHINE\Software\Vendor");
        assert_eq!(k.hive, "HKLM");
        assert_eq!(k.path.to_ascii_lowercase(), r"software\vendor");
    }

    #[test]
    fn reboot_only_for_control_and_services() {
        assert!(key(r"HKLM\SYSTEM\CurrentControlSet\Control\Session Manager").signals_reboot());
        assert!(key(r"HKLM\System\CurrentControlSet\Services\Tcpip").signals_reboot());
        assert!(!key(r"HKLM\SYSTEM\CurrentControlSet").signals_reboot());
        assert!(!key(r"HKLM\Software\Vendor").signals_reboot());
        assert!(!key(r"HKCU\SYSTEM\CurrentControlSet\Control").signals_reboot());
    }

    #[test]
    fn default_value_aliases() {
        assert_eq!(value_name("(Default)"), "");
        assert_eq!(value_name("@"), "");
        assert_eq!(value_name("Theme"), "Theme");
    }

    // -----------------------------------------------------------------------
    // MemoryRegistry round trip
    // -----------------------------------------------------------------------

    #[test]
    fn backup_then_restore_through_memory_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let k = key(r"HKCU\Software\App");
        let registry = MemoryRegistry::new()
            .with_value(&k, "Theme", FieldValue::String("dark".into()))
            .with_value(&k, "Size", FieldValue::Integer(12))
            .with_value(&k, "Enabled", FieldValue::Integer(1));
        let provider = RegistryProvider::with_backend(registry.clone());
        let desc = app_descriptor();

        provider.capture(&desc, &store, &ctx).unwrap();
        registry.insert(&k, "Theme", FieldValue::String("light".into()));
        registry.insert(&k, "Enabled", FieldValue::Boolean(false));

        let outcome = provider.apply(&desc, &store, &ctx).unwrap();
        assert_eq!(outcome.change, ResourceChange::Applied);
        assert!(!outcome.requires_reboot);
        assert_eq!(
            registry.value(&k, "theme"),
            Some(FieldValue::String("dark".into()))
        );
        assert_eq!(registry.value(&k, "Enabled"), Some(FieldValue::Boolean(true)));
    }

    #[test]
    fn expandable_and_qword_types_survive_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let k = key(r"HKCU\Environment");
        let registry = MemoryRegistry::new()
            .with_value(
                &k,
                "Path",
                RegistryValue::typed(
                    FieldValue::String(r"%USERPROFILE%\bin".into()),
                    NativeType::ExpandString,
                ),
            )
            .with_value(
                &k,
                "Quota",
                RegistryValue::typed(FieldValue::Integer(7), NativeType::Qword),
            );
        let provider = RegistryProvider::with_backend(registry.clone());
        let desc = descriptor(
            ResourceKind::Registry,
            r"HKCU\Environment",
            &[("Path", FieldType::String), ("Quota", FieldType::Integer)],
        );

        provider.capture(&desc, &store, &ctx).unwrap();
        registry.insert(&k, "Path", FieldValue::String(r"C:\Tools".into()));
        registry.insert(&k, "Quota", FieldValue::Integer(7));

        let outcome = provider.apply(&desc, &store, &ctx).unwrap();
        assert_eq!(outcome.change, ResourceChange::Applied);
        assert_eq!(
            registry.value(&k, "Path"),
            Some(FieldValue::String(r"%USERPROFILE%\bin".into()))
        );
        assert_eq!(registry.native_type(&k, "Path"), Some(NativeType::ExpandString));
        assert_eq!(registry.native_type(&k, "Quota"), Some(NativeType::Qword));
    }

    #[test]
    fn missing_key_is_absent() {
        let (ctx, _log) = make_context(false);
        let provider = RegistryProvider::with_backend(MemoryRegistry::new());
        assert!(provider.read_live(&app_descriptor(), &ctx).unwrap().is_none());
    }

    #[test]
    fn existing_key_without_values_is_present() {
        let (ctx, _log) = make_context(false);
        let registry = MemoryRegistry::new().with_key(&key(r"HKCU\Software\App"));
        let provider = RegistryProvider::with_backend(registry);
        let live = provider.read_live(&app_descriptor(), &ctx).unwrap().unwrap();
        assert!(live.fields.is_empty());
    }

    #[test]
    fn control_key_change_requires_reboot() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let (ctx, _log) = make_context(false);
        let raw = r"HKLM\SYSTEM\CurrentControlSet\Control\Session Manager";
        let k = key(raw);
        let registry =
            MemoryRegistry::new().with_value(&k, "Pending", FieldValue::Integer(0));
        let provider = RegistryProvider::with_backend(registry.clone());
        let desc = descriptor(
            ResourceKind::Registry,
            raw,
            &[("Pending", FieldType::Integer)],
        );
        provider.capture(&desc, &store, &ctx).unwrap();

        assert!(!provider.apply(&desc, &store, &ctx).unwrap().requires_reboot);
        registry.insert(&k, "Pending", FieldValue::Integer(5));
        assert!(provider.apply(&desc, &store, &ctx).unwrap().requires_reboot);
    }

    #[test]
    fn unsupported_without_backend() {
        let (ctx, _log) = make_context(false);
        let provider = RegistryProvider { backend: None };
        let err = provider.read_live(&app_descriptor(), &ctx).unwrap_err();
        assert!(matches!(err, ProviderError::Platform(_)));
    }

    // -----------------------------------------------------------------------
    // rollback (mocked backend)
    // -----------------------------------------------------------------------

    #[test]
    fn failed_write_rolls_back_earlier_values() {
        let (ctx, _log) = make_context(false);
        let mut backend = MockRegistryBackend::new();
        backend
            .expect_get_value()
            .with(always(), eq("Enabled"))
            .returning(|_, _| Ok(Some(FieldValue::Boolean(false).into())));
        backend
            .expect_get_value()
            .with(always(), eq("Size"))
            .returning(|_, _| Ok(None));
        backend
            .expect_set_value()
            .with(always(), eq("Enabled"), eq(RegistryValue::from(FieldValue::Boolean(true))))
            .times(1)
            .returning(|_, _, _| Ok(()));
        backend
            .expect_set_value()
            .with(always(), eq("Size"), always())
            .times(1)
            .returning(|_, _, _| Err("access denied".to_string()));
        backend
            .expect_set_value()
            .with(always(), eq("Enabled"), eq(RegistryValue::from(FieldValue::Boolean(false))))
            .times(1)
            .returning(|_, _, _| Ok(()));
        backend.expect_delete_value().never();

        let provider = RegistryProvider::with_backend(backend);
        let desired = LiveState::from_fields([
            ("Enabled".to_string(), FieldValue::Boolean(true)),
            ("Size".to_string(), FieldValue::Integer(3)),
        ]);
        let err = provider
            .write_live(&app_descriptor(), &desired, None, &ctx)
            .unwrap_err();
        assert!(matches!(err, ProviderError::ApplyFailed { .. }));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn rollback_deletes_values_that_did_not_exist() {
        let (ctx, _log) = make_context(false);
        let mut backend = MockRegistryBackend::new();
        backend.expect_get_value().returning(|_, _| Ok(None));
        backend
            .expect_set_value()
            .with(always(), eq("Enabled"), always())
            .returning(|_, _, _| Ok(()));
        backend
            .expect_set_value()
            .with(always(), eq("Size"), always())
            .returning(|_, _, _| Err("disk full".to_string()));
        backend
            .expect_delete_value()
            .with(always(), eq("Enabled"))
            .times(1)
            .returning(|_, _| Ok(()));

        let provider = RegistryProvider::with_backend(backend);
        let desired = LiveState::from_fields([
            ("Enabled".to_string(), FieldValue::Boolean(true)),
            ("Size".to_string(), FieldValue::Integer(3)),
        ]);
        assert!(
            provider
                .write_live(&app_descriptor(), &desired, None, &ctx)
                .is_err()
        );
    }
}
