//! Tool settings from `snapstate.toml`.
//!
//! The file is optional; every setting has a default and command-line flags
//! override what the file says.
pub mod toml_loader;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::crypto::{EncryptionContext, MachineBound, Passphrase};
use crate::locator::{DriveMap, Normalizer};
use crate::platform::{self, Platform};

/// Environment variable naming an explicit settings file.
pub const CONFIG_ENV: &str = "SNAPSTATE_CONFIG";

/// Settings file name inside the config directory.
pub const CONFIG_FILE: &str = "snapstate.toml";

/// Label mixed into machine-bound keys.
const KEY_LABEL: &str = "snapstate";

/// All settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Where templates and snapshots live.
    pub paths: Paths,
    /// How field encryption keys are derived.
    pub encryption: Encryption,
    /// Drive letter to UNC root, e.g. `Z = '\\nas\share'`.
    pub drives: BTreeMap<String, String>,
}

/// `[paths]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    /// Template directory.
    pub templates: Option<PathBuf>,
    /// Snapshot (state record) directory.
    pub state: Option<PathBuf>,
}

/// Where the encryption key comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySourceKind {
    /// Bound to this machine and user.
    #[default]
    Machine,
    /// Argon2id over a passphrase; portable between machines.
    Passphrase,
}

/// `[encryption]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Encryption {
    /// Key source.
    pub key_source: KeySourceKind,
    /// Environment variable holding the passphrase.
    pub passphrase_env: String,
    /// Argon2 salt (at least 8 bytes).
    pub salt: Option<String>,
}

impl Default for Encryption {
    fn default() -> Self {
        Self {
            key_source: KeySourceKind::Machine,
            passphrase_env: "SNAPSTATE_PASSPHRASE".to_string(),
            salt: None,
        }
    }
}

impl Settings {
    /// Load settings from `explicit`, `$SNAPSTATE_CONFIG`, or the default
    /// location, in that order.
    ///
    /// A missing default file yields defaults; a missing explicit file is an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let chosen = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        if let Some(path) = chosen {
            if !path.exists() {
                anyhow::bail!("config file not found: {}", path.display());
            }
            return toml_loader::load_config(&path);
        }
        match default_path() {
            Some(path) => toml_loader::load_config(&path),
            None => Ok(Self::default()),
        }
    }

    /// Template directory: `flag`, then `[paths] templates`, then
    /// `<config dir>/snapstate/templates`.
    #[must_use]
    pub fn templates_dir(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.paths.templates.clone())
            .unwrap_or_else(|| app_dir().join("templates"))
    }

    /// Snapshot directory: `flag`, then `[paths] state`, then
    /// `<config dir>/snapstate/state`.
    #[must_use]
    pub fn state_dir(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.paths.state.clone())
            .unwrap_or_else(|| app_dir().join("state"))
    }

    /// Locator normalizer with the configured drive mappings.
    ///
    /// # Errors
    ///
    /// Returns an error if a drive mapping is malformed.
    pub fn normalizer(&self, platform: &Platform) -> Result<Normalizer> {
        let drives = DriveMap::from_entries(&self.drives)
            .context("invalid [drives] mapping")?
            .local_host(platform.machine_name.clone());
        Ok(Normalizer::new(drives))
    }

    /// Encryption context for the configured key source.
    ///
    /// Key material is derived lazily, so a missing passphrase or machine
    /// identifier only fails once a field actually needs sealing.
    #[must_use]
    pub fn encryption_context(&self) -> EncryptionContext {
        match self.encryption.key_source {
            KeySourceKind::Machine => {
                let source = MachineBound::detect(KEY_LABEL).unwrap_or_else(|e| {
                    tracing::debug!("machine key unavailable: {e}");
                    MachineBound::new("", platform::user_name(), KEY_LABEL)
                });
                EncryptionContext::new(source)
            }
            KeySourceKind::Passphrase => {
                let passphrase = std::env::var(&self.encryption.passphrase_env).unwrap_or_default();
                let salt = self.encryption.salt.clone().unwrap_or_default();
                EncryptionContext::new(Passphrase::new(passphrase, salt.into_bytes()))
            }
        }
    }
}

/// `$XDG_CONFIG_HOME`, `%APPDATA%`, or `~/.config`.
fn config_root() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .or_else(|| std::env::var_os("APPDATA"))
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
}

fn app_dir() -> PathBuf {
    config_root()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("snapstate")
}

/// Default settings file path, if a config directory can be determined.
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    config_root().map(|root| root.join("snapstate").join(CONFIG_FILE))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::locator::ResourceKind;
    use crate::platform::Os;

    const FULL: &str = r#"
        [paths]
        templates = "/srv/templates"
        state = "/srv/state"

        [encryption]
        key_source = "passphrase"
        passphrase_env = "TEST_SNAPSTATE_PASS"
        salt = "0123456789abcdef"

        [drives]
        Z = '\\nas\share'
    "#;

    #[test]
    fn parses_every_section() {
        let settings: Settings = toml_loader::parse_config(FULL).unwrap();
        assert_eq!(settings.paths.templates, Some(PathBuf::from("/srv/templates")));
        assert_eq!(settings.encryption.key_source, KeySourceKind::Passphrase);
        assert_eq!(settings.drives["Z"], r"\\nas\share");
    }

    #[test]
    fn empty_file_is_default() {
        let settings: Settings = toml_loader::parse_config("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.encryption.passphrase_env, "SNAPSTATE_PASSPHRASE");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml_loader::parse_config::<Settings>("[paths]\ntemplate = \"x\"\n").is_err());
    }

    #[test]
    fn flags_override_file() {
        let settings: Settings = toml_loader::parse_config(FULL).unwrap();
        assert_eq!(
            settings.state_dir(Some(Path::new("/tmp/s"))),
            PathBuf::from("/tmp/s")
        );
        assert_eq!(settings.state_dir(None), PathBuf::from("/srv/state"));
        assert_eq!(settings.templates_dir(None), PathBuf::from("/srv/templates"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, FULL).unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.encryption.salt.as_deref(), Some("0123456789abcdef"));
    }

    #[test]
    fn drive_mappings_reach_the_normalizer() {
        let settings: Settings = toml_loader::parse_config(FULL).unwrap();
        let normalizer = settings.normalizer(&Platform::new(Os::Windows, "WS")).unwrap();
        let mapped = normalizer
            .normalize(r"Z:\docs\a.txt", ResourceKind::File)
            .unwrap();
        let unc = normalizer
            .normalize(r"\\NAS\share\docs\A.txt", ResourceKind::File)
            .unwrap();
        assert_eq!(mapped, unc);
    }

    #[test]
    fn bad_drive_mapping_is_reported() {
        let settings: Settings = toml_loader::parse_config("[drives]\nZ = 'share'\n").unwrap();
        assert!(settings.normalizer(&Platform::new(Os::Linux, "h")).is_err());
    }

    #[test]
    fn missing_passphrase_fails_on_first_use() {
        let settings: Settings = toml_loader::parse_config(FULL).unwrap();
        let ctx = settings.encryption_context();
        assert!(ctx.protect(b"x").is_err());
        assert!(!ctx.is_cached());
    }
}
