//! Canonical resource addresses.
//!
//! Every resource a template names is addressed by a [`Locator`]: the
//! resource kind plus a list of path segments whose first entry is the root
//! token (`/`, `C:`, `\\host\share`, `~`, `%APPDATA%`, `HKLM`, ...).
//! Equivalent spellings of the same resource (drive-letter, UNC, long-path,
//! admin-share and drive-mapped forms; registry hive aliases) normalize to the
//! same segment list, so [`Locator::record_key`] is stable across them.
//!
//! Paths rooted at `~` or an environment variable keep the variable as their
//! root token; expansion happens only when a provider needs the real path
//! (see [`Locator::to_path`]), which keeps record keys portable between
//! machines.
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::LocatorError;

/// Characters Windows forbids inside a path component.
const WINDOWS_RESERVED: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Host names that always refer to the local machine in UNC paths.
const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "."];

/// Number of digest bytes kept in a record key (32 hex characters).
const RECORD_KEY_BYTES: usize = 16;

/// A category of manageable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A regular file or symlink.
    File,
    /// A registry key and a set of its values.
    Registry,
    /// The package inventory of one package manager.
    Application,
    /// A scheduled task definition.
    ScheduledTask,
}

impl ResourceKind {
    /// All kinds in template document order.
    pub const ALL: [Self; 4] = [
        Self::File,
        Self::Registry,
        Self::Application,
        Self::ScheduledTask,
    ];

    /// The order in which the executor visits kinds.
    ///
    /// Registry state (identity mappings, feature toggles) lands before file
    /// ownership and permissions are restored.
    pub const EXECUTION_ORDER: [Self; 4] = [
        Self::Registry,
        Self::File,
        Self::Application,
        Self::ScheduledTask,
    ];

    /// Section name used in template documents and record file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Registry => "registry",
            Self::Application => "application",
            Self::ScheduledTask => "scheduled_task",
        }
    }

    /// Parse a template section name.
    #[must_use]
    pub fn from_section(section: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == section)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical address of one resource instance within its kind.
///
/// Equality, ordering and hashing use the case-folded canonical form when
/// `case_fold` is set, so `C:\Users` and `c:/users` are the same locator.
#[derive(Debug, Clone)]
pub struct Locator {
    kind: ResourceKind,
    segments: Vec<String>,
    case_fold: bool,
}

impl Locator {
    /// Resource kind this locator addresses.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Normalized segments; the first entry is the root token.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether comparisons ignore ASCII case.
    #[must_use]
    pub const fn case_fold(&self) -> bool {
        self.case_fold
    }

    /// The root token (`/`, `C:`, `\\host\share`, `HKLM`, ...).
    #[must_use]
    pub fn root(&self) -> &str {
        self.segments.first().map_or("", String::as_str)
    }

    /// Canonical string form used for equality and hashing.
    #[must_use]
    pub fn canonical(&self) -> String {
        let display = self.to_string();
        if self.case_fold {
            display.to_lowercase()
        } else {
            display
        }
    }

    /// Stable key for the state record of this resource.
    ///
    /// A truncated SHA-256 over the kind and the canonical form, rendered as
    /// 32 lowercase hex characters.
    #[must_use]
    pub fn record_key(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.canonical().as_bytes());
        let digest = hasher.finalize();
        digest
            .iter()
            .take(RECORD_KEY_BYTES)
            .fold(String::with_capacity(RECORD_KEY_BYTES * 2), |mut out, b| {
                let _ = write!(out, "{b:02x}");
                out
            })
    }

    /// Whether `self` equals `other` or lies beneath it.
    #[must_use]
    pub fn starts_with(&self, other: &Self) -> bool {
        if self.kind != other.kind || other.segments.len() > self.segments.len() {
            return false;
        }
        let fold = self.case_fold || other.case_fold;
        self.segments
            .iter()
            .zip(&other.segments)
            .all(|(a, b)| if fold { a.eq_ignore_ascii_case(b) } else { a == b })
    }

    /// Resolve a file locator to a real filesystem path.
    ///
    /// # Errors
    ///
    /// Returns an error if the locator is not a file locator, or if it is
    /// rooted at `~` or a variable that `env` cannot expand.
    pub fn to_path(&self, env: &Environment) -> Result<PathBuf, LocatorError> {
        if self.kind != ResourceKind::File {
            return Err(LocatorError::new(
                self.to_string(),
                format!("{} locators have no filesystem path", self.kind),
            ));
        }
        let root = self.root();
        let mut path = if root == "/" {
            PathBuf::from("/")
        } else if root == "~" {
            env.home()
                .map(PathBuf::from)
                .ok_or_else(|| LocatorError::new(self.to_string(), "home directory is unknown"))?
        } else if let Some(name) = root.strip_prefix('%').and_then(|r| r.strip_suffix('%')) {
            self.expand(env, name)?
        } else if let Some(name) = root.strip_prefix('$') {
            self.expand(env, name)?
        } else {
            PathBuf::from(format!("{root}\\"))
        };
        for segment in self.segments.iter().skip(1) {
            path.push(segment);
        }
        Ok(path)
    }

    fn expand(&self, env: &Environment, name: &str) -> Result<PathBuf, LocatorError> {
        env.var(name).map(PathBuf::from).ok_or_else(|| {
            LocatorError::new(
                self.to_string(),
                format!("environment variable {name} is not set"),
            )
        })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = self.root();
        let rest = self.segments.get(1..).unwrap_or_default();
        match self.kind {
            ResourceKind::Application => f.write_str(root),
            ResourceKind::ScheduledTask => write!(f, "\\{}", self.segments.join("\\")),
            ResourceKind::Registry => {
                f.write_str(root)?;
                for segment in rest {
                    write!(f, "\\{segment}")?;
                }
                Ok(())
            }
            ResourceKind::File => {
                let sep = if self.case_fold { '\\' } else { '/' };
                if root == "/" {
                    return write!(f, "/{}", rest.join("/"));
                }
                f.write_str(root)?;
                if rest.is_empty() && root.len() == 2 && root.ends_with(':') {
                    return f.write_str("\\");
                }
                for segment in rest {
                    write!(f, "{sep}{segment}")?;
                }
                Ok(())
            }
        }
    }
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.canonical() == other.canonical()
    }
}

impl Eq for Locator {}

impl Hash for Locator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.canonical().hash(state);
    }
}

impl PartialOrd for Locator {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Locator {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.kind, self.canonical()).cmp(&(other.kind, other.canonical()))
    }
}

/// Variable and home-directory lookup used when resolving file locators.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    home: Option<String>,
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Snapshot the current process environment.
    #[must_use]
    pub fn from_process() -> Self {
        let vars: BTreeMap<String, String> = std::env::vars().collect();
        let home = vars
            .get("HOME")
            .or_else(|| vars.get("USERPROFILE"))
            .cloned();
        Self { home, vars }
    }

    /// Override the home directory.
    #[must_use]
    pub fn with_home(mut self, home: impl Into<String>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Add or replace one variable.
    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Home directory, if known.
    #[must_use]
    pub fn home(&self) -> Option<&str> {
        self.home.as_deref()
    }

    /// Look up a variable, falling back to a case-insensitive match.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .or_else(|| {
                self.vars
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }
}

/// Drive letters mapped to network shares, plus extra names for the local
/// machine.
///
/// With `Z:` mapped to `\\nas\share`, the path `Z:\docs\a.txt` normalizes to
/// the same locator as `\\nas\share\docs\a.txt`.
#[derive(Debug, Clone, Default)]
pub struct DriveMap {
    drives: BTreeMap<char, Vec<String>>,
    local_hosts: Vec<String>,
}

impl DriveMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `letter` to a UNC root such as `\\nas\share` or `\\nas\share\sub`.
    ///
    /// # Errors
    ///
    /// Returns an error if `letter` is not ASCII alphabetic or `unc_root` is
    /// not a UNC path with a host and share.
    pub fn map(mut self, letter: char, unc_root: &str) -> Result<Self, LocatorError> {
        if !letter.is_ascii_alphabetic() {
            return Err(LocatorError::new(
                unc_root,
                format!("'{letter}' is not a drive letter"),
            ));
        }
        let unified = unc_root.trim().replace('/', "\\");
        let Some(body) = unified.strip_prefix(r"\\") else {
            return Err(LocatorError::new(unc_root, "drive mapping must be a UNC path"));
        };
        let parts: Vec<String> = body
            .split('\\')
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        if parts.len() < 2 {
            return Err(LocatorError::new(unc_root, "UNC path needs a host and a share"));
        }
        self.drives.insert(letter.to_ascii_uppercase(), parts);
        Ok(self)
    }

    /// Treat `name` (e.g. the machine's own host name) as the local machine.
    #[must_use]
    pub fn local_host(mut self, name: impl Into<String>) -> Self {
        self.local_hosts.push(name.into());
        self
    }

    /// Build a map from `letter -> UNC root` configuration entries.
    ///
    /// # Errors
    ///
    /// Returns an error if any key is not a single drive letter (an optional
    /// trailing `:` is accepted) or any value is not a UNC root.
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self, LocatorError> {
        entries.into_iter().try_fold(Self::new(), |map, (key, root)| {
            let mut chars = key.trim_end_matches(':').chars();
            match (chars.next(), chars.next()) {
                (Some(letter), None) => map.map(letter, root),
                _ => Err(LocatorError::new(key.as_str(), "expected a single drive letter")),
            }
        })
    }

    fn is_local(&self, host: &str) -> bool {
        LOCAL_HOSTS.iter().any(|h| h.eq_ignore_ascii_case(host))
            || self.local_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }
}

/// Normalizes raw template addresses into [`Locator`]s.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    drives: DriveMap,
}

impl Normalizer {
    /// Create a normalizer that applies `drives`.
    #[must_use]
    pub const fn new(drives: DriveMap) -> Self {
        Self { drives }
    }

    /// Normalize `raw` as an address of `kind`.
    ///
    /// # Errors
    ///
    /// Returns a [`LocatorError`] if `raw` is empty or malformed for `kind`.
    pub fn normalize(&self, raw: &str, kind: ResourceKind) -> Result<Locator, LocatorError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LocatorError::new(raw, "address is empty"));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(LocatorError::new(raw, "address contains control characters"));
        }
        match kind {
            ResourceKind::File => self.normalize_file(trimmed),
            ResourceKind::Registry => normalize_registry(trimmed),
            ResourceKind::Application => normalize_application(trimmed),
            ResourceKind::ScheduledTask => normalize_task(trimmed),
        }
    }

    fn normalize_file(&self, raw: &str) -> Result<Locator, LocatorError> {
        let unc_like = raw.starts_with("//") && !raw.starts_with("///");
        if raw.starts_with('/') && !unc_like && !raw.contains('\\') {
            return Ok(file_locator(vec!["/".to_string()], raw.split('/'), false));
        }
        if raw == "~" || raw.starts_with("~/") {
            return Ok(file_locator(vec!["~".to_string()], raw.split('/').skip(1), false));
        }
        if let Some(rest) = raw.strip_prefix('$') {
            let (name, tail) = split_posix_var(rest)
                .ok_or_else(|| LocatorError::new(raw, "malformed environment variable"))?;
            return Ok(file_locator(vec![format!("${name}")], tail.split('/'), false));
        }

        let unified = raw.replace('/', "\\");
        let (root, tail) = self.windows_root(raw, &unified)?;
        let components: Vec<&str> = tail.split('\\').collect();
        if let Some(bad) = components
            .iter()
            .find(|c| c.contains(WINDOWS_RESERVED))
        {
            return Err(LocatorError::new(
                raw,
                format!("path component '{bad}' contains reserved characters"),
            ));
        }
        Ok(file_locator(root, components.into_iter(), true))
    }

    /// Split a Windows-style path into its root segments and the remaining
    /// backslash-separated tail.
    fn windows_root<'a>(
        &self,
        raw: &str,
        unified: &'a str,
    ) -> Result<(Vec<String>, &'a str), LocatorError> {
        let lower = unified.to_ascii_lowercase();
        if lower.starts_with(r"\\?\unc\") || lower.starts_with(r"\\.\unc\") {
            let body = unified.get(8..).unwrap_or_default();
            return self.unc_root(raw, body);
        }
        if lower.starts_with(r"\\?\") || lower.starts_with(r"\\.\") {
            let body = unified.get(4..).unwrap_or_default();
            if let Some(result) = self.drive_root(raw, body) {
                return result;
            }
            let (device, tail) = body.split_once('\\').unwrap_or((body, ""));
            if device.is_empty() {
                return Err(LocatorError::new(raw, "device path has no device name"));
            }
            return Ok((vec![format!(r"\\?\{device}")], tail));
        }
        if let Some(body) = unified.strip_prefix(r"\\") {
            return self.unc_root(raw, body);
        }
        if unified == "~" || unified.starts_with("~\\") {
            return Ok((vec!["~".to_string()], unified.get(1..).unwrap_or_default()));
        }
        if let Some(rest) = unified.strip_prefix('%')
            && let Some((name, tail)) = rest.split_once('%')
            && !name.is_empty()
            && (tail.is_empty() || tail.starts_with('\\'))
        {
            return Ok((vec![format!("%{}%", name.to_ascii_uppercase())], tail));
        }
        self.drive_root(raw, unified).unwrap_or_else(|| {
            Err(LocatorError::new(
                raw,
                "path must be absolute, or start with ~ or an environment variable",
            ))
        })
    }

    /// Parse `X:\...`; `None` when `body` does not start with a drive letter.
    fn drive_root<'a>(
        &self,
        raw: &str,
        body: &'a str,
    ) -> Option<Result<(Vec<String>, &'a str), LocatorError>> {
        let mut chars = body.chars();
        let letter = chars.next().filter(char::is_ascii_alphabetic)?;
        if chars.next() != Some(':') {
            return None;
        }
        let tail = body.get(2..).unwrap_or_default();
        if !tail.is_empty() && !tail.starts_with('\\') {
            return Some(Err(LocatorError::new(
                raw,
                "drive-relative paths are not supported",
            )));
        }
        let letter = letter.to_ascii_uppercase();
        if let Some(mapped) = self.drives.drives.get(&letter) {
            let mut root = vec![unc_token(mapped.first()?, mapped.get(1)?)];
            root.extend(mapped.iter().skip(2).cloned());
            return Some(Ok((root, tail)));
        }
        Some(Ok((vec![format!("{letter}:")], tail)))
    }

    fn unc_root<'a>(
        &self,
        raw: &str,
        body: &'a str,
    ) -> Result<(Vec<String>, &'a str), LocatorError> {
        let mut parts = body.splitn(3, '\\');
        let host = parts.next().unwrap_or_default();
        let share = parts.next().unwrap_or_default();
        let tail = parts.next().unwrap_or_default();
        if host.is_empty() || share.is_empty() {
            return Err(LocatorError::new(raw, "UNC path needs a host and a share"));
        }
        if self.drives.is_local(host)
            && let Some(letter) = admin_share_drive(share)
        {
            return Ok((vec![format!("{letter}:")], tail));
        }
        Ok((vec![unc_token(host, share)], tail))
    }
}

/// Normalize with an empty drive map.
///
/// # Errors
///
/// Returns a [`LocatorError`] if `raw` is empty or malformed for `kind`.
pub fn normalize(raw: &str, kind: ResourceKind) -> Result<Locator, LocatorError> {
    Normalizer::default().normalize(raw, kind)
}

fn unc_token(host: &str, share: &str) -> String {
    format!(r"\\{host}\{share}")
}

/// `C$` → `C`.
fn admin_share_drive(share: &str) -> Option<char> {
    let mut chars = share.chars();
    let letter = chars.next().filter(char::is_ascii_alphabetic)?;
    (chars.next() == Some('$') && chars.next().is_none()).then(|| letter.to_ascii_uppercase())
}

/// `NAME/rest` or `{NAME}/rest` → (`NAME`, `/rest`).
fn split_posix_var(rest: &str) -> Option<(&str, &str)> {
    if let Some(braced) = rest.strip_prefix('{') {
        let (name, tail) = braced.split_once('}')?;
        return (!name.is_empty() && (tail.is_empty() || tail.starts_with('/')))
            .then_some((name, tail));
    }
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let (name, tail) = rest.split_at(end);
    (!name.is_empty() && (tail.is_empty() || tail.starts_with('/'))).then_some((name, tail))
}

/// Append path components to `root`, resolving `.` and `..` lexically.
///
/// `..` never climbs above the root segments.
fn file_locator<'a>(
    root: Vec<String>,
    components: impl Iterator<Item = &'a str>,
    case_fold: bool,
) -> Locator {
    let floor = root.len();
    let mut segments = root;
    for component in components {
        match component {
            "" | "." => {}
            ".." => {
                if segments.len() > floor {
                    segments.pop();
                }
            }
            other => segments.push(other.to_string()),
        }
    }
    Locator {
        kind: ResourceKind::File,
        segments,
        case_fold,
    }
}

/// Canonical short hive name for any accepted alias.
fn canonical_hive(hive: &str) -> Option<&'static str> {
    let upper = hive.trim_end_matches(':').to_ascii_uppercase();
    match upper.as_str() {
        "HKLM" | "HKEY_LOCAL_MACHINE" => Some("HKLM"),
        "HKCU" | "HKEY_CURRENT_USER" => Some("HKCU"),
        "HKCR" | "HKEY_CLASSES_ROOT" => Some("HKCR"),
        "HKU" | "HKEY_USERS" => Some("HKU"),
        "HKCC" | "HKEY_CURRENT_CONFIG" => Some("HKCC"),
        _ => None,
    }
}

fn normalize_registry(raw: &str) -> Result<Locator, LocatorError> {
    let unified = raw.replace('/', "\\");
    let body = unified
        .split_once("::")
        .filter(|(provider, _)| provider.to_ascii_lowercase().ends_with("registry"))
        .map_or(unified.as_str(), |(_, rest)| rest);
    let mut parts = body.split('\\').filter(|p| !p.is_empty());
    let hive_raw = parts
        .next()
        .ok_or_else(|| LocatorError::new(raw, "registry path has no hive"))?;
    let hive = canonical_hive(hive_raw)
        .ok_or_else(|| LocatorError::new(raw, format!("unknown registry hive '{hive_raw}'")))?;
    let mut segments = vec![hive.to_string()];
    segments.extend(parts.map(String::from));
    Ok(Locator {
        kind: ResourceKind::Registry,
        segments,
        case_fold: true,
    })
}

fn normalize_application(raw: &str) -> Result<Locator, LocatorError> {
    let valid = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'));
    if !valid {
        return Err(LocatorError::new(
            raw,
            "application inventory must be a package manager name",
        ));
    }
    Ok(Locator {
        kind: ResourceKind::Application,
        segments: vec![raw.to_string()],
        case_fold: true,
    })
}

fn normalize_task(raw: &str) -> Result<Locator, LocatorError> {
    let unified = raw.replace('/', "\\");
    let segments: Vec<String> = unified
        .split('\\')
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();
    if segments.is_empty() {
        return Err(LocatorError::new(raw, "scheduled task path has no task name"));
    }
    if let Some(bad) = segments.iter().find(|s| s.contains(WINDOWS_RESERVED)) {
        return Err(LocatorError::new(
            raw,
            format!("task path component '{bad}' contains reserved characters"),
        ));
    }
    Ok(Locator {
        kind: ResourceKind::ScheduledTask,
        segments,
        case_fold: true,
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn file(raw: &str) -> Locator {
        normalize(raw, ResourceKind::File).unwrap()
    }

    // -----------------------------------------------------------------------
    // File locators
    // -----------------------------------------------------------------------

    #[test]
    fn drive_path_segments() {
        let loc = file(r"C:\Users\Alice\notes.txt");
        assert_eq!(loc.segments(), ["C:", "Users", "Alice", "notes.txt"]);
        assert!(loc.case_fold());
        assert_eq!(loc.to_string(), r"C:\Users\Alice\notes.txt");
    }

    #[test]
    fn forward_slashes_and_case_are_equivalent_on_windows_paths() {
        assert_eq!(file(r"C:\Users\Alice"), file("c:/users/alice"));
        assert_eq!(
            file(r"C:\Users\Alice").record_key(),
            file("c:/users/alice/").record_key()
        );
    }

    #[test]
    fn long_path_prefix_is_equivalent_to_drive_path() {
        assert_eq!(file(r"\\?\C:\Data\report.docx"), file(r"C:\Data\report.docx"));
        assert_eq!(file(r"\\.\C:\Data\report.docx"), file(r"C:\Data\report.docx"));
    }

    #[test]
    fn long_unc_prefix_is_equivalent_to_unc_path() {
        assert_eq!(
            file(r"\\?\UNC\nas\share\docs\a.txt"),
            file(r"\\nas\share\docs\a.txt")
        );
    }

    #[test]
    fn local_admin_share_is_equivalent_to_drive_path() {
        assert_eq!(file(r"\\localhost\c$\Temp\x.log"), file(r"C:\Temp\x.log"));
    }

    #[test]
    fn configured_local_host_name_is_treated_as_local() {
        let normalizer = Normalizer::new(DriveMap::new().local_host("WORKSTATION"));
        let a = normalizer
            .normalize(r"\\workstation\D$\x", ResourceKind::File)
            .unwrap();
        assert_eq!(a, file(r"D:\x"));
    }

    #[test]
    fn unc_and_drive_mapped_paths_share_record_key() {
        let drives = DriveMap::new().map('z', r"\\nas\share").unwrap();
        let normalizer = Normalizer::new(drives);
        let mapped = normalizer
            .normalize(r"Z:\docs\budget.xlsx", ResourceKind::File)
            .unwrap();
        let unc = normalizer
            .normalize(r"\\NAS\Share\Docs\budget.xlsx", ResourceKind::File)
            .unwrap();
        assert_eq!(mapped, unc);
        assert_eq!(mapped.record_key(), unc.record_key());
    }

    #[test]
    fn forward_slash_unc_is_not_a_posix_path() {
        let drives = DriveMap::new().map('z', r"\\nas\share").unwrap();
        let normalizer = Normalizer::new(drives);
        let slashed = normalizer
            .normalize("//nas/share/docs/budget.xlsx", ResourceKind::File)
            .unwrap();
        let mapped = normalizer
            .normalize(r"Z:\docs\budget.xlsx", ResourceKind::File)
            .unwrap();
        assert_eq!(slashed, mapped);
        assert_eq!(slashed.record_key(), mapped.record_key());
    }

    #[test]
    fn drive_mapping_to_share_subfolder() {
        let drives = DriveMap::new().map('Y', r"\\nas\share\team").unwrap();
        let normalizer = Normalizer::new(drives);
        let mapped = normalizer.normalize(r"Y:\a.txt", ResourceKind::File).unwrap();
        assert_eq!(mapped, file(r"\\nas\share\team\a.txt"));
    }

    #[test]
    fn dot_segments_are_resolved() {
        assert_eq!(file(r"C:\a\.\b\..\c"), file(r"C:\a\c"));
        assert_eq!(file("/etc/./ssh/../hosts"), file("/etc/hosts"));
    }

    #[test]
    fn parent_segments_never_climb_above_root() {
        assert_eq!(file(r"C:\..\..\x"), file(r"C:\x"));
        assert_eq!(file("/../x").to_string(), "/x");
    }

    #[test]
    fn posix_paths_are_case_sensitive() {
        let a = file("/home/alice/.bashrc");
        assert!(!a.case_fold());
        assert_ne!(a, file("/home/Alice/.bashrc"));
        assert_eq!(a.to_string(), "/home/alice/.bashrc");
    }

    #[test]
    fn very_long_paths_are_accepted() {
        let long = format!(r"C:\{}\file.txt", "segment".repeat(60));
        let loc = file(&long);
        assert!(loc.to_string().len() > 260);
        assert_eq!(file(&format!(r"\\?\{long}")), loc);
    }

    #[test]
    fn home_and_variable_roots_are_kept_unexpanded() {
        assert_eq!(file("~/.config/app.toml").segments()[0], "~");
        assert_eq!(file(r"%AppData%\Code\settings.json").root(), "%APPDATA%");
        assert_eq!(file("$XDG_CONFIG_HOME/git/config").root(), "$XDG_CONFIG_HOME");
        assert_eq!(file("${HOME}/x").root(), "$HOME");
    }

    #[test]
    fn to_path_expands_home_and_variables() {
        let env = Environment::default()
            .with_home("/home/alice")
            .with_var("XDG_CONFIG_HOME", "/home/alice/.config");
        assert_eq!(
            file("~/.bashrc").to_path(&env).unwrap(),
            PathBuf::from("/home/alice/.bashrc")
        );
        assert_eq!(
            file("$XDG_CONFIG_HOME/git/config").to_path(&env).unwrap(),
            PathBuf::from("/home/alice/.config/git/config")
        );
    }

    #[test]
    fn to_path_fails_for_unset_variable() {
        let err = file("$NOPE/x").to_path(&Environment::default()).unwrap_err();
        assert!(err.reason.contains("NOPE"));
    }

    #[test]
    fn invalid_file_locators() {
        for raw in ["", "   ", "relative/path.txt", r"C:relative", r"\\hostonly", "C:\\a\\b?c"] {
            assert!(
                normalize(raw, ResourceKind::File).is_err(),
                "expected '{raw}' to be rejected"
            );
        }
    }

    #[test]
    fn starts_with_detects_descendants() {
        assert!(file(r"C:\Windows\System32\drivers").starts_with(&file(r"c:\windows")));
        assert!(!file(r"C:\WindowsApps").starts_with(&file(r"C:\Windows")));
    }

    // -----------------------------------------------------------------------
    // Registry locators
    // -----------------------------------------------------------------------

    #[test]
    fn registry_hive_aliases_are_equivalent() {
        let short = normalize(r"HKLM:\Software\Vendor", ResourceKind::Registry).unwrap();
        for raw in [
            r"HKLM\Software\Vendor",
            r"HKEY_LOCAL_MACHINE\SOFTWARE\vendor",
            r"Registry::HKEY_LOCAL_MACHINE\Software\Vendor",
            r"Microsoft.PowerShell.Core\Registry::HKLM\Software\Vendor\",
        ] {
            assert_eq!(normalize(raw, ResourceKind::Registry).unwrap(), short, "{raw}");
        }
        assert_eq!(short.segments(), ["HKLM", "Software", "Vendor"]);
        assert_eq!(short.to_string(), r"HKLM\Software\Vendor");
    }

    #[test]
    fn unknown_hive_is_rejected() {
        let err = normalize(r"HKXX:\Software", ResourceKind::Registry).unwrap_err();
        assert!(err.reason.contains("HKXX"));
    }

    #[test]
    fn same_address_different_kind_has_different_key() {
        let a = normalize("winget", ResourceKind::Application).unwrap();
        let b = normalize(r"\winget", ResourceKind::ScheduledTask).unwrap();
        assert_ne!(a.record_key(), b.record_key());
    }

    // -----------------------------------------------------------------------
    // Application and scheduled task locators
    // -----------------------------------------------------------------------

    #[test]
    fn application_locator_is_case_insensitive() {
        assert_eq!(
            normalize("WinGet", ResourceKind::Application).unwrap(),
            normalize("winget", ResourceKind::Application).unwrap()
        );
        assert!(normalize("win get", ResourceKind::Application).is_err());
    }

    #[test]
    fn task_locator_gets_leading_backslash() {
        let loc = normalize("Backup/Nightly", ResourceKind::ScheduledTask).unwrap();
        assert_eq!(loc.to_string(), r"\Backup\Nightly");
        assert!(normalize(r"\", ResourceKind::ScheduledTask).is_err());
    }

    #[test]
    fn record_key_is_32_hex_chars() {
        let key = file("/etc/hosts").record_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn drive_map_from_entries_rejects_bad_letters() {
        let mut entries = BTreeMap::new();
        entries.insert("ZZ".to_string(), r"\\nas\share".to_string());
        assert!(DriveMap::from_entries(&entries).is_err());
        let mut ok = BTreeMap::new();
        ok.insert("Z:".to_string(), r"\\nas\share".to_string());
        assert!(DriveMap::from_entries(&ok).is_ok());
    }

    #[test]
    fn kind_section_names_round_trip() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_section(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::from_section("service"), None);
    }
}
