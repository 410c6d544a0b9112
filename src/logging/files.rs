//! Where run logs live and how the previous run's log is kept.
use std::fs;
use std::path::{Path, PathBuf};

/// Overrides the log directory.
pub(super) const LOG_DIR_VAR: &str = "SNAPSTATE_LOG_DIR";

/// Log directory for the current process environment, created if needed.
pub(super) fn log_dir() -> Option<PathBuf> {
    let dir = resolve_log_dir(|name| std::env::var(name).ok(), cfg!(windows))?;
    fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

/// Pick the log directory from environment lookups.
///
/// `SNAPSTATE_LOG_DIR` wins. Windows hosts use `%LOCALAPPDATA%`; others
/// follow the XDG state directory, falling back to `~/.local/state`.
fn resolve_log_dir(var: impl Fn(&str) -> Option<String>, windows: bool) -> Option<PathBuf> {
    let set = |name: &str| var(name).filter(|v| !v.is_empty()).map(PathBuf::from);
    if let Some(dir) = set(LOG_DIR_VAR) {
        return Some(dir);
    }
    let base = if windows {
        set("LOCALAPPDATA").or_else(|| set("USERPROFILE").map(|p| p.join("AppData").join("Local")))?
    } else {
        set("XDG_STATE_HOME").or_else(|| set("HOME").map(|p| p.join(".local").join("state")))?
    };
    Some(base.join("snapstate").join("logs"))
}

/// Log file for `command`, e.g. `backup.log`.
pub(super) fn log_file_path(command: &str) -> Option<PathBuf> {
    Some(log_dir()?.join(format!("{command}.log")))
}

/// Move an existing log at `path` aside as `<stem>.prev.log` so one earlier
/// run stays readable after the new run truncates `path`.
pub(super) fn keep_previous(path: &Path) {
    if !path.is_file() {
        return;
    }
    let stem = path
        .file_stem()
        .map_or_else(|| "snapstate".into(), |s| s.to_string_lossy().into_owned());
    fs::rename(path, path.with_file_name(format!("{stem}.prev.log"))).ok();
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn override_wins_everywhere() {
        let vars = env(&[(LOG_DIR_VAR, "/var/log/snap"), ("HOME", "/home/ana")]);
        assert_eq!(
            resolve_log_dir(&vars, false),
            Some(PathBuf::from("/var/log/snap"))
        );
        assert_eq!(
            resolve_log_dir(&vars, true),
            Some(PathBuf::from("/var/log/snap"))
        );
    }

    #[test]
    fn unix_uses_xdg_state_then_home() {
        let xdg = env(&[("XDG_STATE_HOME", "/tmp/state"), ("HOME", "/home/ana")]);
        assert_eq!(
            resolve_log_dir(&xdg, false),
            Some(PathBuf::from("/tmp/state/snapstate/logs"))
        );
        let home = env(&[("HOME", "/home/ana"), ("XDG_STATE_HOME", "")]);
        assert_eq!(
            resolve_log_dir(&home, false),
            Some(PathBuf::from("/home/ana/.local/state/snapstate/logs"))
        );
    }

    #[test]
    fn windows_uses_local_app_data() {
        let vars = env(&[("LOCALAPPDATA", "C:/Users/ana/AppData/Local")]);
        assert_eq!(
            resolve_log_dir(&vars, true),
            Some(PathBuf::from("C:/Users/ana/AppData/Local/snapstate/logs"))
        );
    }

    #[test]
    fn no_home_means_no_log_dir() {
        assert_eq!(resolve_log_dir(env(&[]), false), None);
    }

    #[test]
    fn previous_log_is_kept_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("restore.log");
        fs::write(&log, "first run").unwrap();
        keep_previous(&log);
        assert!(!log.exists());
        fs::write(&log, "second run").unwrap();
        keep_previous(&log);
        assert_eq!(
            fs::read_to_string(dir.path().join("restore.prev.log")).unwrap(),
            "second run"
        );
    }

    #[test]
    fn keeping_a_missing_log_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        keep_previous(&dir.path().join("absent.log"));
        assert!(!dir.path().join("absent.prev.log").exists());
    }
}
