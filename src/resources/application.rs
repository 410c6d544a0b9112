//! Application provider: the package inventory of one package manager.
use std::collections::BTreeSet;
use std::fmt;

use super::error::ProviderError;
use super::record::{FieldValue, LiveState};
use super::Provider;
use crate::engine::Context;
use crate::exec::ExecResult;
use crate::locator::ResourceKind;
use crate::template::Descriptor;

/// Name of the package list field.
pub const PACKAGES_FIELD: &str = "packages";

/// Supported package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    /// Windows packages (winget).
    Winget,
    /// Arch Linux packages (pacman).
    Pacman,
    /// Debian and Ubuntu packages (apt).
    Apt,
}

impl PackageManager {
    /// Every supported manager.
    pub const ALL: [Self; 3] = [Self::Winget, Self::Pacman, Self::Apt];

    /// Locator name of this manager.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Winget => "winget",
            Self::Pacman => "pacman",
            Self::Apt => "apt",
        }
    }

    /// Parse a locator name (case-insensitive).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(name))
    }

    /// Program that must be on `PATH` for this manager.
    #[must_use]
    pub const fn program(self) -> &'static str {
        match self {
            Self::Winget => "winget",
            Self::Pacman => "pacman",
            Self::Apt => "apt-mark",
        }
    }

    /// Whether packages install system-wide and need elevation.
    #[must_use]
    pub const fn is_system(self) -> bool {
        matches!(self, Self::Pacman | Self::Apt)
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse explicitly installed packages from the manager's listing.
fn parse_installed(manager: PackageManager, output: &str) -> BTreeSet<String> {
    match manager {
        // `pacman -Qqe` and `apt-mark showmanual` print one name per line.
        PackageManager::Pacman | PackageManager::Apt => output
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect(),
        PackageManager::Winget => parse_winget_table(output),
    }
}

/// Read the `Id` column of a `winget list` table.
///
/// The header gives the column offset. Long names can push an id past the
/// next column boundary, so the id is the first token from the offset on.
/// Rows before the dashed separator are ignored.
fn parse_winget_table(output: &str) -> BTreeSet<String> {
    let mut lines = output.lines();
    let Some(id_start) = lines
        .by_ref()
        .find_map(|line| line.find(" Id ").map(|i| i + 1))
    else {
        return BTreeSet::new();
    };
    lines
        .skip_while(|line| !line.trim_start().starts_with('-'))
        .skip(1)
        .filter_map(|line| {
            let id = line.get(id_start..)?.split_whitespace().next()?;
            Some(id.to_string())
        })
        .collect()
}

/// Captures package lists and installs what is missing. Never uninstalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplicationProvider;

impl ApplicationProvider {
    fn manager(descriptor: &Descriptor) -> Result<PackageManager, ProviderError> {
        PackageManager::from_name(descriptor.locator.root()).ok_or_else(|| {
            ProviderError::read_failed(&descriptor.locator, "unsupported package manager")
        })
    }

    fn installed(
        manager: PackageManager,
        descriptor: &Descriptor,
        ctx: &Context,
    ) -> Result<BTreeSet<String>, ProviderError> {
        let result = match manager {
            PackageManager::Pacman => ctx.executor.run_unchecked("pacman", &["-Qqe"]),
            PackageManager::Apt => ctx.executor.run_unchecked("apt-mark", &["showmanual"]),
            PackageManager::Winget => ctx.executor.run_unchecked(
                "winget",
                &[
                    "list",
                    "--accept-source-agreements",
                    "--disable-interactivity",
                ],
            ),
        }
        .map_err(|e| ProviderError::read_failed(&descriptor.locator, e))?;
        if !result.success {
            return Err(exec_failed(manager.program(), &result));
        }
        Ok(parse_installed(manager, &result.stdout))
    }

    fn install(
        manager: PackageManager,
        packages: &[&str],
        ctx: &Context,
    ) -> Result<(), ProviderError> {
        match manager {
            PackageManager::Pacman => {
                let mut args = vec!["pacman", "-S", "--needed", "--noconfirm"];
                args.extend_from_slice(packages);
                run_checked(ctx, "sudo", &args)
            }
            PackageManager::Apt => {
                let mut args = vec!["apt-get", "install", "-y"];
                args.extend_from_slice(packages);
                run_checked(ctx, "sudo", &args)
            }
            // winget installs one package per invocation.
            PackageManager::Winget => packages.iter().try_for_each(|id| {
                run_checked(
                    ctx,
                    "winget",
                    &[
                        "install",
                        "--id",
                        *id,
                        "--exact",
                        "--source",
                        "winget",
                        "--accept-source-agreements",
                        "--accept-package-agreements",
                    ],
                )
            }),
        }
    }
}

fn run_checked(ctx: &Context, program: &str, args: &[&str]) -> Result<(), ProviderError> {
    let result = ctx
        .executor
        .run_unchecked(program, args)
        .map_err(|e| ProviderError::ExecutionFailed {
            program: program.to_string(),
            exit_code: -1,
            detail: e.to_string(),
        })?;
    if result.success {
        Ok(())
    } else {
        Err(exec_failed(program, &result))
    }
}

fn exec_failed(program: &str, result: &ExecResult) -> ProviderError {
    ProviderError::ExecutionFailed {
        program: program.to_string(),
        exit_code: result.code.unwrap_or(-1),
        detail: result.detail(),
    }
}

fn package_list(state: &LiveState) -> Vec<&str> {
    match state.fields.get(PACKAGES_FIELD) {
        Some(FieldValue::List(items)) => items.iter().map(String::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Recorded packages that are not installed and not excluded.
fn missing_packages<'a>(
    descriptor: &Descriptor,
    desired: &'a LiveState,
    current: Option<&LiveState>,
) -> Vec<&'a str> {
    let installed: BTreeSet<&str> = current
        .map(package_list)
        .unwrap_or_default()
        .into_iter()
        .collect();
    package_list(desired)
        .into_iter()
        .filter(|p| !installed.contains(p))
        .filter(|p| !descriptor.exclude.iter().any(|e| e == p))
        .collect()
}

impl Provider for ApplicationProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Application
    }

    fn read_live(
        &self,
        descriptor: &Descriptor,
        ctx: &Context,
    ) -> Result<Option<LiveState>, ProviderError> {
        let manager = Self::manager(descriptor)?;
        if !ctx.executor.which(manager.program()) {
            ctx.log
                .debug(&format!("{manager} not found on PATH"));
            return Ok(None);
        }
        let packages: Vec<String> = Self::installed(manager, descriptor, ctx)?
            .into_iter()
            .filter(|p| !descriptor.exclude.contains(p))
            .collect();
        Ok(Some(LiveState::from_fields([(
            PACKAGES_FIELD.to_string(),
            FieldValue::List(packages),
        )])))
    }

    fn is_satisfied(
        &self,
        descriptor: &Descriptor,
        desired: &LiveState,
        current: Option<&LiveState>,
    ) -> bool {
        current.is_some() && missing_packages(descriptor, desired, current).is_empty()
    }

    fn write_live(
        &self,
        descriptor: &Descriptor,
        desired: &LiveState,
        current: Option<&LiveState>,
        ctx: &Context,
    ) -> Result<bool, ProviderError> {
        let manager = Self::manager(descriptor)?;
        if current.is_none() {
            return Err(ctx.platform.unsupported(&format!("{manager} package installs")).into());
        }
        let missing = missing_packages(descriptor, desired, current);
        if missing.is_empty() {
            return Ok(false);
        }
        ctx.log.info(&format!(
            "installing {} package(s) with {manager}: {}",
            missing.len(),
            missing.join(" ")
        ));
        Self::install(manager, &missing, ctx)?;
        Ok(false)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::resources::store::StateStore;
    use crate::resources::test_helpers::{MockExecutor, descriptor, make_context_with};
    use crate::resources::ResourceChange;
    use crate::template::FieldType;
    use std::sync::Arc;

    const WINGET_LIST: &str = "\
Name                 Id                     Version      Available Source
---------------------------------------------------------------------------
Git                  Git.Git                2.45.1       2.46.0    winget
Microsoft PowerShell Microsoft.PowerShell   7.4.2.0                winget
Visual Studio Code   Microsoft.VisualStudioCode 1.90.0             winget
";

    fn pacman_descriptor() -> Descriptor {
        descriptor(
            ResourceKind::Application,
            "pacman",
            &[(PACKAGES_FIELD, FieldType::List)],
        )
    }

    // -----------------------------------------------------------------------
    // parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parse_pacman_names() {
        let set = parse_installed(PackageManager::Pacman, "git\nneovim\n\n");
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["git", "neovim"]);
    }

    #[test]
    fn parse_winget_id_column() {
        let set = parse_winget_table(WINGET_LIST);
        assert!(set.contains("Git.Git"));
        assert!(set.contains("Microsoft.PowerShell"));
        assert!(set.contains("Microsoft.VisualStudioCode"));
        assert!(!set.contains("Git"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn parse_winget_without_header_is_empty() {
        assert!(parse_winget_table("No installed package found.").is_empty());
    }

    #[test]
    fn manager_names_are_case_insensitive() {
        assert_eq!(PackageManager::from_name("WinGet"), Some(PackageManager::Winget));
        assert_eq!(PackageManager::from_name("brew"), None);
        assert!(PackageManager::Apt.is_system());
        assert!(!PackageManager::Winget.is_system());
    }

    // -----------------------------------------------------------------------
    // read_live
    // -----------------------------------------------------------------------

    #[test]
    fn manager_missing_from_path_is_absent() {
        let executor = Arc::new(MockExecutor::with_responses(vec![]).with_which(false));
        let (ctx, _log) = make_context_with(executor.clone(), false);
        let live = ApplicationProvider
            .read_live(&pacman_descriptor(), &ctx)
            .unwrap();
        assert!(live.is_none());
        assert_eq!(executor.call_count(), 0);
    }

    #[test]
    fn read_live_applies_exclude() {
        let executor = Arc::new(MockExecutor::ok("git\nlinux\nneovim\n").with_which(true));
        let (ctx, _log) = make_context_with(executor, false);
        let mut desc = pacman_descriptor();
        desc.exclude = vec!["linux".to_string()];
        let live = ApplicationProvider.read_live(&desc, &ctx).unwrap().unwrap();
        assert_eq!(
            live.fields[PACKAGES_FIELD],
            FieldValue::List(vec!["git".into(), "neovim".into()])
        );
    }

    #[test]
    fn listing_failure_is_execution_error() {
        let executor = Arc::new(MockExecutor::fail().with_which(true));
        let (ctx, _log) = make_context_with(executor, false);
        let err = ApplicationProvider
            .read_live(&pacman_descriptor(), &ctx)
            .unwrap_err();
        assert!(matches!(err, ProviderError::ExecutionFailed { .. }));
    }

    // -----------------------------------------------------------------------
    // apply
    // -----------------------------------------------------------------------

    #[test]
    fn apply_installs_only_missing_packages_in_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let desc = pacman_descriptor();

        let capture_exec = Arc::new(MockExecutor::ok("git\nneovim\nripgrep\n").with_which(true));
        let (ctx, _log) = make_context_with(capture_exec, false);
        ApplicationProvider.capture(&desc, &store, &ctx).unwrap();

        let apply_exec = Arc::new(
            MockExecutor::with_responses(vec![
                (true, "git\nhtop\n".to_string()),
                (true, String::new()),
            ])
            .with_which(true),
        );
        let (ctx, _log) = make_context_with(apply_exec.clone(), false);
        let outcome = ApplicationProvider.apply(&desc, &store, &ctx).unwrap();
        assert_eq!(outcome.change, ResourceChange::Applied);
        let calls = apply_exec.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1],
            "sudo pacman -S --needed --noconfirm neovim ripgrep"
        );
    }

    #[test]
    fn extra_installed_packages_are_already_correct() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let desc = pacman_descriptor();

        let (ctx, _log) =
            make_context_with(Arc::new(MockExecutor::ok("git\n").with_which(true)), false);
        ApplicationProvider.capture(&desc, &store, &ctx).unwrap();

        let apply_exec = Arc::new(MockExecutor::ok("git\nhtop\nvim\n").with_which(true));
        let (ctx, _log) = make_context_with(apply_exec.clone(), false);
        let outcome = ApplicationProvider.apply(&desc, &store, &ctx).unwrap();
        assert_eq!(outcome.change, ResourceChange::AlreadyCorrect);
        assert_eq!(apply_exec.call_count(), 1);
    }

    #[test]
    fn failed_install_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let desc = pacman_descriptor();

        let (ctx, _log) =
            make_context_with(Arc::new(MockExecutor::ok("git\nvim\n").with_which(true)), false);
        ApplicationProvider.capture(&desc, &store, &ctx).unwrap();

        let apply_exec = Arc::new(
            MockExecutor::with_responses(vec![(true, "git\n".to_string()), (false, String::new())])
                .with_which(true),
        );
        let (ctx, _log) = make_context_with(apply_exec, false);
        let err = ApplicationProvider.apply(&desc, &store, &ctx).unwrap_err();
        assert!(matches!(err, ProviderError::ExecutionFailed { ref program, .. } if program == "sudo"));
    }

    #[test]
    fn winget_installs_each_package() {
        let executor = Arc::new(
            MockExecutor::with_responses(vec![(true, String::new()), (true, String::new())])
                .with_which(true),
        );
        let (ctx, _log) = make_context_with(executor.clone(), false);
        let desc = descriptor(
            ResourceKind::Application,
            "winget",
            &[(PACKAGES_FIELD, FieldType::List)],
        );
        let desired = LiveState::from_fields([(
            PACKAGES_FIELD.to_string(),
            FieldValue::List(vec!["Git.Git".into(), "Microsoft.PowerShell".into()]),
        )]);
        let current = LiveState::from_fields([(PACKAGES_FIELD.to_string(), FieldValue::List(vec![]))]);
        ApplicationProvider
            .write_live(&desc, &desired, Some(&current), &ctx)
            .unwrap();
        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("winget install --id Git.Git --exact"));
    }
}
