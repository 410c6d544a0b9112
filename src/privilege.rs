//! Static privilege analysis of a resolved template.
//!
//! Classification looks only at locators, so it is pure and repeatable: the
//! same template always yields the same [`PrivilegeRequirement`].
use std::collections::BTreeSet;

use serde::Serialize;

use crate::locator::{Locator, ResourceKind};
use crate::resources::application::PackageManager;
use crate::template::ResolvedTemplate;

/// Registry hives whose keys are shared by every user.
const MACHINE_HIVES: [&str; 4] = ["HKLM", "HKCR", "HKU", "HKCC"];

/// Top-level POSIX directories owned by root.
const POSIX_PROTECTED: [&[&str]; 7] = [
    &["etc"],
    &["usr"],
    &["boot"],
    &["opt"],
    &["var", "lib"],
    &["bin"],
    &["sbin"],
];

/// Directories directly under a drive root that need elevation.
const WINDOWS_PROTECTED: [&str; 4] = [
    "Windows",
    "Program Files",
    "Program Files (x86)",
    "ProgramData",
];

/// Variables that expand to one of [`WINDOWS_PROTECTED`].
const WINDOWS_PROTECTED_VARS: [&str; 6] = [
    "%WINDIR%",
    "%SYSTEMROOT%",
    "%PROGRAMFILES%",
    "%PROGRAMFILES(X86)%",
    "%PROGRAMDATA%",
    "%ALLUSERSPROFILE%",
];

/// Task folder holding operating-system tasks.
const SYSTEM_TASK_FOLDER: &str = "Microsoft";

/// What a template needs from the account running it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrivilegeRequirement {
    /// Whether any resource needs an elevated account.
    pub requires_admin: bool,
    /// Why: one entry per distinct protected area touched.
    pub access_classes: BTreeSet<String>,
}

/// Classify every descriptor of `template`.
#[must_use]
pub fn analyze(template: &ResolvedTemplate) -> PrivilegeRequirement {
    let access_classes: BTreeSet<String> = template
        .iter()
        .filter_map(|descriptor| access_class(&descriptor.locator))
        .collect();
    PrivilegeRequirement {
        requires_admin: !access_classes.is_empty(),
        access_classes,
    }
}

/// The protected area `locator` falls in, if any.
#[must_use]
pub fn access_class(locator: &Locator) -> Option<String> {
    match locator.kind() {
        ResourceKind::Registry => MACHINE_HIVES
            .contains(&locator.root())
            .then(|| locator.root().to_string()),
        ResourceKind::File => protected_root(locator).map(|root| format!("protected-root:{root}")),
        ResourceKind::Application => PackageManager::from_name(locator.root())
            .filter(|pm| pm.is_system())
            .map(|pm| format!("package-manager:{pm}")),
        ResourceKind::ScheduledTask => locator
            .segments()
            .first()
            .filter(|folder| {
                locator.segments().len() > 1 && folder.eq_ignore_ascii_case(SYSTEM_TASK_FOLDER)
            })
            .map(|_| "system-tasks".to_string()),
    }
}

fn protected_root(locator: &Locator) -> Option<String> {
    let segments = locator.segments();
    let (root, rest) = segments.split_first()?;
    if root == "/" {
        return POSIX_PROTECTED
            .iter()
            .find(|prefix| {
                rest.len() >= prefix.len()
                    && rest.iter().zip(prefix.iter()).all(|(a, b)| a.as_str() == *b)
            })
            .map(|prefix| format!("/{}", prefix.join("/")));
    }
    if WINDOWS_PROTECTED_VARS.contains(&root.as_str()) {
        return Some(root.clone());
    }
    let is_drive = root.len() == 2 && root.ends_with(':');
    let first = rest.first()?;
    WINDOWS_PROTECTED
        .iter()
        .find(|dir| is_drive && first.eq_ignore_ascii_case(dir))
        .map(|dir| format!(r"{root}\{dir}"))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::locator::{Normalizer, normalize};
    use crate::template::{MemorySource, load_template};

    fn class(raw: &str, kind: ResourceKind) -> Option<String> {
        access_class(&normalize(raw, kind).unwrap())
    }

    #[test]
    fn machine_hives_need_admin() {
        assert_eq!(
            class(r"HKEY_LOCAL_MACHINE\Software\Vendor", ResourceKind::Registry),
            Some("HKLM".to_string())
        );
        assert_eq!(
            class(r"HKU\.DEFAULT\Control Panel", ResourceKind::Registry),
            Some("HKU".to_string())
        );
        assert_eq!(class(r"HKCU\Software\Vendor", ResourceKind::Registry), None);
    }

    #[test]
    fn posix_protected_roots() {
        assert_eq!(
            class("/etc/ssh/sshd_config", ResourceKind::File),
            Some("protected-root:/etc".to_string())
        );
        assert_eq!(
            class("/var/lib/app/state", ResourceKind::File),
            Some("protected-root:/var/lib".to_string())
        );
        assert_eq!(class("/var/log/app.log", ResourceKind::File), None);
        assert_eq!(class("~/.bashrc", ResourceKind::File), None);
    }

    #[test]
    fn windows_protected_roots_ignore_case() {
        assert_eq!(
            class(r"c:\windows\system32\drivers\etc\hosts", ResourceKind::File),
            Some(r"protected-root:C:\Windows".to_string())
        );
        assert_eq!(
            class(r"%ProgramData%\Vendor\config.ini", ResourceKind::File),
            Some("protected-root:%PROGRAMDATA%".to_string())
        );
        assert_eq!(class(r"C:\Users\me\notes.txt", ResourceKind::File), None);
    }

    #[test]
    fn system_package_managers_and_tasks() {
        assert_eq!(
            class("pacman", ResourceKind::Application),
            Some("package-manager:pacman".to_string())
        );
        assert_eq!(class("winget", ResourceKind::Application), None);
        assert_eq!(
            class(r"\Microsoft\Windows\Defrag\ScheduledDefrag", ResourceKind::ScheduledTask),
            Some("system-tasks".to_string())
        );
        assert_eq!(class(r"\Backup\Nightly", ResourceKind::ScheduledTask), None);
    }

    #[test]
    fn analyze_collects_distinct_classes() {
        let source = MemorySource::new().with_toml(
            "mixed",
            r#"
            [metadata]
            name = "mixed"

            [[resources.registry]]
            locator = 'HKLM\Software\A'
            fields = { X = "string" }

            [[resources.registry]]
            locator = 'HKLM\Software\B'
            fields = { Y = "string" }

            [[resources.registry]]
            locator = 'HKCU\Software\C'
            fields = { Z = "string" }
            "#,
        );
        let template = load_template("mixed", &source, &Normalizer::default()).unwrap();
        let req = analyze(&template);
        assert!(req.requires_admin);
        assert_eq!(req.access_classes.len(), 1);
        assert!(req.access_classes.contains("HKLM"));
        assert_eq!(analyze(&template), req);
    }

    #[test]
    fn user_only_template_needs_nothing() {
        let source = MemorySource::new().with_toml(
            "user",
            "[metadata]\nname = \"user\"\n\n[[resources.registry]]\nlocator = 'HKCU\\Software\\App'\nfields = { Theme = \"string\" }\n",
        );
        let template = load_template("user", &source, &Normalizer::default()).unwrap();
        assert_eq!(analyze(&template), PrivilegeRequirement::default());
    }
}
