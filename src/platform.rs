//! Host platform detection and machine identity.
use std::fmt;

use crate::error::PlatformError;
use crate::exec::Executor;

/// Detected operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    /// Linux and other Unix-like systems.
    Linux,
    /// Microsoft Windows.
    Windows,
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

/// Platform information for the current system.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system family.
    pub os: Os,
    /// Host name reported to action steps and recorded in snapshots.
    pub machine_name: String,
}

impl Platform {
    /// Detect the current platform.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            os: Self::detect_os(),
            machine_name: machine_name(),
        }
    }

    /// Create a platform with explicit values (for testing).
    #[must_use]
    pub fn new(os: Os, machine_name: impl Into<String>) -> Self {
        Self {
            os,
            machine_name: machine_name.into(),
        }
    }

    /// Whether this is a Linux host.
    #[must_use]
    pub fn is_linux(&self) -> bool {
        self.os == Os::Linux
    }

    /// Whether this is a Windows host.
    #[must_use]
    pub fn is_windows(&self) -> bool {
        self.os == Os::Windows
    }

    /// Build the error for an operation this platform cannot perform.
    #[must_use]
    pub fn unsupported(&self, operation: &str) -> PlatformError {
        PlatformError::Unsupported {
            operation: operation.to_string(),
            platform: self.os.to_string(),
        }
    }

    const fn detect_os() -> Os {
        if cfg!(target_os = "windows") {
            Os::Windows
        } else {
            // Other Unix-like systems behave like Linux for our purposes
            Os::Linux
        }
    }
}

/// Host name of this machine, or `"localhost"` if it cannot be determined.
#[must_use]
pub fn machine_name() -> String {
    ["COMPUTERNAME", "HOSTNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// Name of the user running the process.
#[must_use]
pub fn user_name() -> String {
    ["USERNAME", "USER", "LOGNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Stable identifier of this machine installation.
///
/// Linux reads `/etc/machine-id` (falling back to the D-Bus copy); Windows
/// reads `MachineGuid` from `HKLM\SOFTWARE\Microsoft\Cryptography`.
///
/// # Errors
///
/// Returns [`PlatformError::DetectionFailed`] if no identifier is available.
pub fn machine_id() -> Result<String, PlatformError> {
    #[cfg(windows)]
    {
        use winreg::RegKey;
        use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ};
        let key = RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey_with_flags(r"SOFTWARE\Microsoft\Cryptography", KEY_READ)
            .map_err(|e| PlatformError::DetectionFailed(format!("MachineGuid: {e}")))?;
        key.get_value::<String, _>("MachineGuid")
            .map_err(|e| PlatformError::DetectionFailed(format!("MachineGuid: {e}")))
    }

    #[cfg(not(windows))]
    {
        ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .find_map(|path| {
                std::fs::read_to_string(path)
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            })
            .ok_or_else(|| PlatformError::DetectionFailed("no machine-id file found".to_string()))
    }
}

/// Whether the process runs with administrative rights.
///
/// Windows probes `net session` (which only succeeds elevated); Unix checks
/// for uid 0 via `id -u`. Failure to probe counts as not elevated.
#[must_use]
pub fn is_elevated(executor: &dyn Executor) -> bool {
    if cfg!(windows) {
        executor
            .run_unchecked("net", &["session"])
            .is_ok_and(|r| r.success)
    } else {
        executor
            .run_unchecked("id", &["-u"])
            .is_ok_and(|r| r.success && r.stdout.trim() == "0")
    }
}
