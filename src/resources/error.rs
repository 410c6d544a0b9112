//! Typed error variants for provider capture and apply operations.
//!
//! This module provides [`ProviderError`]. The executor records these per
//! resource; only a `required` descriptor turns one into a hard failure.

use thiserror::Error;

use crate::error::{CryptoError, PlatformError};
use crate::locator::ResourceKind;
use crate::template::FieldType;

/// Errors that arise while capturing or applying one resource.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The live resource does not exist and the descriptor is required.
    #[error("required {kind} resource '{locator}' does not exist")]
    ResourceMissing {
        /// Resource kind.
        kind: ResourceKind,
        /// Canonical locator.
        locator: String,
    },

    /// No state record exists for a required descriptor.
    #[error("no captured state for required {kind} resource '{locator}'")]
    RecordNotFound {
        /// Resource kind.
        kind: ResourceKind,
        /// Canonical locator.
        locator: String,
    },

    /// One or more sealed fields could not be opened.
    #[error(
        "cannot decrypt field(s) {} of '{locator}': {}",
        .failures.iter().map(|(f, _)| f.as_str()).collect::<Vec<_>>().join(", "),
        .failures.first().map_or_else(String::new, |(_, e)| e.to_string())
    )]
    Decryption {
        /// Canonical locator.
        locator: String,
        /// Each failing field with its error.
        failures: Vec<(String, CryptoError)>,
    },

    /// Writing the desired state failed; nothing was left half-applied.
    #[error("failed to apply '{locator}': {reason}")]
    ApplyFailed {
        /// Canonical locator.
        locator: String,
        /// Underlying failure.
        reason: String,
    },

    /// Reading the live state failed.
    #[error("failed to read '{locator}': {reason}")]
    ReadFailed {
        /// Canonical locator.
        locator: String,
        /// Underlying failure.
        reason: String,
    },

    /// A live or recorded value does not have the declared type.
    #[error("field '{field}' of '{locator}' is {found}, expected {expected}")]
    FieldType {
        /// Canonical locator.
        locator: String,
        /// Field name.
        field: String,
        /// Declared type.
        expected: FieldType,
        /// Type actually found.
        found: FieldType,
    },

    /// A command invoked by a provider failed with a non-zero exit code.
    #[error("command '{program}' failed (exit {exit_code}): {detail}")]
    ExecutionFailed {
        /// Name of the program that was invoked.
        program: String,
        /// Exit code returned by the process.
        exit_code: i32,
        /// Captured output.
        detail: String,
    },

    /// State store I/O failed.
    #[error("state store error at {path}: {source}")]
    Store {
        /// Record or manifest path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A state record exists but cannot be parsed.
    #[error("corrupt state record {path}: {message}")]
    CorruptRecord {
        /// Record path.
        path: String,
        /// Parser diagnostic.
        message: String,
    },

    /// Sealing a field failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The provider cannot work on this platform.
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl ProviderError {
    /// Build an [`ApplyFailed`](Self::ApplyFailed) error.
    #[must_use]
    pub fn apply_failed(locator: impl ToString, reason: impl ToString) -> Self {
        Self::ApplyFailed {
            locator: locator.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a [`ReadFailed`](Self::ReadFailed) error.
    #[must_use]
    pub fn read_failed(locator: impl ToString, reason: impl ToString) -> Self {
        Self::ReadFailed {
            locator: locator.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn resource_missing_display() {
        let e = ProviderError::ResourceMissing {
            kind: ResourceKind::File,
            locator: "/etc/hosts".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "required file resource '/etc/hosts' does not exist"
        );
    }

    #[test]
    fn decryption_lists_every_failing_field() {
        let e = ProviderError::Decryption {
            locator: r"HKCU\Software\App".to_string(),
            failures: vec![
                (
                    "Token".to_string(),
                    CryptoError::Decryption("authentication failed".to_string()),
                ),
                (
                    "Secret".to_string(),
                    CryptoError::Decryption("authentication failed".to_string()),
                ),
            ],
        };
        let shown = e.to_string();
        assert!(shown.contains("Token, Secret"));
        assert!(shown.contains("authentication failed"));
    }

    #[test]
    fn execution_failed_display() {
        let e = ProviderError::ExecutionFailed {
            program: "schtasks".to_string(),
            exit_code: 1,
            detail: "access denied".to_string(),
        };
        assert!(e.to_string().contains("schtasks"));
        assert!(e.to_string().contains("exit 1"));
    }

    #[test]
    fn crypto_error_is_transparent() {
        let e: ProviderError = CryptoError::Encryption("boom".to_string()).into();
        assert_eq!(e.to_string(), "encryption failed: boom");
    }

    #[test]
    fn provider_error_converts_to_anyhow() {
        let e = ProviderError::apply_failed("/etc/hosts", "read-only filesystem");
        let _anyhow_err: anyhow::Error = e.into();
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn provider_error_is_send_sync() {
        assert_send_sync::<ProviderError>();
    }
}
