//! Domain-specific error types for the state engine.
//!
//! Internal modules return typed errors built with [`thiserror`]; command
//! handlers at the CLI boundary convert them to [`anyhow::Error`] via `?`.
//!
//! # Error hierarchy
//!
//! ```text
//! SnapstateError
//! ├── Locator(LocatorError): address normalization
//! ├── Crypto(CryptoError): key derivation, protect/unprotect
//! ├── Template(TemplateError): loading, validation, inheritance
//! ├── Provider(ProviderError): capture/apply of one resource
//! ├── Execution(ExecutionError): load failure or required abort of a run
//! └── Platform(PlatformError): OS-specific operation failures
//! ```

use thiserror::Error;

pub use crate::engine::ExecutionError;
pub use crate::resources::error::ProviderError;
use crate::template::schema::ValidationError;

/// Top-level error type for the state engine.
#[derive(Error, Debug)]
pub enum SnapstateError {
    /// A resource address could not be normalized.
    #[error("Locator error: {0}")]
    Locator(#[from] LocatorError),

    /// Key derivation or field encryption failed.
    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),

    /// A template could not be loaded, validated or resolved.
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// A provider failed to capture or apply a resource.
    #[error("Resource error: {0}")]
    Provider(#[from] ProviderError),

    /// A run failed to load its template or hit a required failure.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Platform-specific operation error.
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

/// Raised when a raw resource address is empty or malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid locator '{raw}': {reason}")]
pub struct LocatorError {
    /// The address as written in the template.
    pub raw: String,
    /// Why it could not be normalized.
    pub reason: String,
}

impl LocatorError {
    /// Build a locator error for `raw`.
    #[must_use]
    pub fn new(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the encryption service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material could not be derived from the configured source.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Plaintext could not be sealed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Input is not ciphertext produced by this key.
    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Errors that arise from loading, validating and resolving templates.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// No document exists for the requested name.
    #[error("template '{name}' not found")]
    NotFound {
        /// Requested template name.
        name: String,
    },

    /// The template name contains characters that cannot name a document.
    #[error("invalid template name '{name}'")]
    InvalidName {
        /// Requested template name.
        name: String,
    },

    /// The template document could not be read.
    #[error("IO error reading template {path}: {source}")]
    Io {
        /// Path of the document.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The document is not syntactically valid TOML, JSON or YAML.
    #[error("cannot parse template {path}: {message}")]
    Parse {
        /// Path of the document.
        path: String,
        /// Parser diagnostic.
        message: String,
    },

    /// The document failed schema validation.
    #[error("template '{name}' failed validation with {} error(s)", .errors.len())]
    Load {
        /// Name of the template that failed.
        name: String,
        /// Every problem found in the unmerged document.
        errors: Vec<ValidationError>,
    },

    /// A template appears in its own ancestor chain.
    #[error("cyclic inheritance: {}", .chain.join(" -> "))]
    CyclicInheritance {
        /// The chain, starting and ending with the repeated name.
        chain: Vec<String>,
    },

    /// A locator could not be normalized while building descriptors.
    #[error("template '{name}': {source}")]
    Locator {
        /// Template that declared the locator.
        name: String,
        /// Normalization failure.
        source: LocatorError,
    },
}

/// Errors that arise from platform-specific operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The requested operation is not supported on the current platform.
    #[error("{operation} is not supported on {platform}")]
    Unsupported {
        /// What was attempted (e.g., `"registry access"`).
        operation: String,
        /// Name of the platform (e.g., `"linux"`).
        platform: String,
    },

    /// Platform detection failed (e.g., unknown OS or missing system info).
    #[error("Platform detection failed: {0}")]
    DetectionFailed(String),
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn locator_error_display() {
        let e = LocatorError::new("", "address is empty");
        assert_eq!(e.to_string(), "invalid locator '': address is empty");
    }

    #[test]
    fn crypto_error_display() {
        let e = CryptoError::Decryption("authentication tag mismatch".to_string());
        assert_eq!(
            e.to_string(),
            "decryption failed: authentication tag mismatch"
        );
    }

    #[test]
    fn template_load_error_counts_validation_errors() {
        let e = TemplateError::Load {
            name: "workstation".to_string(),
            errors: vec![
                ValidationError::new("metadata.name", "missing"),
                ValidationError::new("resources.file[0].locator", "empty"),
            ],
        };
        assert_eq!(
            e.to_string(),
            "template 'workstation' failed validation with 2 error(s)"
        );
    }

    #[test]
    fn cyclic_inheritance_display_shows_chain() {
        let e = TemplateError::CyclicInheritance {
            chain: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(e.to_string(), "cyclic inheritance: a -> b -> a");
    }

    #[test]
    fn template_io_error_has_source() {
        use std::error::Error as StdError;
        let e = TemplateError::Io {
            path: "/templates/base.toml".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
        };
        assert!(e.source().is_some());
        assert!(e.to_string().contains("/templates/base.toml"));
    }

    #[test]
    fn platform_error_unsupported_display() {
        let e = PlatformError::Unsupported {
            operation: "registry access".to_string(),
            platform: "linux".to_string(),
        };
        assert_eq!(e.to_string(), "registry access is not supported on linux");
    }

    #[test]
    fn snapstate_error_from_template_error() {
        let e: SnapstateError = TemplateError::NotFound {
            name: "base".to_string(),
        }
        .into();
        assert!(e.to_string().starts_with("Template error"));
    }

    #[test]
    fn snapstate_error_from_crypto_error() {
        let e: SnapstateError = CryptoError::KeyDerivation("bad salt".to_string()).into();
        assert!(e.to_string().contains("bad salt"));
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn all_error_types_are_send_sync() {
        assert_send_sync::<SnapstateError>();
        assert_send_sync::<LocatorError>();
        assert_send_sync::<CryptoError>();
        assert_send_sync::<TemplateError>();
        assert_send_sync::<PlatformError>();
    }

    #[test]
    fn template_error_converts_to_anyhow() {
        let e = TemplateError::NotFound {
            name: "x".to_string(),
        };
        let _anyhow_err: anyhow::Error = e.into();
    }
}
