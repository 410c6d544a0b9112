//! On-disk state store: one JSON record per resource plus a snapshot manifest.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::fs::write_atomic;
use super::record::StateRecord;
use crate::locator::ResourceKind;

/// File name of the snapshot manifest.
pub const MANIFEST_FILE: &str = "snapshot.json";

/// Summary of one backup run, written next to its records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Template the snapshot was captured from.
    pub template: String,
    /// Template version.
    pub version: String,
    /// Linearized ancestry, oldest first.
    pub ancestry: Vec<String>,
    /// Machine the snapshot was captured on.
    pub machine: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Record file names written by the run.
    pub records: Vec<String>,
}

/// A directory of state records.
///
/// Records are written complete-or-absent; a crash mid-write leaves the
/// previous record in place.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open a store rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name of the record for `(kind, key)`.
    #[must_use]
    pub fn record_file_name(kind: ResourceKind, key: &str) -> String {
        format!("{kind}-{key}.json")
    }

    /// Path of the record for `(kind, key)`.
    #[must_use]
    pub fn record_path(&self, kind: ResourceKind, key: &str) -> PathBuf {
        self.dir.join(Self::record_file_name(kind, key))
    }

    /// Persist `record`, replacing any earlier capture of the same resource.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Store`] if the record cannot be written.
    pub fn write(&self, record: &StateRecord) -> Result<PathBuf, ProviderError> {
        let path = self.record_path(record.kind, &record.key);
        let json = serde_json::to_vec_pretty(record).map_err(|e| ProviderError::CorruptRecord {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        write_atomic(&path, &json).map_err(|source| store_error(&path, source))?;
        Ok(path)
    }

    /// Read the record for `(kind, key)`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read(&self, kind: ResourceKind, key: &str) -> Result<Option<StateRecord>, ProviderError> {
        let path = self.record_path(kind, key);
        match fs::read(&path) {
            Ok(bytes) => parse_record(&path, &bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(store_error(&path, source)),
        }
    }

    /// Every record in the store, ordered by kind then locator.
    ///
    /// A missing directory is an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or any record cannot be read.
    pub fn list(&self) -> Result<Vec<StateRecord>, ProviderError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(store_error(&self.dir, source)),
        };
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| store_error(&self.dir, source))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == MANIFEST_FILE || !is_record_file_name(&name) {
                continue;
            }
            let bytes = fs::read(&path).map_err(|source| store_error(&path, source))?;
            records.push(parse_record(&path, &bytes)?);
        }
        records.sort_by(|a, b| (a.kind, &a.locator).cmp(&(b.kind, &b.locator)));
        Ok(records)
    }

    /// Write the snapshot manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Store`] if the manifest cannot be written.
    pub fn write_manifest(&self, manifest: &Manifest) -> Result<(), ProviderError> {
        let path = self.dir.join(MANIFEST_FILE);
        let json =
            serde_json::to_vec_pretty(manifest).map_err(|e| ProviderError::CorruptRecord {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        write_atomic(&path, &json).map_err(|source| store_error(&path, source))
    }

    /// Read the snapshot manifest, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be read or parsed.
    pub fn read_manifest(&self) -> Result<Option<Manifest>, ProviderError> {
        let path = self.dir.join(MANIFEST_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ProviderError::CorruptRecord {
                    path: path.display().to_string(),
                    message: e.to_string(),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(store_error(&path, source)),
        }
    }
}

fn is_record_file_name(name: &str) -> bool {
    name.strip_suffix(".json").is_some_and(|stem| {
        ResourceKind::ALL
            .iter()
            .any(|kind| stem.strip_prefix(kind.as_str()).is_some_and(|rest| rest.starts_with('-')))
    })
}

fn parse_record(path: &Path, bytes: &[u8]) -> Result<StateRecord, ProviderError> {
    serde_json::from_slice(bytes).map_err(|e| ProviderError::CorruptRecord {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn store_error(path: &Path, source: io::Error) -> ProviderError {
    ProviderError::Store {
        path: path.display().to_string(),
        source,
    }
}
