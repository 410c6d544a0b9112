//! TOML file loading with defaults for missing files.
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Load and deserialize a TOML file.
///
/// A missing file deserializes from an empty document, so every field falls
/// back to its serde default.
///
/// # Type Parameters
///
/// - `T`: Target type to deserialize into (must implement `DeserializeOwned`)
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return toml::from_str("").context("Failed to create empty config");
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Failed to parse TOML config: {}", path.display()))
}

/// Deserialize TOML text.
///
/// # Errors
///
/// Returns the parser diagnostic if `content` is not valid for `T`.
pub fn parse_config<T: DeserializeOwned>(content: &str) -> Result<T> {
    Ok(toml::from_str(content)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq, Eq)]
    #[serde(default)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let sample: Sample = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(sample, Sample::default());
    }

    #[test]
    fn reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.toml");
        std::fs::write(&path, "name = \"x\"\ncount = 3\n").unwrap();
        let sample: Sample = load_config(&path).unwrap();
        assert_eq!(sample.count, 3);
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "count = \"many\"").unwrap();
        let err = load_config::<Sample>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.toml"));
    }
}
