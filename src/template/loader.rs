//! Fetch, validate and resolve templates by name.
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::inheritance::resolve;
use super::schema::SchemaValidator;
use super::{ResolvedTemplate, TemplateDocument};
use crate::error::TemplateError;
use crate::locator::Normalizer;

/// Serialization format of a template document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// TOML (the primary format).
    Toml,
    /// JSON.
    Json,
    /// YAML.
    Yaml,
}

impl Format {
    /// File extensions probed by [`DirectorySource`], in priority order.
    pub const EXTENSIONS: [(&'static str, Self); 4] = [
        ("toml", Self::Toml),
        ("json", Self::Json),
        ("yaml", Self::Yaml),
        ("yml", Self::Yaml),
    ];

    /// Format for a file extension.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::EXTENSIONS
            .iter()
            .find(|(e, _)| e.eq_ignore_ascii_case(ext))
            .map(|(_, f)| *f)
    }

    /// Parse `text` into an untyped document.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Parse`] on a syntax error.
    pub fn parse(self, origin: &str, text: &str) -> Result<Value, TemplateError> {
        let parse_error = |message: String| TemplateError::Parse {
            path: origin.to_string(),
            message,
        };
        match self {
            Self::Toml => toml::from_str(text).map_err(|e| parse_error(e.to_string())),
            Self::Json => serde_json::from_str(text).map_err(|e| parse_error(e.to_string())),
            Self::Yaml => serde_yaml::from_str(text).map_err(|e| parse_error(e.to_string())),
        }
    }
}

/// A fetched, parsed, not yet validated document.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    /// Where it came from (a path, or `memory:<name>`).
    pub origin: String,
    /// Untyped content.
    pub value: Value,
}

/// Where template documents come from.
pub trait TemplateSource: fmt::Debug {
    /// Fetch and parse the document named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::NotFound`] if no such document exists, or an
    /// I/O or parse error.
    fn fetch(&self, name: &str) -> Result<RawDocument, TemplateError>;

    /// Names of every available document, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be enumerated.
    fn names(&self) -> Result<Vec<String>, TemplateError>;
}

/// Reads `<root>/<name>.{toml,json,yaml,yml}`, first match wins.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Create a source rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory searched for documents.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TemplateSource for DirectorySource {
    fn fetch(&self, name: &str) -> Result<RawDocument, TemplateError> {
        for (ext, format) in Format::EXTENSIONS {
            let path = self.root.join(format!("{name}.{ext}"));
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    let origin = path.display().to_string();
                    let value = format.parse(&origin, &text)?;
                    return Ok(RawDocument { origin, value });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(TemplateError::Io {
                        path: path.display().to_string(),
                        source,
                    });
                }
            }
        }
        Err(TemplateError::NotFound {
            name: name.to_string(),
        })
    }

    fn names(&self) -> Result<Vec<String>, TemplateError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| TemplateError::Io {
            path: self.root.display().to_string(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .and_then(Format::from_extension)
                    .is_some()
            })
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .filter(|name| valid_name(name))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Documents held in memory, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    docs: BTreeMap<String, (Format, String)>,
}

impl MemorySource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document in `format`.
    #[must_use]
    pub fn with(mut self, name: &str, format: Format, text: &str) -> Self {
        self.docs
            .insert(name.to_string(), (format, text.to_string()));
        self
    }

    /// Add a TOML document.
    #[must_use]
    pub fn with_toml(self, name: &str, text: &str) -> Self {
        self.with(name, Format::Toml, text)
    }
}

impl TemplateSource for MemorySource {
    fn fetch(&self, name: &str) -> Result<RawDocument, TemplateError> {
        let (format, text) = self.docs.get(name).ok_or_else(|| TemplateError::NotFound {
            name: name.to_string(),
        })?;
        let origin = format!("memory:{name}");
        let value = format.parse(&origin, text)?;
        Ok(RawDocument { origin, value })
    }

    fn names(&self) -> Result<Vec<String>, TemplateError> {
        Ok(self.docs.keys().cloned().collect())
    }
}

/// Whether `name` can name a template document.
#[must_use]
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Fetch one document, validate it, and deserialize it.
///
/// # Errors
///
/// Returns [`TemplateError::Load`] carrying every validation problem, or the
/// fetch error.
pub fn load_document(
    name: &str,
    source: &dyn TemplateSource,
    normalizer: &Normalizer,
) -> Result<TemplateDocument, TemplateError> {
    if !valid_name(name) {
        return Err(TemplateError::InvalidName {
            name: name.to_string(),
        });
    }
    let raw = source.fetch(name)?;
    let errors = SchemaValidator::new(normalizer).validate(&raw.value);
    if !errors.is_empty() {
        return Err(TemplateError::Load {
            name: name.to_string(),
            errors,
        });
    }
    serde_json::from_value(raw.value).map_err(|e| TemplateError::Parse {
        path: raw.origin,
        message: e.to_string(),
    })
}

/// Load `name` and resolve its full inheritance chain.
///
/// Ancestors are fetched and validated lazily as the chain is walked. There
/// is no partial success: any failure anywhere in the chain is returned.
///
/// # Errors
///
/// Returns a [`TemplateError`] describing the first failure.
pub fn load_template(
    name: &str,
    source: &dyn TemplateSource,
    normalizer: &Normalizer,
) -> Result<ResolvedTemplate, TemplateError> {
    let root = load_document(name, source, normalizer)?;
    let mut lookup = |parent: &str| load_document(parent, source, normalizer);
    let resolved = resolve(name, root, &mut lookup, normalizer)?;
    tracing::debug!(
        "resolved template '{}' ({} resources, ancestry: {})",
        resolved.name,
        resolved.len(),
        resolved.ancestry.join(" -> ")
    );
    Ok(resolved)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::locator::ResourceKind;

    const BASE: &str = r#"
        [metadata]
        name = "base"
        version = "1.0"

        [[resources.file]]
        locator = "/etc/hosts"
    "#;

    #[test]
    fn loads_and_resolves_from_memory() {
        let source = MemorySource::new().with_toml("base", BASE).with(
            "laptop",
            Format::Json,
            r#"{ "metadata": { "name": "laptop", "extends": "base" },
                 "resources": { "application": [ { "locator": "apt" } ] } }"#,
        );
        let resolved = load_template("laptop", &source, &Normalizer::default()).unwrap();
        assert_eq!(resolved.ancestry, vec!["base", "laptop"]);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved.descriptors(ResourceKind::Application).len(), 1);
    }

    #[test]
    fn yaml_documents_are_supported() {
        let source = MemorySource::new().with(
            "y",
            Format::Yaml,
            "metadata:\n  name: y\nresources:\n  scheduled_task:\n    - locator: '\\Backup\\Nightly'\n",
        );
        let resolved = load_template("y", &source, &Normalizer::default()).unwrap();
        assert_eq!(resolved.descriptors(ResourceKind::ScheduledTask).len(), 1);
    }

    #[test]
    fn child_may_override_registry_policy_only() {
        let source = MemorySource::new()
            .with_toml(
                "base",
                "[metadata]\nname = \"base\"\n\n[[resources.registry]]\nlocator = 'HKCU\\Software\\X'\nfields = { Theme = \"string\" }\n",
            )
            .with_toml(
                "child",
                "[metadata]\nname = \"child\"\nextends = \"base\"\n\n[[resources.registry]]\nlocator = 'HKCU\\Software\\X'\npolicy = { required = true }\n",
            );
        let resolved = load_template("child", &source, &Normalizer::default()).unwrap();
        let key = &resolved.descriptors(ResourceKind::Registry)[0];
        assert!(key.policy.required);
        assert!(key.fields.contains_key("Theme"));
    }

    #[test]
    fn invalid_ancestor_fails_the_whole_load() {
        let source = MemorySource::new()
            .with_toml("base", "[metadata]\nname = \"\"\n")
            .with_toml("child", "[metadata]\nname = \"child\"\nextends = \"base\"\n");
        match load_template("child", &source, &Normalizer::default()) {
            Err(TemplateError::Load { name, errors }) => {
                assert_eq!(name, "base");
                assert_eq!(errors[0].path, "metadata.name");
            }
            other => panic!("expected load error, got {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_are_parse_errors() {
        let source = MemorySource::new().with_toml("bad", "[metadata\nname = ");
        assert!(matches!(
            load_template("bad", &source, &Normalizer::default()),
            Err(TemplateError::Parse { .. })
        ));
    }

    #[test]
    fn names_with_path_characters_are_rejected() {
        let source = MemorySource::new();
        for name in ["../etc/passwd", "a/b", "", ".hidden"] {
            assert!(matches!(
                load_template(name, &source, &Normalizer::default()),
                Err(TemplateError::InvalidName { .. })
            ));
        }
    }

    #[test]
    fn directory_source_prefers_toml_and_lists_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.toml"), BASE).unwrap();
        std::fs::write(
            dir.path().join("base.json"),
            r#"{ "metadata": { "name": "wrong" } }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let source = DirectorySource::new(dir.path());
        let doc = load_document("base", &source, &Normalizer::default()).unwrap();
        assert_eq!(doc.metadata.name, "base");
        assert_eq!(source.names().unwrap(), vec!["base"]);
    }

    #[test]
    fn directory_source_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path());
        assert!(matches!(
            source.fetch("nope"),
            Err(TemplateError::NotFound { name }) if name == "nope"
        ));
    }
}
