//! Versioned, inheritable templates describing what to capture.
//!
//! A template document is loaded in three passes:
//!
//! 1. [`schema`] validates the raw, untyped document and reports every
//!    problem with a document path.
//! 2. The validated document is deserialized into [`TemplateDocument`].
//! 3. [`inheritance`] linearizes the `extends` chain and merges descriptors
//!    by locator into a [`ResolvedTemplate`].
//!
//! [`loader`] ties the passes together behind a [`loader::TemplateSource`].
pub mod inheritance;
pub mod loader;
pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::locator::{Locator, ResourceKind};

pub use loader::{DirectorySource, MemorySource, TemplateSource, load_template};

/// Primitive type of a captured field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// UTF-8 text.
    String,
    /// Signed 64-bit integer.
    Integer,
    /// `true` / `false`.
    Boolean,
    /// Arbitrary bytes.
    Binary,
    /// Ordered list of strings.
    List,
}

impl FieldType {
    /// All field types, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::String,
        Self::Integer,
        Self::Boolean,
        Self::Binary,
        Self::List,
    ];

    /// Name used in template documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Binary => "binary",
            Self::List => "list",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown field type '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Document form (one file, before inheritance)
// ---------------------------------------------------------------------------

/// One template document as written on disk.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateDocument {
    /// Identity and ancestry.
    pub metadata: Metadata,
    /// Descriptors grouped by kind.
    #[serde(default)]
    pub resources: ResourceSections,
}

/// The `metadata` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    /// Template identity.
    pub name: String,
    /// Free-form version, written as a string or an integer.
    #[serde(default, deserialize_with = "string_or_integer")]
    pub version: String,
    /// Optional human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parent templates, applied in declaration order.
    #[serde(default, deserialize_with = "one_or_many")]
    pub extends: Vec<String>,
}

/// The `resources` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSections {
    /// File descriptors.
    #[serde(default)]
    pub file: Vec<DescriptorDoc>,
    /// Registry key descriptors.
    #[serde(default)]
    pub registry: Vec<DescriptorDoc>,
    /// Application inventory descriptors.
    #[serde(default)]
    pub application: Vec<DescriptorDoc>,
    /// Scheduled task descriptors.
    #[serde(default)]
    pub scheduled_task: Vec<DescriptorDoc>,
}

impl ResourceSections {
    /// Descriptors declared for `kind`.
    #[must_use]
    pub fn of(&self, kind: ResourceKind) -> &[DescriptorDoc] {
        match kind {
            ResourceKind::File => &self.file,
            ResourceKind::Registry => &self.registry,
            ResourceKind::Application => &self.application,
            ResourceKind::ScheduledTask => &self.scheduled_task,
        }
    }
}

/// A descriptor as written in one document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptorDoc {
    /// Raw address, normalized during resolution.
    pub locator: String,
    /// Declared fields.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    /// Policy flags this document sets.
    #[serde(default)]
    pub policy: PolicyDoc,
    /// Entries the provider ignores; replaces any inherited list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
}

/// Field declaration: a bare type name or a table with per-field options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FieldSpec {
    /// `content = "binary"`
    Bare(FieldType),
    /// `secret = { type = "string", encrypt = true }`
    Detailed {
        /// Declared type.
        #[serde(rename = "type")]
        ty: FieldType,
        /// Seal this field even when the descriptor policy does not; unset
        /// inherits.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypt: Option<bool>,
    },
}

impl FieldSpec {
    /// Declared type.
    #[must_use]
    pub const fn ty(self) -> FieldType {
        match self {
            Self::Bare(ty) | Self::Detailed { ty, .. } => ty,
        }
    }

    /// Encryption flag as written, `None` when the spec leaves it unset.
    #[must_use]
    pub const fn encrypt(self) -> Option<bool> {
        match self {
            Self::Bare(_) => None,
            Self::Detailed { encrypt, .. } => encrypt,
        }
    }

    /// Overlay `later` onto `self`: the later type wins, and `encrypt`
    /// survives unless `later` sets it.
    #[must_use]
    pub const fn merge(self, later: Self) -> Self {
        let encrypt = match later.encrypt() {
            Some(flag) => Some(flag),
            None => self.encrypt(),
        };
        Self::Detailed {
            ty: later.ty(),
            encrypt,
        }
    }

    /// Resolved declaration.
    #[must_use]
    pub const fn decl(self) -> FieldDecl {
        FieldDecl {
            ty: self.ty(),
            encrypt: matches!(self.encrypt(), Some(true)),
        }
    }
}

/// Policy flags as written; unset flags inherit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDoc {
    /// Seal every field of the descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<bool>,
    /// Record and restore attributes (read-only flag, modification time).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_attributes: Option<bool>,
    /// Record and restore permissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_permissions: Option<bool>,
    /// Record and restore link targets instead of following links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_links: Option<bool>,
    /// A failure on this descriptor aborts the whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl PolicyDoc {
    /// Overlay the flags `later` sets onto `self`.
    pub fn merge(&mut self, later: &Self) {
        fn overlay(slot: &mut Option<bool>, value: Option<bool>) {
            if value.is_some() {
                *slot = value;
            }
        }
        overlay(&mut self.encrypt, later.encrypt);
        overlay(&mut self.preserve_attributes, later.preserve_attributes);
        overlay(&mut self.preserve_permissions, later.preserve_permissions);
        overlay(&mut self.preserve_links, later.preserve_links);
        overlay(&mut self.required, later.required);
    }

    /// Effective policy, with unset flags off.
    #[must_use]
    pub fn resolve(self) -> Policy {
        Policy {
            encrypt: self.encrypt.unwrap_or(false),
            preserve_attributes: self.preserve_attributes.unwrap_or(false),
            preserve_permissions: self.preserve_permissions.unwrap_or(false),
            preserve_links: self.preserve_links.unwrap_or(false),
            required: self.required.unwrap_or(false),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInteger {
    Text(String),
    Integer(i64),
}

fn string_or_integer<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match StringOrInteger::deserialize(deserializer)? {
        StringOrInteger::Text(s) => s,
        StringOrInteger::Integer(n) => n.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

// ---------------------------------------------------------------------------
// Resolved form
// ---------------------------------------------------------------------------

/// A field declaration after inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldDecl {
    /// Declared type.
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Field-level encryption flag.
    pub encrypt: bool,
}

/// Effective policy of a resolved descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Policy {
    /// Seal every field.
    pub encrypt: bool,
    /// Record and restore attributes.
    pub preserve_attributes: bool,
    /// Record and restore permissions.
    pub preserve_permissions: bool,
    /// Record and restore link targets.
    pub preserve_links: bool,
    /// Failure aborts the run.
    pub required: bool,
}

/// What to capture for one resource, after inheritance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Normalized address (carries the kind).
    pub locator: Locator,
    /// Address as first written in the template chain.
    pub raw_locator: String,
    /// Declared fields by name.
    pub fields: BTreeMap<String, FieldDecl>,
    /// Effective policy.
    pub policy: Policy,
    /// Entries the provider ignores.
    pub exclude: Vec<String>,
}

impl Descriptor {
    /// Resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.locator.kind()
    }

    /// Whether `field` is stored sealed.
    #[must_use]
    pub fn encrypts(&self, field: &str) -> bool {
        self.policy.encrypt || self.fields.get(field).is_some_and(|f| f.encrypt)
    }
}

/// A template with its full ancestry merged in.
///
/// Never persisted: every load re-resolves against the current bases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTemplate {
    /// Name of the requested template.
    pub name: String,
    /// Version of the requested template.
    pub version: String,
    /// Linearized ancestors, oldest first, ending with `name`.
    pub ancestry: Vec<String>,
    /// Descriptors per kind, in merge order.
    pub resources: BTreeMap<ResourceKind, Vec<Descriptor>>,
}

impl ResolvedTemplate {
    /// Descriptors of one kind.
    #[must_use]
    pub fn descriptors(&self, kind: ResourceKind) -> &[Descriptor] {
        self.resources.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// All descriptors in executor order.
    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        ResourceKind::EXECUTION_ORDER
            .into_iter()
            .flat_map(|kind| self.descriptors(kind))
    }

    /// Total number of descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    /// Whether the template declares no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fields a kind captures when a descriptor declares none.
#[must_use]
pub fn default_fields(kind: ResourceKind) -> BTreeMap<String, FieldDecl> {
    let plain = |ty| FieldDecl { ty, encrypt: false };
    let pairs: &[(&str, FieldType)] = match kind {
        ResourceKind::File => &[("content", FieldType::Binary)],
        ResourceKind::Application => &[("packages", FieldType::List)],
        ResourceKind::ScheduledTask => &[
            ("definition", FieldType::String),
            ("enabled", FieldType::Boolean),
        ],
        ResourceKind::Registry => &[],
    };
    pairs
        .iter()
        .map(|(name, ty)| ((*name).to_string(), plain(*ty)))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn field_spec_accepts_bare_and_detailed_forms() {
        let doc: DescriptorDoc = toml::from_str(
            r#"
            locator = 'HKCU\Software\App'
            fields = { Theme = "string", Token = { type = "string", encrypt = true } }
            "#,
        )
        .unwrap();
        assert_eq!(doc.fields["Theme"], FieldSpec::Bare(FieldType::String));
        assert!(doc.fields["Token"].decl().encrypt);
    }

    #[test]
    fn metadata_version_accepts_integer_and_extends_accepts_string() {
        let meta: Metadata = toml::from_str(
            r#"
            name = "laptop"
            version = 3
            extends = "base"
            "#,
        )
        .unwrap();
        assert_eq!(meta.version, "3");
        assert_eq!(meta.extends, vec!["base".to_string()]);
    }

    #[test]
    fn policy_merge_only_overrides_set_flags() {
        let mut base = PolicyDoc {
            encrypt: Some(true),
            required: Some(true),
            ..PolicyDoc::default()
        };
        base.merge(&PolicyDoc {
            required: Some(false),
            preserve_links: Some(true),
            ..PolicyDoc::default()
        });
        let policy = base.resolve();
        assert!(policy.encrypt);
        assert!(!policy.required);
        assert!(policy.preserve_links);
        assert!(!policy.preserve_attributes);
    }

    #[test]
    fn default_fields_per_kind() {
        assert!(default_fields(ResourceKind::File).contains_key("content"));
        assert_eq!(default_fields(ResourceKind::ScheduledTask).len(), 2);
        assert!(default_fields(ResourceKind::Registry).is_empty());
    }

    #[test]
    fn field_type_from_str() {
        assert_eq!("list".parse::<FieldType>().unwrap(), FieldType::List);
        assert!("float".parse::<FieldType>().is_err());
    }
}
