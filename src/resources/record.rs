//! Captured field values and the persisted state record format.
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionContext;
use crate::error::CryptoError;
use crate::locator::ResourceKind;
use crate::template::{Descriptor, FieldType, Policy};

/// Current state record format version.
pub const RECORD_VERSION: u32 = 1;

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    /// UTF-8 text.
    String(String),
    /// Signed integer.
    Integer(i64),
    /// Boolean.
    Boolean(bool),
    /// Raw bytes, base64 in JSON.
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
    /// Ordered string list.
    List(Vec<String>),
}

impl FieldValue {
    /// Type of this value.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        match self {
            Self::String(_) => FieldType::String,
            Self::Integer(_) => FieldType::Integer,
            Self::Boolean(_) => FieldType::Boolean,
            Self::Binary(_) => FieldType::Binary,
            Self::List(_) => FieldType::List,
        }
    }

    /// Convert to `ty` where the conversion is lossless.
    ///
    /// Text and bytes convert into each other (bytes only when valid UTF-8).
    ///
    /// # Errors
    ///
    /// Returns the original value if no lossless conversion exists.
    pub fn coerce(self, ty: FieldType) -> Result<Self, Self> {
        match (self, ty) {
            (v, t) if v.field_type() == t => Ok(v),
            (Self::String(s), FieldType::Binary) => Ok(Self::Binary(s.into_bytes())),
            (Self::Binary(b), FieldType::String) => {
                String::from_utf8(b).map(Self::String).map_err(|e| Self::Binary(e.into_bytes()))
            }
            (v, _) => Err(v),
        }
    }

    /// Short human-readable rendering for listings.
    #[must_use]
    pub fn preview(&self) -> String {
        const MAX: usize = 48;
        let text = match self {
            Self::String(s) => format!("{s:?}"),
            Self::Integer(n) => n.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Binary(b) => format!("<{} bytes>", b.len()),
            Self::List(items) => format!("[{} items]", items.len()),
        };
        if text.chars().count() > MAX {
            let truncated: String = text.chars().take(MAX - 1).collect();
            format!("{truncated}…")
        } else {
            text
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.preview())
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// A field as stored in a record: plain, or sealed by the encryption service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredField {
    /// Ciphertext blob of the JSON-encoded [`FieldValue`].
    Sealed(String),
    /// Plain value.
    Plain(FieldValue),
}

impl StoredField {
    /// Seal `value` so its type survives the round trip.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn seal(value: &FieldValue, crypto: &EncryptionContext) -> Result<Self, CryptoError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| CryptoError::Encryption(e.to_string()))?;
        crypto.protect(&bytes).map(Self::Sealed)
    }

    /// Recover the value, checking it is stored the way the record says.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] if the blob cannot be opened, or
    /// if a field marked encrypted holds a plain value (or vice versa).
    pub fn open(
        &self,
        expect_sealed: bool,
        crypto: &EncryptionContext,
    ) -> Result<FieldValue, CryptoError> {
        match (self, expect_sealed) {
            (Self::Plain(value), false) => Ok(value.clone()),
            (Self::Sealed(blob), true) => {
                let bytes = crypto.unprotect(blob)?;
                serde_json::from_slice(&bytes).map_err(|e| {
                    CryptoError::Decryption(format!("sealed value is not a field: {e}"))
                })
            }
            (Self::Plain(_), true) => Err(CryptoError::Decryption(
                "field is marked encrypted but stored in plain text".to_string(),
            )),
            (Self::Sealed(_), false) => Err(CryptoError::Decryption(
                "field is stored sealed but not marked encrypted".to_string(),
            )),
        }
    }
}

/// Native storage type of a registry value that its field type does not pin
/// down. Plain strings and 32-bit integers need no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeType {
    /// `REG_EXPAND_SZ`: text with unexpanded `%VAR%` references.
    ExpandString,
    /// `REG_QWORD`: 64-bit integer.
    Qword,
}

/// Preserved metadata of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSnapshot {
    /// Read-only flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// POSIX permission bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    /// Symlink target, when the resource is a link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Registry value types by field name; kept regardless of policy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub value_types: BTreeMap<String, NativeType>,
}

impl AttributeSnapshot {
    /// Keep only the parts `policy` asks to preserve; `None` if nothing is
    /// left.
    #[must_use]
    pub fn filtered(&self, policy: &Policy) -> Option<Self> {
        let kept = Self {
            readonly: self.readonly.filter(|_| policy.preserve_attributes),
            modified: self.modified.filter(|_| policy.preserve_attributes),
            mode: self.mode.filter(|_| policy.preserve_permissions),
            link_target: self
                .link_target
                .clone()
                .filter(|_| policy.preserve_links),
            value_types: self.value_types.clone(),
        };
        (!kept.is_empty()).then_some(kept)
    }

    /// Whether no attribute is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readonly.is_none()
            && self.modified.is_none()
            && self.mode.is_none()
            && self.link_target.is_none()
            && self.value_types.is_empty()
    }

    /// Whether every attribute set in `self` has the same value in `other`.
    #[must_use]
    pub fn satisfied_by(&self, other: Option<&Self>) -> bool {
        let Some(other) = other else {
            return self.is_empty();
        };
        self.readonly.is_none_or(|v| other.readonly == Some(v))
            && self.modified.is_none_or(|v| other.modified == Some(v))
            && self.mode.is_none_or(|v| other.mode == Some(v))
            && self
                .link_target
                .as_ref()
                .is_none_or(|v| other.link_target.as_ref() == Some(v))
            && self
                .value_types
                .iter()
                .all(|(name, ty)| other.value_types.get(name) == Some(ty))
    }
}

/// Live values read from the system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveState {
    /// Present fields by name.
    pub fields: BTreeMap<String, FieldValue>,
    /// Metadata, when the provider reads any.
    pub attributes: Option<AttributeSnapshot>,
}

impl LiveState {
    /// Build a live state from `(name, value)` pairs.
    #[must_use]
    pub fn from_fields(fields: impl IntoIterator<Item = (String, FieldValue)>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
            attributes: None,
        }
    }
}

/// The persisted capture of one resource.
///
/// Written by capture, read by apply; apply never modifies or deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Record format version.
    pub version: u32,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Canonical locator.
    pub locator: String,
    /// Record key (file name stem after the kind).
    pub key: String,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
    /// Whether the live resource existed at capture.
    pub present: bool,
    /// Captured fields.
    #[serde(default)]
    pub fields: BTreeMap<String, StoredField>,
    /// Which fields are sealed.
    #[serde(default)]
    pub field_is_encrypted: BTreeMap<String, bool>,
    /// Declared fields the live resource did not have.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
    /// Preserved metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<AttributeSnapshot>,
}

impl StateRecord {
    /// An empty record for `descriptor`, stamped now.
    #[must_use]
    pub fn new(descriptor: &Descriptor, present: bool) -> Self {
        Self {
            version: RECORD_VERSION,
            kind: descriptor.kind(),
            locator: descriptor.locator.to_string(),
            key: descriptor.locator.record_key(),
            captured_at: Utc::now(),
            present,
            fields: BTreeMap::new(),
            field_is_encrypted: BTreeMap::new(),
            missing_fields: Vec::new(),
            attributes: None,
        }
    }

    /// Whether `field` is recorded sealed.
    #[must_use]
    pub fn is_encrypted(&self, field: &str) -> bool {
        self.field_is_encrypted.get(field).copied().unwrap_or(false)
    }

    /// Number of sealed fields.
    #[must_use]
    pub fn encrypted_count(&self) -> usize {
        self.field_is_encrypted.values().filter(|v| **v).count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::StaticKey;

    fn crypto() -> EncryptionContext {
        EncryptionContext::new(StaticKey::new([3; 32]))
    }

    #[test]
    fn binary_values_serialize_as_base64() {
        let json = serde_json::to_string(&FieldValue::Binary(b"hi".to_vec())).unwrap();
        assert_eq!(json, r#"{"type":"binary","value":"aGk="}"#);
    }

    #[test]
    fn coerce_between_text_and_bytes() {
        assert_eq!(
            FieldValue::String("x".into()).coerce(FieldType::Binary),
            Ok(FieldValue::Binary(b"x".to_vec()))
        );
        assert!(FieldValue::Binary(vec![0xff]).coerce(FieldType::String).is_err());
        assert!(FieldValue::Integer(1).coerce(FieldType::Boolean).is_err());
    }

    #[test]
    fn sealed_field_keeps_its_type() {
        let ctx = crypto();
        let stored = StoredField::seal(&FieldValue::Integer(42), &ctx).unwrap();
        assert!(matches!(stored, StoredField::Sealed(_)));
        assert_eq!(stored.open(true, &ctx).unwrap(), FieldValue::Integer(42));
    }

    #[test]
    fn encryption_flag_mismatch_is_rejected() {
        let ctx = crypto();
        let plain = StoredField::Plain(FieldValue::Boolean(true));
        assert!(plain.open(true, &ctx).is_err());
        let sealed = StoredField::seal(&FieldValue::Boolean(true), &ctx).unwrap();
        assert!(sealed.open(false, &ctx).is_err());
    }

    #[test]
    fn stored_fields_deserialize_untagged() {
        let plain: StoredField =
            serde_json::from_str(r#"{"type":"string","value":"dark"}"#).unwrap();
        assert_eq!(plain, StoredField::Plain(FieldValue::String("dark".into())));
        let sealed: StoredField = serde_json::from_str(r#""v1:AAAA""#).unwrap();
        assert_eq!(sealed, StoredField::Sealed("v1:AAAA".into()));
    }

    #[test]
    fn attributes_filtered_by_policy() {
        let attrs = AttributeSnapshot {
            readonly: Some(true),
            modified: None,
            mode: Some(0o600),
            link_target: Some("/target".into()),
            value_types: BTreeMap::new(),
        };
        let policy = Policy {
            preserve_permissions: true,
            ..Policy::default()
        };
        let kept = attrs.filtered(&policy).unwrap();
        assert_eq!(kept.mode, Some(0o600));
        assert!(kept.readonly.is_none());
        assert!(kept.link_target.is_none());
        assert!(attrs.filtered(&Policy::default()).is_none());
    }

    #[test]
    fn attributes_satisfied_by_superset() {
        let want = AttributeSnapshot {
            mode: Some(0o644),
            ..AttributeSnapshot::default()
        };
        let have = AttributeSnapshot {
            mode: Some(0o644),
            readonly: Some(false),
            ..AttributeSnapshot::default()
        };
        assert!(want.satisfied_by(Some(&have)));
        assert!(!want.satisfied_by(None));
        assert!(AttributeSnapshot::default().satisfied_by(None));
    }

    #[test]
    fn value_types_survive_any_policy() {
        let attrs = AttributeSnapshot {
            value_types: BTreeMap::from([("Path".to_string(), NativeType::ExpandString)]),
            ..AttributeSnapshot::default()
        };
        let kept = attrs.filtered(&Policy::default()).unwrap();
        assert_eq!(kept.value_types.get("Path"), Some(&NativeType::ExpandString));
        assert!(!kept.satisfied_by(Some(&AttributeSnapshot::default())));
    }

    #[test]
    fn preview_truncates_long_text() {
        let long = FieldValue::String("x".repeat(200));
        assert!(long.preview().chars().count() <= 48);
        assert_eq!(FieldValue::Binary(vec![0; 10]).preview(), "<10 bytes>");
    }
}
