//! Structural validation of raw template documents.
//!
//! Runs on the untyped, unmerged document so that every problem is reported
//! at once, each with the document path where it was found
//! (`resources.registry[1].locator`). Validation never mutates its input.
use std::fmt;

use serde_json::{Map, Value};

use super::FieldType;
use crate::locator::{Normalizer, ResourceKind};

const TOP_LEVEL_KEYS: &[&str] = &["metadata", "resources"];
const METADATA_KEYS: &[&str] = &["name", "version", "description", "extends"];
const DESCRIPTOR_KEYS: &[&str] = &["locator", "fields", "policy", "exclude"];
const POLICY_KEYS: &[&str] = &[
    "encrypt",
    "preserve_attributes",
    "preserve_permissions",
    "preserve_links",
    "required",
];
const FIELD_SPEC_KEYS: &[&str] = &["type", "encrypt"];

/// One problem found in a template document.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationError {
    /// Dotted document path of the offending value.
    pub path: String,
    /// Human-readable description.
    pub message: String,
}

impl ValidationError {
    /// Create a validation error at `path`.
    #[must_use]
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Which field names and types a kind accepts.
fn field_constraint(kind: ResourceKind, name: &str, ty: FieldType) -> Option<String> {
    let allowed: &[(&str, &[FieldType])] = match kind {
        ResourceKind::Registry => return None,
        ResourceKind::File => &[("content", &[FieldType::Binary, FieldType::String])],
        ResourceKind::Application => &[("packages", &[FieldType::List])],
        ResourceKind::ScheduledTask => &[
            ("definition", &[FieldType::String]),
            ("enabled", &[FieldType::Boolean]),
        ],
    };
    match allowed.iter().find(|(n, _)| *n == name) {
        None => Some(format!(
            "{kind} resources do not have a field named '{name}' (expected {})",
            allowed
                .iter()
                .map(|(n, _)| *n)
                .collect::<Vec<_>>()
                .join(", ")
        )),
        Some((_, types)) if !types.contains(&ty) => Some(format!(
            "field '{name}' of {kind} resources must be {}",
            types
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(" or ")
        )),
        Some(_) => None,
    }
}

/// Validates raw template documents.
#[derive(Debug, Clone, Copy)]
pub struct SchemaValidator<'a> {
    normalizer: &'a Normalizer,
}

impl<'a> SchemaValidator<'a> {
    /// Create a validator that checks locators with `normalizer`.
    #[must_use]
    pub const fn new(normalizer: &'a Normalizer) -> Self {
        Self { normalizer }
    }

    /// Return every problem found in `raw`; empty means valid.
    #[must_use]
    pub fn validate(&self, raw: &Value) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let Some(root) = raw.as_object() else {
            errors.push(ValidationError::new("", "document must be a table"));
            return errors;
        };
        unknown_keys(root, TOP_LEVEL_KEYS, "", &mut errors);

        match root.get("metadata") {
            None => errors.push(ValidationError::new("metadata", "missing section")),
            Some(meta) => validate_metadata(meta, &mut errors),
        }
        if let Some(resources) = root.get("resources") {
            self.validate_resources(resources, &mut errors);
        }
        errors
    }

    fn validate_resources(&self, value: &Value, errors: &mut Vec<ValidationError>) {
        let Some(sections) = value.as_object() else {
            errors.push(ValidationError::new("resources", "must be a table"));
            return;
        };
        for (section, entries) in sections {
            let path = format!("resources.{section}");
            let Some(kind) = ResourceKind::from_section(section) else {
                errors.push(ValidationError::new(
                    path,
                    format!("unknown resource kind '{section}'"),
                ));
                continue;
            };
            let Some(entries) = entries.as_array() else {
                errors.push(ValidationError::new(path, "must be an array of tables"));
                continue;
            };
            for (index, entry) in entries.iter().enumerate() {
                self.validate_descriptor(kind, entry, &format!("{path}[{index}]"), errors);
            }
        }
    }

    fn validate_descriptor(
        &self,
        kind: ResourceKind,
        value: &Value,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        let Some(table) = value.as_object() else {
            errors.push(ValidationError::new(path, "descriptor must be a table"));
            return;
        };
        unknown_keys(table, DESCRIPTOR_KEYS, path, errors);

        let locator_path = format!("{path}.locator");
        match table.get("locator") {
            None => errors.push(ValidationError::new(locator_path, "missing locator")),
            Some(Value::String(raw)) if raw.trim().is_empty() => {
                errors.push(ValidationError::new(locator_path, "locator is empty"));
            }
            Some(Value::String(raw)) => {
                if let Err(e) = self.normalizer.normalize(raw, kind) {
                    errors.push(ValidationError::new(locator_path, e.reason));
                }
            }
            Some(_) => errors.push(ValidationError::new(locator_path, "must be a string")),
        }

        if let Some(fields) = table.get("fields") {
            validate_fields(kind, fields, &format!("{path}.fields"), errors);
        }

        if let Some(policy) = table.get("policy") {
            validate_policy(policy, &format!("{path}.policy"), errors);
        }
        if let Some(exclude) = table.get("exclude") {
            string_list(exclude, &format!("{path}.exclude"), errors);
        }
    }
}

fn validate_metadata(value: &Value, errors: &mut Vec<ValidationError>) {
    let Some(meta) = value.as_object() else {
        errors.push(ValidationError::new("metadata", "must be a table"));
        return;
    };
    unknown_keys(meta, METADATA_KEYS, "metadata", errors);

    match meta.get("name") {
        None => errors.push(ValidationError::new("metadata.name", "missing name")),
        Some(Value::String(name)) if name.trim().is_empty() => {
            errors.push(ValidationError::new("metadata.name", "name is empty"));
        }
        Some(Value::String(_)) => {}
        Some(_) => errors.push(ValidationError::new("metadata.name", "must be a string")),
    }
    match meta.get("version") {
        None | Some(Value::String(_)) => {}
        Some(Value::Number(n)) if n.is_i64() => {}
        Some(_) => errors.push(ValidationError::new(
            "metadata.version",
            "must be a string or an integer",
        )),
    }
    if !matches!(meta.get("description"), None | Some(Value::String(_))) {
        errors.push(ValidationError::new("metadata.description", "must be a string"));
    }
    match meta.get("extends") {
        None => {}
        Some(Value::String(parent)) if parent.trim().is_empty() => {
            errors.push(ValidationError::new("metadata.extends", "parent name is empty"));
        }
        Some(Value::String(_)) => {}
        Some(other) => string_list(other, "metadata.extends", errors),
    }
}

fn validate_fields(kind: ResourceKind, value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
    let Some(fields) = value.as_object() else {
        errors.push(ValidationError::new(path, "must be a table"));
        return;
    };
    for (name, spec) in fields {
        let field_path = format!("{path}.{name}");
        let ty = match spec {
            Value::String(ty) => parse_type(ty, &field_path, errors),
            Value::Object(table) => {
                unknown_keys(table, FIELD_SPEC_KEYS, &field_path, errors);
                if let Some(encrypt) = table.get("encrypt")
                    && !encrypt.is_boolean()
                {
                    errors.push(ValidationError::new(
                        format!("{field_path}.encrypt"),
                        "must be a boolean",
                    ));
                }
                match table.get("type") {
                    Some(Value::String(ty)) => {
                        parse_type(ty, &format!("{field_path}.type"), errors)
                    }
                    Some(_) => {
                        errors.push(ValidationError::new(
                            format!("{field_path}.type"),
                            "must be a string",
                        ));
                        None
                    }
                    None => {
                        errors.push(ValidationError::new(
                            format!("{field_path}.type"),
                            "missing type",
                        ));
                        None
                    }
                }
            }
            _ => {
                errors.push(ValidationError::new(
                    field_path.clone(),
                    "must be a type name or a table with a type",
                ));
                None
            }
        };
        if let Some(ty) = ty
            && let Some(message) = field_constraint(kind, name, ty)
        {
            errors.push(ValidationError::new(field_path, message));
        }
    }
}

fn parse_type(ty: &str, path: &str, errors: &mut Vec<ValidationError>) -> Option<FieldType> {
    match ty.parse::<FieldType>() {
        Ok(t) => Some(t),
        Err(message) => {
            errors.push(ValidationError::new(path, message));
            None
        }
    }
}

fn validate_policy(value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
    let Some(policy) = value.as_object() else {
        errors.push(ValidationError::new(path, "must be a table"));
        return;
    };
    for (key, flag) in policy {
        if !POLICY_KEYS.contains(&key.as_str()) {
            errors.push(ValidationError::new(
                format!("{path}.{key}"),
                format!("unknown policy flag '{key}'"),
            ));
        } else if !flag.is_boolean() {
            errors.push(ValidationError::new(format!("{path}.{key}"), "must be a boolean"));
        }
    }
}

fn string_list(value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
    let Some(items) = value.as_array() else {
        errors.push(ValidationError::new(path, "must be an array of strings"));
        return;
    };
    for (index, item) in items.iter().enumerate() {
        match item {
            Value::String(s) if !s.trim().is_empty() => {}
            Value::String(_) => {
                errors.push(ValidationError::new(format!("{path}[{index}]"), "is empty"));
            }
            _ => errors.push(ValidationError::new(
                format!("{path}[{index}]"),
                "must be a string",
            )),
        }
    }
}

fn unknown_keys(
    table: &Map<String, Value>,
    known: &[&str],
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    for key in table.keys().filter(|k| !known.contains(&k.as_str())) {
        let key_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        errors.push(ValidationError::new(key_path, format!("unknown key '{key}'")));
    }
}
