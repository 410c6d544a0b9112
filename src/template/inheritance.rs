//! `extends` linearization and descriptor merging.
use std::collections::{BTreeMap, BTreeSet};

use super::schema::ValidationError;
use super::{
    Descriptor, FieldSpec, PolicyDoc, ResolvedTemplate, TemplateDocument, default_fields,
};
use crate::error::TemplateError;
use crate::locator::{Locator, Normalizer, ResourceKind};

/// Fetches an ancestor document by name.
pub type Lookup<'a> = dyn FnMut(&str) -> Result<TemplateDocument, TemplateError> + 'a;

/// Resolve `document` (named `name`) against its ancestors.
///
/// Ancestors are linearized depth-first in declaration order, each appearing
/// once, oldest first. Descriptors are then merged by locator: fields and
/// policy flags a later document sets win, everything else survives, and new
/// locators are appended in order. `exclude` lists replace rather than
/// concatenate.
///
/// # Errors
///
/// Returns [`TemplateError::CyclicInheritance`] if a template reappears on its
/// own ancestor chain, [`TemplateError::Locator`] if a locator does not
/// normalize, [`TemplateError::Load`] if a registry key ends up with no value
/// names, or any error produced by `lookup`.
pub fn resolve(
    name: &str,
    document: TemplateDocument,
    lookup: &mut Lookup<'_>,
    normalizer: &Normalizer,
) -> Result<ResolvedTemplate, TemplateError> {
    let version = document.metadata.version.clone();
    let mut linearizer = Linearizer {
        lookup,
        stack: Vec::new(),
        done: BTreeSet::new(),
        order: Vec::new(),
    };
    linearizer.visit(name.to_string(), document)?;
    let order = linearizer.order;

    let mut merged: BTreeMap<ResourceKind, Vec<Pending>> = BTreeMap::new();
    for (template, doc) in &order {
        for kind in ResourceKind::ALL {
            for entry in doc.resources.of(kind) {
                let locator = normalizer.normalize(&entry.locator, kind).map_err(|source| {
                    TemplateError::Locator {
                        name: template.clone(),
                        source,
                    }
                })?;
                let list = merged.entry(kind).or_default();
                if let Some(existing) = list.iter_mut().find(|p| p.locator == locator) {
                    for (field, spec) in &entry.fields {
                        existing
                            .fields
                            .entry(field.clone())
                            .and_modify(|held| *held = held.merge(*spec))
                            .or_insert(*spec);
                    }
                    existing.policy.merge(&entry.policy);
                    if entry.exclude.is_some() {
                        existing.exclude.clone_from(&entry.exclude);
                    }
                } else {
                    list.push(Pending {
                        locator,
                        raw: entry.locator.clone(),
                        fields: entry.fields.clone(),
                        policy: entry.policy,
                        exclude: entry.exclude.clone(),
                    });
                }
            }
        }
    }

    let bare_keys: Vec<ValidationError> = merged
        .get(&ResourceKind::Registry)
        .into_iter()
        .flatten()
        .enumerate()
        .filter(|(_, pending)| pending.fields.is_empty())
        .map(|(index, pending)| {
            ValidationError::new(
                format!("resources.registry[{index}].fields"),
                format!("'{}' declares no value names in any template", pending.raw),
            )
        })
        .collect();
    if !bare_keys.is_empty() {
        return Err(TemplateError::Load {
            name: name.to_string(),
            errors: bare_keys,
        });
    }

    let resources = merged
        .into_iter()
        .map(|(kind, list)| (kind, list.into_iter().map(Pending::finish).collect()))
        .collect();

    Ok(ResolvedTemplate {
        name: name.to_string(),
        version,
        ancestry: order.into_iter().map(|(n, _)| n).collect(),
        resources,
    })
}

/// A descriptor part-way through merging.
struct Pending {
    locator: Locator,
    raw: String,
    fields: BTreeMap<String, FieldSpec>,
    policy: PolicyDoc,
    exclude: Option<Vec<String>>,
}

impl Pending {
    fn finish(self) -> Descriptor {
        let mut fields: BTreeMap<_, _> = self
            .fields
            .into_iter()
            .map(|(k, spec)| (k, spec.decl()))
            .collect();
        if fields.is_empty() {
            fields = default_fields(self.locator.kind());
        }
        Descriptor {
            locator: self.locator,
            raw_locator: self.raw,
            fields,
            policy: self.policy.resolve(),
            exclude: self.exclude.unwrap_or_default(),
        }
    }
}

/// Post-order walk of the `extends` graph.
struct Linearizer<'l, 'a> {
    lookup: &'l mut Lookup<'a>,
    stack: Vec<String>,
    done: BTreeSet<String>,
    order: Vec<(String, TemplateDocument)>,
}

impl Linearizer<'_, '_> {
    fn visit(&mut self, name: String, doc: TemplateDocument) -> Result<(), TemplateError> {
        self.stack.push(name.clone());
        let parents = doc.metadata.extends.clone();
        for parent in parents {
            if let Some(pos) = self.stack.iter().position(|n| *n == parent) {
                let mut chain: Vec<String> = self.stack.iter().skip(pos).cloned().collect();
                chain.push(parent);
                return Err(TemplateError::CyclicInheritance { chain });
            }
            if self.done.contains(&parent) {
                continue;
            }
            tracing::debug!("resolving parent template '{parent}' of '{name}'");
            let parent_doc = (self.lookup)(&parent)?;
            self.visit(parent, parent_doc)?;
        }
        self.stack.pop();
        self.done.insert(name.clone());
        self.order.push((name, doc));
        Ok(())
    }
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
    use crate::template::FieldType;

    fn doc(source: &str) -> TemplateDocument {
        toml::from_str(source).expect("test template parses")
    }

    fn library(docs: &[(&str, &str)]) -> BTreeMap<String, TemplateDocument> {
        docs.iter()
            .map(|(name, src)| ((*name).to_string(), doc(src)))
            .collect()
    }

    fn resolve_in(
        lib: &BTreeMap<String, TemplateDocument>,
        name: &str,
    ) -> Result<ResolvedTemplate, TemplateError> {
        let root = lib[name].clone();
        let mut lookup = |n: &str| {
            lib.get(n).cloned().ok_or_else(|| TemplateError::NotFound {
                name: n.to_string(),
            })
        };
        resolve(name, root, &mut lookup, &Normalizer::default())
    }

    #[test]
    fn later_fields_override_and_earlier_fields_survive() {
        let lib = library(&[
            (
                "base",
                r#"
                metadata = { name = "base" }
                [[resources.registry]]
                locator = 'HKLM:\Software\Vendor'
                fields = { a = "integer", b = "integer" }
                policy = { required = true }
                "#,
            ),
            (
                "child",
                r#"
                metadata = { name = "child", extends = "base" }
                [[resources.registry]]
                locator = 'HKEY_LOCAL_MACHINE\SOFTWARE\vendor'
                fields = { b = "string" }
                "#,
            ),
        ]);
        let resolved = resolve_in(&lib, "child").unwrap();
        let registry = resolved.descriptors(ResourceKind::Registry);
        assert_eq!(registry.len(), 1);
        let fields = &registry[0].fields;
        assert_eq!(fields["a"].ty, FieldType::Integer);
        assert_eq!(fields["b"].ty, FieldType::String);
        assert!(registry[0].policy.required, "unset flags are inherited");
        assert_eq!(registry[0].raw_locator, r"HKLM:\Software\Vendor");
        assert_eq!(resolved.ancestry, vec!["base", "child"]);
    }

    #[test]
    fn new_locators_are_appended_in_order() {
        let lib = library(&[
            (
                "base",
                r#"
                metadata = { name = "base" }
                [[resources.file]]
                locator = "/etc/hosts"
                "#,
            ),
            (
                "child",
                r#"
                metadata = { name = "child", extends = ["base"] }
                [[resources.file]]
                locator = "/etc/fstab"
                [[resources.file]]
                locator = "/etc/hosts"
                policy = { preserve_permissions = true }
                "#,
            ),
        ]);
        let resolved = resolve_in(&lib, "child").unwrap();
        let files: Vec<String> = resolved
            .descriptors(ResourceKind::File)
            .iter()
            .map(|d| d.locator.to_string())
            .collect();
        assert_eq!(files, vec!["/etc/hosts", "/etc/fstab"]);
        assert!(resolved.descriptors(ResourceKind::File)[0].policy.preserve_permissions);
    }

    #[test]
    fn two_template_cycle_is_detected() {
        let lib = library(&[
            ("a", r#"metadata = { name = "a", extends = "b" }"#),
            ("b", r#"metadata = { name = "b", extends = "a" }"#),
        ]);
        let err = resolve_in(&lib, "a").unwrap_err();
        match err {
            TemplateError::CyclicInheritance { chain } => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn self_extension_is_a_cycle() {
        let lib = library(&[("a", r#"metadata = { name = "a", extends = "a" }"#)]);
        assert!(matches!(
            resolve_in(&lib, "a"),
            Err(TemplateError::CyclicInheritance { .. })
        ));
    }

    #[test]
    fn diamond_ancestor_appears_once() {
        let lib = library(&[
            ("root", r#"metadata = { name = "root" }"#),
            ("left", r#"metadata = { name = "left", extends = "root" }"#),
            ("right", r#"metadata = { name = "right", extends = "root" }"#),
            (
                "leaf",
                r#"metadata = { name = "leaf", extends = ["left", "right"] }"#,
            ),
        ]);
        let resolved = resolve_in(&lib, "leaf").unwrap();
        assert_eq!(resolved.ancestry, vec!["root", "left", "right", "leaf"]);
    }

    #[test]
    fn missing_parent_is_reported() {
        let lib = library(&[("a", r#"metadata = { name = "a", extends = "ghost" }"#)]);
        assert!(matches!(
            resolve_in(&lib, "a"),
            Err(TemplateError::NotFound { name }) if name == "ghost"
        ));
    }

    #[test]
    fn exclude_lists_replace_whole() {
        let lib = library(&[
            (
                "base",
                r#"
                metadata = { name = "base" }
                [[resources.application]]
                locator = "winget"
                exclude = ["Microsoft.Edge", "Microsoft.Teams"]
                "#,
            ),
            (
                "child",
                r#"
                metadata = { name = "child", extends = "base" }
                [[resources.application]]
                locator = "WinGet"
                exclude = ["Zoom.Zoom"]
                "#,
            ),
        ]);
        let resolved = resolve_in(&lib, "child").unwrap();
        let app = &resolved.descriptors(ResourceKind::Application)[0];
        assert_eq!(app.exclude, vec!["Zoom.Zoom"]);
        assert!(app.fields.contains_key("packages"));
    }

    #[test]
    fn bad_locator_names_its_template() {
        let lib = library(&[(
            "a",
            r#"
            metadata = { name = "a" }
            [[resources.file]]
            locator = "relative/path"
            "#,
        )]);
        assert!(matches!(
            resolve_in(&lib, "a"),
            Err(TemplateError::Locator { name, .. }) if name == "a"
        ));
    }
    #[test]
    fn restating_a_field_type_keeps_inherited_encryption() {
        let lib = library(&[
            (
                "base",
                r#"
                metadata = { name = "base" }
                [[resources.registry]]
                locator = 'HKCU\Software\Vendor'
                fields = { Token = { type = "string", encrypt = true }, Pin = { type = "string", encrypt = true } }
                "#,
            ),
            (
                "child",
                r#"
                metadata = { name = "child", extends = "base" }
                [[resources.registry]]
                locator = 'HKCU\Software\Vendor'
                fields = { Token = "string", Pin = { type = "string", encrypt = false } }
                "#,
            ),
        ]);
        let resolved = resolve_in(&lib, "child").unwrap();
        let fields = &resolved.descriptors(ResourceKind::Registry)[0].fields;
        assert!(fields["Token"].encrypt, "bare restatement inherits the flag");
        assert!(!fields["Pin"].encrypt, "explicit false clears it");
    }

    #[test]
    fn policy_only_child_reuses_inherited_registry_fields() {
        let lib = library(&[
            (
                "base",
                r#"
                metadata = { name = "base" }
                [[resources.registry]]
                locator = 'HKCU\Software\X'
                fields = { Theme = "string" }
                "#,
            ),
            (
                "child",
                r#"
                metadata = { name = "child", extends = "base" }
                [[resources.registry]]
                locator = 'HKCU\Software\X'
                policy = { required = true }
                "#,
            ),
        ]);
        let resolved = resolve_in(&lib, "child").unwrap();
        let key = &resolved.descriptors(ResourceKind::Registry)[0];
        assert!(key.policy.required);
        assert_eq!(key.fields["Theme"].ty, FieldType::String);
    }

    #[test]
    fn registry_key_without_fields_anywhere_is_rejected() {
        let lib = library(&[(
            "a",
            r#"
            metadata = { name = "a" }
            [[resources.registry]]
            locator = 'HKCU\Software\X'
            "#,
        )]);
        match resolve_in(&lib, "a") {
            Err(TemplateError::Load { name, errors }) => {
                assert_eq!(name, "a");
                assert_eq!(errors[0].path, "resources.registry[0].fields");
            }
            other => panic!("expected a load error, got {other:?}"),
        }
    }
}
