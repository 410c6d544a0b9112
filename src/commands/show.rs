//! Command: print a template after inheritance.
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use super::CommandSetup;
use crate::cli::{GlobalOpts, TemplateOpts};
use crate::logging::Logger;
use crate::template::{Descriptor, FieldDecl, Policy, ResolvedTemplate};

/// Run the show command.
///
/// # Errors
///
/// Returns an error if the template fails to load.
#[allow(clippy::print_stdout)]
pub fn run(global: &GlobalOpts, opts: &TemplateOpts, log: &Arc<Logger>) -> Result<()> {
    let setup = CommandSetup::init(global, log)?;
    let template = match setup.load(&opts.template) {
        Ok(template) => template,
        Err(err) => {
            super::report_template_error(&err, log);
            anyhow::bail!("template '{}' could not be loaded", opts.template);
        }
    };
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&TemplateView::from(&template))?);
    } else {
        println!("{}", render(&template));
    }
    Ok(())
}

#[derive(Serialize)]
struct TemplateView<'a> {
    name: &'a str,
    version: &'a str,
    ancestry: &'a [String],
    resources: Vec<DescriptorView<'a>>,
}

#[derive(Serialize)]
struct DescriptorView<'a> {
    kind: String,
    locator: String,
    fields: &'a BTreeMap<String, FieldDecl>,
    policy: Policy,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    exclude: &'a [String],
}

impl<'a> From<&'a ResolvedTemplate> for TemplateView<'a> {
    fn from(template: &'a ResolvedTemplate) -> Self {
        Self {
            name: &template.name,
            version: &template.version,
            ancestry: &template.ancestry,
            resources: template
                .iter()
                .map(|d| DescriptorView {
                    kind: d.kind().to_string(),
                    locator: d.locator.canonical(),
                    fields: &d.fields,
                    policy: d.policy,
                    exclude: &d.exclude,
                })
                .collect(),
        }
    }
}

/// Text form of a resolved template, descriptors in execution order.
#[must_use]
pub fn render(template: &ResolvedTemplate) -> String {
    let mut lines = vec![
        format!("template: {}", template.name),
        format!("version:  {}", template.version),
        format!("ancestry: {}", template.ancestry.join(" -> ")),
    ];
    for descriptor in template.iter() {
        lines.push(String::new());
        lines.extend(describe(descriptor));
    }
    lines.join("\n")
}

fn describe(descriptor: &Descriptor) -> Vec<String> {
    let mut lines = vec![format!("[{}] {}", descriptor.kind(), descriptor.raw_locator)];
    for (name, decl) in &descriptor.fields {
        let sealed = if descriptor.encrypts(name) { " (encrypted)" } else { "" };
        lines.push(format!("  {name}: {}{sealed}", decl.ty.as_str()));
    }
    let flags = policy_flags(descriptor.policy);
    if !flags.is_empty() {
        lines.push(format!("  policy: {}", flags.join(", ")));
    }
    if !descriptor.exclude.is_empty() {
        lines.push(format!("  exclude: {}", descriptor.exclude.join(", ")));
    }
    lines
}

fn policy_flags(policy: Policy) -> Vec<&'static str> {
    [
        (policy.required, "required"),
        (policy.encrypt, "encrypt"),
        (policy.preserve_attributes, "preserve_attributes"),
        (policy.preserve_permissions, "preserve_permissions"),
        (policy.preserve_links, "preserve_links"),
    ]
    .into_iter()
    .filter_map(|(set, name)| set.then_some(name))
    .collect()
}
