//! Command: validate a template and its ancestors without touching anything.
use std::sync::Arc;

use anyhow::Result;

use super::CommandSetup;
use crate::cli::{GlobalOpts, TemplateOpts};
use crate::error::TemplateError;
use crate::locator::ResourceKind;
use crate::logging::Logger;
use crate::template::ResolvedTemplate;

/// Run the validate command.
///
/// # Errors
///
/// Returns an error if the template or any ancestor fails to load.
#[allow(clippy::print_stdout)]
pub fn run(global: &GlobalOpts, opts: &TemplateOpts, log: &Arc<Logger>) -> Result<()> {
    let setup = CommandSetup::init(global, log)?;
    log.stage(&format!("Validating {}", opts.template));
    match setup.load(&opts.template) {
        Ok(template) => {
            if opts.json {
                println!(
                    "{}",
                    serde_json::json!({ "valid": true, "ancestry": template.ancestry, "resources": template.len() })
                );
            } else {
                log.info(&summary(&template));
            }
            Ok(())
        }
        Err(err) => {
            if opts.json {
                let errors = match &err {
                    TemplateError::Load { errors, .. } => serde_json::to_value(errors)?,
                    other => serde_json::json!([{ "path": "", "message": other.to_string() }]),
                };
                println!("{}", serde_json::json!({ "valid": false, "errors": errors }));
            } else {
                super::report_template_error(&err, log);
            }
            anyhow::bail!("template '{}' is not valid", opts.template)
        }
    }
}

/// One-line description of a resolved template.
#[must_use]
pub fn summary(template: &ResolvedTemplate) -> String {
    let counts: Vec<String> = ResourceKind::ALL
        .into_iter()
        .filter_map(|kind| {
            let n = template.descriptors(kind).len();
            (n > 0).then(|| format!("{n} {kind}"))
        })
        .collect();
    let counts = if counts.is_empty() {
        "no resources".to_string()
    } else {
        counts.join(", ")
    };
    format!(
        "{} v{} is valid: {counts} (ancestry: {})",
        template.name,
        if template.version.is_empty() { "0" } else { template.version.as_str() },
        template.ancestry.join(" -> ")
    )
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::locator::Normalizer;
    use crate::template::{MemorySource, load_template};

    #[test]
    fn summary_lists_kinds_and_ancestry() {
        let source = MemorySource::new()
            .with_toml(
                "base",
                "[metadata]\nname = \"base\"\nversion = 1\n\n[[resources.file]]\nlocator = \"/etc/hosts\"\n",
            )
            .with_toml(
                "desk",
                "[metadata]\nname = \"desk\"\nversion = 2\nextends = \"base\"\n\n[[resources.application]]\nlocator = \"apt\"\n",
            );
        let template = load_template("desk", &source, &Normalizer::default()).unwrap();
        insta::assert_snapshot!(
            summary(&template),
            @"desk v2 is valid: 1 file, 1 application (ancestry: base -> desk)"
        );
    }
}
