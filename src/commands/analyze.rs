//! Command: report the privileges a template needs.
use std::sync::Arc;

use anyhow::Result;

use super::CommandSetup;
use crate::cli::{GlobalOpts, TemplateOpts};
use crate::logging::Logger;
use crate::platform;
use crate::privilege::{self, PrivilegeRequirement};
use crate::template::ResolvedTemplate;

/// Run the analyze command.
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
            anyhow::bail!("template '{}' could not be analyzed", opts.template);
        }
    };

    let needs = privilege::analyze(&template);
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&needs)?);
        return Ok(());
    }

    log.stage(&format!("Privileges for {}", template.name));
    for line in render(&template, &needs).lines() {
        log.info(line);
    }
    if needs.requires_admin && !platform::is_elevated(&crate::exec::SystemExecutor) {
        log.warn("this process is not elevated; restore will fail on protected resources");
    }
    Ok(())
}

/// Human-readable privilege report.
#[must_use]
pub fn render(template: &ResolvedTemplate, needs: &PrivilegeRequirement) -> String {
    if !needs.requires_admin {
        return format!("{}: runs as a standard user", template.name);
    }
    let mut lines = vec![format!("{}: requires administrator", template.name)];
    lines.extend(template.iter().filter_map(|descriptor| {
        privilege::access_class(&descriptor.locator)
            .map(|class| format!("  {} {} ({class})", descriptor.kind(), descriptor.raw_locator))
    }));
    lines.join("\n")
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::locator::Normalizer;
    use crate::template::{MemorySource, load_template};

    fn resolve(toml: &str) -> ResolvedTemplate {
        let source = MemorySource::new().with_toml("t", toml);
        load_template("t", &source, &Normalizer::default()).unwrap()
    }

    #[test]
    fn user_scope_template() {
        let template = resolve(
            "[metadata]\nname = \"t\"\n\n[[resources.registry]]\nlocator = 'HKCU\\Software\\App'\nfields = { Theme = \"string\" }\n",
        );
        let needs = privilege::analyze(&template);
        insta::assert_snapshot!(render(&template, &needs), @"t: runs as a standard user");
    }

    #[test]
    fn lists_each_protected_resource() {
        let template = resolve(
            "[metadata]\nname = \"t\"\n\n[[resources.registry]]\nlocator = 'HKLM\\Software\\App'\nfields = { Theme = \"string\" }\n\n[[resources.file]]\nlocator = \"/etc/hosts\"\n\n[[resources.file]]\nlocator = \"~/.bashrc\"\n",
        );
        let needs = privilege::analyze(&template);
        insta::assert_snapshot!(render(&template, &needs), @r"
        t: requires administrator
          registry HKLM\Software\App (HKLM)
          file /etc/hosts (protected-root:/etc)
        ");
    }
}
