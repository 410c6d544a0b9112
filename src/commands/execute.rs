//! Backup and restore commands.
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use super::CommandSetup;
use crate::cli::{GlobalOpts, TemplateOpts};
use crate::engine::{Action, ExecutionError, ExecutionResult, RunState};
use crate::logging::Logger;
use crate::platform;
use crate::privilege;

/// Run `action` for the template named in `opts`.
///
/// # Errors
///
/// Returns an error if the template fails to load, a required resource
/// fails, the run is cancelled, or any resource failed.
#[allow(clippy::print_stdout)]
pub fn run(
    global: &GlobalOpts,
    opts: &TemplateOpts,
    action: Action,
    log: &Arc<Logger>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let setup = CommandSetup::init(global, log)?;
    let ctx = setup.context(global, Arc::clone(log), cancel);

    if let Ok(template) = setup.load(&opts.template) {
        let needs = privilege::analyze(&template);
        if needs.requires_admin && !platform::is_elevated(ctx.executor.as_ref()) {
            log.warn(&format!(
                "template touches protected areas ({}) but this process is not elevated",
                needs.access_classes.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
    }

    let mut executor = setup.executor();
    let outcome = executor.invoke(&opts.template, action, &setup.state_dir, &ctx);
    let result = match outcome {
        Ok(result) => result,
        Err(ExecutionError::LoadFailed { source, .. }) => {
            super::report_template_error(&source, log);
            anyhow::bail!("{action} of '{}' did not start", opts.template);
        }
        Err(err @ ExecutionError::Aborted { .. }) => {
            log.print_summary();
            return Err(err.into());
        }
    };

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        log.print_summary();
    }
    finish(&result, log)
}

/// Map a completed result to the process outcome.
///
/// # Errors
///
/// Returns an error when the run was cancelled or any resource failed.
pub fn finish(result: &ExecutionResult, log: &Logger) -> Result<()> {
    if result.requires_reboot {
        log.warn("a reboot is required for some changes to take effect");
    }
    match result.state {
        RunState::Cancelled => anyhow::bail!("{} of '{}' was cancelled", result.action, result.template),
        _ if !result.success => anyhow::bail!(
            "{} of '{}' finished with {} failed resource(s)",
            result.action,
            result.template,
            result.failure_count()
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::ResourceOutcome;
    use crate::locator::ResourceKind;

    fn result(state: RunState, ok: bool) -> ExecutionResult {
        ExecutionResult {
            template: "desk".to_string(),
            action: Action::Restore,
            success: ok,
            requires_reboot: false,
            state,
            per_resource: vec![ResourceOutcome {
                kind: ResourceKind::File,
                locator: "/etc/hosts".to_string(),
                ok,
                error: (!ok).then(|| "denied".to_string()),
                change: None,
            }],
        }
    }

    #[test]
    fn completed_is_success() {
        let log = Logger::with_log_file(None);
        assert!(finish(&result(RunState::Completed, true), &log).is_ok());
    }

    #[test]
    fn failures_become_an_error() {
        let log = Logger::with_log_file(None);
        let err = finish(&result(RunState::CompletedWithErrors, false), &log).unwrap_err();
        assert_eq!(err.to_string(), "restore of 'desk' finished with 1 failed resource(s)");
    }

    #[test]
    fn cancellation_is_an_error() {
        let log = Logger::with_log_file(None);
        let err = finish(&result(RunState::Cancelled, false), &log).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
