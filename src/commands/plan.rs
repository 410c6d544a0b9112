//! Command: run an execution plan.
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use super::CommandSetup;
use crate::cli::{GlobalOpts, PlanOpts};
use crate::logging::Logger;
use crate::plan::{Plan, PlanOutcome};

/// Run every step of the plan file in `opts`.
///
/// # Errors
///
/// Returns an error if the plan cannot be loaded, a template step fails
/// hard, the run is cancelled, or any step failed.
pub fn run(
    global: &GlobalOpts,
    opts: &PlanOpts,
    log: &Arc<Logger>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let setup = CommandSetup::init(global, log)?;
    let plan = Plan::load(&opts.file)?;
    log.debug(&format!(
        "plan {} has {} step(s)",
        opts.file.display(),
        plan.steps.len()
    ));

    let ctx = setup.context(global, Arc::clone(log), cancel);
    let mut executor = setup.executor();
    let outcome = plan.run(&mut executor, opts.action, &setup.state_dir, &ctx);
    log.print_summary();
    let outcome = outcome?;

    if outcome.results.iter().any(|r| r.requires_reboot) {
        log.warn("a reboot is required for some changes to take effect");
    }
    verdict(&outcome)
}

fn verdict(outcome: &PlanOutcome) -> Result<()> {
    if outcome.cancelled {
        anyhow::bail!("plan was cancelled");
    }
    let failed_templates = outcome.results.iter().filter(|r| !r.success).count();
    let failed_actions = outcome.reports.iter().filter(|r| !r.success).count();
    if failed_templates + failed_actions > 0 {
        anyhow::bail!(
            "plan finished with {failed_templates} failed template run(s) and {failed_actions} failed action(s)"
        );
    }
    Ok(())
}
