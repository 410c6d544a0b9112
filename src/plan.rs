//! Execution plans: an ordered list of template runs and external action
//! steps.
//!
//! ```toml
//! [[step]]
//! template = "workstation"
//!
//! [[step]]
//! run = "pwsh"
//! args = ["-File", "post-restore.ps1"]
//! ```
//!
//! Action steps report `{success, message}` next to the template results;
//! they never alter an [`ExecutionResult`].
use std::fmt;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::config::toml_loader;
use crate::engine::{Action, Context, ExecutionResult, RunState, TemplateExecutor};

/// Environment variable carrying the snapshot directory to action steps.
pub const BACKUP_ROOT_ENV: &str = "SNAPSTATE_BACKUP_ROOT";
/// Environment variable carrying the machine name to action steps.
pub const MACHINE_NAME_ENV: &str = "SNAPSTATE_MACHINE_NAME";

/// A parsed plan file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    /// Steps in execution order.
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

/// One plan step.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Step {
    /// Run the executor on a template.
    Template {
        /// Template name.
        template: String,
    },
    /// Run an external program.
    Action {
        /// Program to run.
        run: String,
        /// Its arguments.
        #[serde(default)]
        args: Vec<String>,
    },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template { template } => write!(f, "template {template}"),
            Self::Action { run, args } if args.is_empty() => write!(f, "run {run}"),
            Self::Action { run, args } => write!(f, "run {run} {}", args.join(" ")),
        }
    }
}

/// What an action step reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    /// Step label.
    pub step: String,
    /// Whether the step succeeded.
    pub success: bool,
    /// Output or failure detail.
    pub message: String,
}

/// Everything a plan run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanOutcome {
    /// One result per template step.
    pub results: Vec<ExecutionResult>,
    /// One report per action step.
    pub reports: Vec<StepReport>,
    /// Whether the run stopped early on cancellation.
    pub cancelled: bool,
}

impl PlanOutcome {
    /// Whether every template run and action step succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.cancelled
            && self.results.iter().all(|r| r.success)
            && self.reports.iter().all(|r| r.success)
    }
}

impl Plan {
    /// Load a plan file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!("plan file not found: {}", path.display());
        }
        toml_loader::load_config(path)
    }

    /// Run every step in order.
    ///
    /// A template that fails to load, or aborts on a required resource,
    /// stops the plan.
    ///
    /// # Errors
    ///
    /// Returns the first hard executor failure.
    pub fn run(
        &self,
        executor: &mut TemplateExecutor,
        action: Action,
        state_dir: &Path,
        ctx: &Context,
    ) -> Result<PlanOutcome> {
        let mut outcome = PlanOutcome::default();
        for (index, step) in self.steps.iter().enumerate() {
            if ctx.is_cancelled() {
                ctx.log.warn("cancelled; remaining plan steps were not run");
                outcome.cancelled = true;
                break;
            }
            ctx.log
                .stage(&format!("Step {}/{}: {step}", index + 1, self.steps.len()));
            match step {
                Step::Template { template } => {
                    let result = executor
                        .invoke(template, action, state_dir, ctx)
                        .with_context(|| format!("plan step {}", index + 1))?;
                    let cancelled = result.state == RunState::Cancelled;
                    outcome.results.push(result);
                    if cancelled {
                        outcome.cancelled = true;
                        break;
                    }
                }
                Step::Action { run, args } => {
                    let report = run_action(step, run, args, state_dir, ctx);
                    if report.success {
                        ctx.log.info(&format!("{}: {}", report.step, report.message));
                    } else {
                        ctx.log.error(&format!("{}: {}", report.step, report.message));
                    }
                    outcome.reports.push(report);
                }
            }
        }
        Ok(outcome)
    }
}

fn run_action(
    step: &Step,
    program: &str,
    args: &[String],
    state_dir: &Path,
    ctx: &Context,
) -> StepReport {
    let label = step.to_string();
    if ctx.dry_run {
        ctx.log.dry_run(&format!("would {label}"));
        return StepReport {
            step: label,
            success: true,
            message: "dry run".to_string(),
        };
    }
    let root = state_dir.display().to_string();
    let env = [
        (BACKUP_ROOT_ENV, root.as_str()),
        (MACHINE_NAME_ENV, ctx.platform.machine_name.as_str()),
    ];
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    match ctx.executor.run_with_env(program, &arg_refs, &env) {
        Ok(result) if result.success => StepReport {
            step: label,
            success: true,
            message: first_line(&result.stdout).unwrap_or("ok").to_string(),
        },
        Ok(result) => StepReport {
            step: label,
            success: false,
            message: format!("exit {}: {}", result.code.unwrap_or(-1), result.detail()),
        },
        Err(e) => StepReport {
            step: label,
            success: false,
            message: format!("{e:#}"),
        },
    }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}
