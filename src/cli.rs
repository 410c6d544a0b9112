use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::engine::Action;

/// Top-level CLI entry point for the configuration state engine.
#[derive(Parser, Debug)]
#[command(
    name = "snapstate",
    about = "Capture and restore system configuration from templates",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub global: GlobalOpts,
}

/// Options shared across all subcommands.
#[derive(Parser, Debug, Clone, Default)]
pub struct GlobalOpts {
    /// Settings file (defaults to $SNAPSTATE_CONFIG or the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Template directory
    #[arg(short, long, global = true)]
    pub templates: Option<PathBuf>,

    /// Snapshot directory holding state records
    #[arg(short, long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Preview changes without writing anything
    #[arg(short = 'd', long, global = true)]
    pub dry_run: bool,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture the state a template describes into the snapshot directory
    Backup(TemplateOpts),
    /// Apply a snapshot back onto this system
    Restore(TemplateOpts),
    /// Load and validate a template and its ancestors
    Validate(TemplateOpts),
    /// Report the privileges a template needs
    Analyze(TemplateOpts),
    /// Print a template after inheritance
    Show(TemplateOpts),
    /// List the state records in the snapshot directory
    Records,
    /// Run an execution plan
    Plan(PlanOpts),
    /// Print version information
    Version,
}

impl Command {
    /// Name used for the log file.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Backup(_) => "backup",
            Self::Restore(_) => "restore",
            Self::Validate(_) => "validate",
            Self::Analyze(_) => "analyze",
            Self::Show(_) => "show",
            Self::Records => "records",
            Self::Plan(_) => "plan",
            Self::Version => "version",
        }
    }
}

/// A subcommand that works on one template.
#[derive(Parser, Debug, Clone)]
pub struct TemplateOpts {
    /// Template name (file stem under the template directory)
    pub template: String,

    /// Print machine-readable JSON instead of text
    #[arg(long)]
    pub json: bool,
}

/// Options for the `plan` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct PlanOpts {
    /// Plan file (TOML)
    pub file: PathBuf,

    /// Direction of every template step
    #[arg(short, long, value_enum)]
    pub action: Action,
}
