use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan and apply cluster reconciliation from desired vs observed configuration", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Engine config file (defaults to ~/.config/converge/config.toml)
    #[arg(long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show classified changes between two configurations
    Diff(InputArgs),

    /// Show the ordered action plan
    Plan(InputArgs),

    /// Apply the plan against an in-memory copy of the observed configuration
    Simulate(SimulateArgs),

    /// Inspect engine configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Inputs
// ============================================================================

#[derive(Args)]
pub struct InputArgs {
    /// Desired configuration (TOML, or JSON with a .json extension)
    #[arg(short, long)]
    pub desired: PathBuf,

    /// Observed configuration; an empty cluster when omitted
    #[arg(short, long)]
    pub observed: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

// ============================================================================
// Simulate
// ============================================================================

#[derive(Args)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Inject failures for an action kind, e.g. add_nodes:2 (repeatable)
    #[arg(long, value_name = "KIND[:N]")]
    pub fail: Vec<String>,

    /// Category of injected failures
    #[arg(long, value_enum, default_value = "transient")]
    pub fail_as: FailureCategory,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Don't wait between retries
    #[arg(long)]
    pub no_wait: bool,

    /// Passes to run until nothing is left to do
    #[arg(short, long, default_value = "1")]
    pub passes: usize,

    /// Write the resulting observed configuration to this file
    #[arg(long)]
    pub write_state: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum FailureCategory {
    Transient,
    Conflict,
    NotFound,
    Rejected,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the effective engine configuration
    Show,

    /// Print the config file location
    Path,
}
