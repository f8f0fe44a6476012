//! CLI command definitions and dispatch.

mod plan;
mod run;
mod validate;
mod version;

use clap::{ArgAction, Parser, Subcommand};

/// OpenNet - drive ns-3 LTE and Wi-Fi networks bridged into emulated hosts.
#[derive(Parser)]
#[command(name = "opennet", version, about)]
pub struct Cli {
    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build a scenario against the agent, start it, and tear it down on Ctrl-C
    Run(run::RunArgs),
    /// Show the statements and host commands a scenario would issue
    Plan(plan::PlanArgs),
    /// Check a scenario file without contacting the agent
    Validate(validate::ValidateArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Log filter for the requested verbosity when `RUST_LOG` is unset.
pub fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run(args) => run::execute(args).await,
        Command::Plan(args) => plan::execute(args).await,
        Command::Validate(args) => validate::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
