//! `opennet validate` command.

use std::path::PathBuf;

use clap::Args;

use crate::scenario::ScenarioConfig;

#[derive(Args)]
pub struct ValidateArgs {
    /// Scenario file (YAML)
    pub scenario: PathBuf,
}

pub async fn execute(args: ValidateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = ScenarioConfig::load(&args.scenario)?;
    println!("{}", scenario.summary());
    Ok(())
}
