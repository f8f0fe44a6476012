//! `opennet version` command.

use clap::Args;
use opennet_core::config::{DEFAULT_AGENT_COMMAND, DEFAULT_AGENT_PORT};

#[derive(Args)]
pub struct VersionArgs;

fn banner() -> Vec<String> {
    vec![
        format!("opennet version {}", opennet_core::VERSION),
        format!("runtime {}", opennet_runtime::VERSION),
        format!(
            "agent protocol: python statements over tcp/{}, replies True|False",
            DEFAULT_AGENT_PORT
        ),
        format!("agent command: {}", DEFAULT_AGENT_COMMAND),
    ]
}

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    for line in banner() {
        println!("{line}");
    }
    Ok(())
}
