//! `opennet plan` command: dry-run a scenario against a recorded agent.
//!
//! Every host command and agent statement is captured in order instead of
//! being executed, with the simulated worker and bridges answering the way
//! a healthy agent does.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use opennet_core::error::Result;
use opennet_runtime::dry_run::CommandLog;
use opennet_runtime::{RecordingHost, RecordingTransport, SessionOptions};
use serde::Serialize;

use crate::output::{new_table, scope_label, statement_cell};
use crate::scenario::{endpoint_address, ScenarioConfig};

#[derive(Args)]
pub struct PlanArgs {
    /// Scenario file (YAML)
    pub scenario: PathBuf,

    /// Include stop and clear
    #[arg(long)]
    pub teardown: bool,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,

    /// Truncate statements to this many characters in table output
    #[arg(long, default_value = "100")]
    pub width: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct Plan {
    endpoints: Vec<PlannedEndpoint>,
    statements: Vec<String>,
    commands: Vec<PlannedCommand>,
}

#[derive(Debug, Serialize)]
struct PlannedEndpoint {
    name: String,
    host: String,
    address: Option<String>,
    state: String,
}

#[derive(Debug, Serialize)]
struct PlannedCommand {
    host: String,
    scope: &'static str,
    command: String,
}

pub(crate) async fn build_plan(scenario: &ScenarioConfig, teardown: bool) -> Result<Plan> {
    let log = CommandLog::new();
    let hosts = scenario.hosts_with(|spec| Arc::new(RecordingHost::for_spec(spec).sharing_log(&log)));
    let transport = RecordingTransport::healthy_agent();
    let transcript = transport.log();

    let mut session = scenario
        .open(&hosts, SessionOptions::with_transport(Box::new(transport)))
        .await?;
    session.start().await?;

    let endpoints = session
        .endpoints()
        .iter()
        .map(|e| PlannedEndpoint {
            name: e.name().to_string(),
            host: e.host().name().to_string(),
            address: endpoint_address(e).map(|ip| ip.to_string()),
            state: e.state().to_string(),
        })
        .collect();

    if teardown {
        session.stop().await?;
        session.clear().await?;
    }

    Ok(Plan {
        endpoints,
        statements: transcript.statements(),
        commands: log
            .commands()
            .into_iter()
            .map(|c| PlannedCommand {
                host: c.host,
                scope: scope_label(c.scope),
                command: c.command,
            })
            .collect(),
    })
}

pub async fn execute(args: PlanArgs) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let scenario = ScenarioConfig::load(&args.scenario)?;
    let plan = build_plan(&scenario, args.teardown).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("{}\n", scenario.summary());

    let mut endpoints = new_table(&["ENDPOINT", "HOST", "ADDRESS", "STATE"]);
    for e in &plan.endpoints {
        endpoints.add_row(vec![
            e.name.clone(),
            e.host.clone(),
            e.address.clone().unwrap_or_else(|| "-".to_string()),
            e.state.clone(),
        ]);
    }
    println!("{endpoints}\n");

    let mut statements = new_table(&["#", "STATEMENT"]);
    for (i, s) in plan.statements.iter().enumerate() {
        statements.add_row(vec![i.to_string(), statement_cell(s, args.width)]);
    }
    println!("{statements}\n");

    let mut commands = new_table(&["HOST", "SCOPE", "COMMAND"]);
    for c in &plan.commands {
        commands.add_row(vec![c.host.clone(), c.scope.to_string(), c.command.clone()]);
    }
    println!("{commands}");
    Ok(())
}
