//! `opennet run` command: build, start, wait, stop, clear.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use opennet_runtime::{NetnsHost, SessionOptions, SessionState};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::output::endpoint_table;
use crate::scenario::{ScenarioConfig, Session};

#[derive(Args)]
pub struct RunArgs {
    /// Scenario file (YAML)
    pub scenario: PathBuf,

    /// Tear down after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration: Option<u64>,

    /// Exit without stopping the simulation
    #[arg(long)]
    pub keep: bool,
}

pub async fn execute(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = ScenarioConfig::load(&args.scenario)?;
    let hosts = scenario.hosts_with(|spec| Arc::new(NetnsHost::new(spec.clone())));

    // Ctrl-C while connecting or migrating abandons the wait
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    println!("Building {}...", scenario.summary());
    let options = SessionOptions {
        cancel: cancel.clone(),
        transport: None,
    };
    let mut session = match scenario.open(&hosts, options).await {
        Ok(session) => session,
        Err(e) => {
            watcher.abort();
            return Err(e.into());
        }
    };
    let event_log = spawn_event_log(&session);

    let started = session.start().await;
    watcher.abort();
    if let Err(e) = started {
        if !cancel.is_cancelled() {
            teardown(&mut session).await;
        }
        event_log.abort();
        return Err(e.into());
    }

    println!("{}", endpoint_table(session.endpoints()));

    match args.duration {
        Some(secs) => {
            println!("Running for {secs}s. Press Ctrl-C to stop early.");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
        }
        None => {
            println!("Running. Press Ctrl-C to stop.");
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    if args.keep {
        println!("Leaving session {} running.", session.core().id());
        event_log.abort();
        return Ok(());
    }

    println!("\nStopping...");
    session.stop().await?;
    session.clear().await?;
    event_log.abort();
    println!("Session {} cleared.", session.core().id());
    Ok(())
}

/// Best-effort cleanup after a failed start.
async fn teardown(session: &mut Session) {
    if session.core().state() == SessionState::Started {
        if let Err(e) = session.stop().await {
            tracing::warn!(error = %e, "Failed to stop session");
            return;
        }
    }
    if let Err(e) = session.clear().await {
        tracing::warn!(error = %e, "Failed to clear session");
    }
}

fn spawn_event_log(session: &Session) -> JoinHandle<()> {
    let mut events = session.core().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::info!(event = event.key(), activity = ?event.activity, "Session event")
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
