//! Simulation sessions.
//!
//! A session owns one agent channel, the sequencer guarding it, and the
//! endpoints bridged into the simulation. [`SessionCore`] holds the state
//! machine shared by the LTE and Wi-Fi sessions:
//!
//! ```text
//! Building --start--> Started --stop--> Stopped --clear--> Cleared
//!     \______________________________________clear___________^
//! ```

pub mod lte;
pub mod wifi;

use std::fmt;
use std::sync::Arc;

use opennet_core::config::{AgentConfig, PollPolicy, RestartBehavior};
use opennet_core::error::{NetError, Result};
use opennet_core::event::{Activity, EventEmitter, SessionEvent};
use opennet_core::mobility::{Mobility, Vector3};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{AgentChannel, Transport};
use crate::endpoint::{Endpoint, EndpointState, MigrationPlan};
use crate::host::EmulatedHost;
use crate::poll;
use crate::script::{
    boolean_value, call, float, global_bind, kw, list, set_attribute, string, string_value, uint,
    var, Statement,
};
use crate::sequencer::{Batch, Sequencer};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Topology and endpoints being added
    Building,
    /// Simulation worker running, endpoints migrated
    Started,
    /// Simulated time halted, worker finished
    Stopped,
    /// Agent torn down, channel closed
    Cleared,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Building => write!(f, "building"),
            SessionState::Started => write!(f, "started"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Cleared => write!(f, "cleared"),
        }
    }
}

/// Runtime options that are not part of the serializable configuration
#[derive(Default)]
pub struct SessionOptions {
    /// Cancels connect retries and polls
    pub cancel: CancellationToken,

    /// Use this transport instead of connecting to the agent over TCP
    pub transport: Option<Box<dyn Transport>>,
}

impl SessionOptions {
    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            transport: Some(transport),
        }
    }
}

/// Where the infrastructure host runs `<agent_command> start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AgentScope {
    Host,
    Root,
}

/// State machine and resources shared by all session kinds
pub struct SessionCore {
    id: String,
    kind: &'static str,
    infra: Arc<dyn EmulatedHost>,
    agent_command: String,
    channel: AgentChannel,
    sequencer: Sequencer,
    endpoints: Vec<Endpoint>,
    state: SessionState,
    poll: PollPolicy,
    restart: RestartBehavior,
    cancel: CancellationToken,
    events: EventEmitter,
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("endpoints", &self.endpoints.len())
            .field("channel", &self.channel)
            .finish()
    }
}

impl SessionCore {
    /// Start the agent on the infrastructure host and connect to it.
    pub(crate) async fn open(
        kind: &'static str,
        infra: Arc<dyn EmulatedHost>,
        agent: &AgentConfig,
        scope: AgentScope,
        poll: PollPolicy,
        restart: RestartBehavior,
        options: SessionOptions,
    ) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        tracing::info!(session = %id, kind, agent = %agent.endpoint(), "Opening session");

        let start = format!("{} start", agent.agent_command);
        match scope {
            AgentScope::Root => infra.rcmd(&start).await?,
            AgentScope::Host => infra.cmd(&start).await?,
        };

        let channel = match options.transport {
            Some(transport) => AgentChannel::from_transport(agent.endpoint(), transport),
            None => AgentChannel::connect(agent, &options.cancel).await?,
        };

        let events = EventEmitter::for_session(id.clone());
        events.emit(Activity::AgentConnected {
            peer: channel.peer().to_string(),
        });

        Ok(Self {
            id,
            kind,
            infra,
            agent_command: agent.agent_command.clone(),
            channel,
            sequencer: Sequencer::new(),
            endpoints: Vec::new(),
            state: SessionState::Building,
            poll,
            restart,
            cancel: options.cancel,
            events,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn infra(&self) -> &dyn EmulatedHost {
        self.infra.as_ref()
    }

    pub fn channel(&self) -> &AgentChannel {
        &self.channel
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Endpoints and topology may be added while building or started.
    pub(crate) fn ensure_mutable(&self) -> Result<()> {
        match self.state {
            SessionState::Building | SessionState::Started => Ok(()),
            state => Err(NetError::InvalidState(format!(
                "cannot add to a {} {} session",
                state, self.kind
            ))),
        }
    }

    pub(crate) fn validate(&self, batch: &Batch) -> Result<()> {
        self.sequencer.validate(batch)
    }

    pub(crate) async fn emit_preamble(&mut self, batch: &Batch) -> Result<()> {
        self.sequencer.emit_preamble(&mut self.channel, batch).await
    }

    pub(crate) async fn emit_setup(&mut self, batch: &Batch) -> Result<()> {
        self.sequencer.emit_setup(&mut self.channel, batch).await
    }

    pub(crate) async fn emit(&mut self, batch: &Batch) -> Result<()> {
        self.sequencer.emit(&mut self.channel, batch).await
    }

    /// Provision an endpoint's TAP device, then send `device`, the batch
    /// creating its simulated device. Returns the endpoint index, which is
    /// also the index of the simulator bridge the caller must append next.
    ///
    /// Nothing reaches the agent if provisioning fails, and the TAP is
    /// deleted again if the device batch cannot be sent.
    pub(crate) async fn add_endpoint(
        &mut self,
        host: Arc<dyn EmulatedHost>,
        port: u32,
        plan: MigrationPlan,
        device: &Batch,
    ) -> Result<usize> {
        let index = self.endpoints.len();
        let endpoint = Endpoint::provision(host, port, index, plan).await?;
        if let Err(e) = self.emit(device).await {
            let name = endpoint.name().to_string();
            if let Err(undo) = endpoint.discard().await {
                tracing::warn!(endpoint = %name, error = %undo, "Failed to delete TAP");
            }
            return Err(e);
        }
        self.events.emit(Activity::EndpointProvisioned {
            endpoint: endpoint.name().to_string(),
            bridge: index,
        });
        self.endpoints.push(endpoint);
        Ok(index)
    }

    /// Start the session with no infrastructure commands around migration.
    pub async fn start(&mut self) -> Result<()> {
        self.start_with(&[], &[]).await
    }

    /// Start the simulation worker and migrate endpoints.
    ///
    /// `prepare` runs on the infrastructure host (root namespace) before
    /// the worker is launched; `restore` runs after the migration pass,
    /// even when a migration failed.
    ///
    /// If the agent reports the worker already alive on the first start,
    /// `nsThread.start ()` is not sent again, but the session still moves
    /// to `Started` and provisioned endpoints are still migrated. A start
    /// on a started session follows the configured [`RestartBehavior`].
    pub async fn start_with(&mut self, prepare: &[&str], restore: &[&str]) -> Result<()> {
        match self.state {
            SessionState::Building => {}
            SessionState::Started => return self.restart_started(prepare, restore).await,
            state => {
                return Err(NetError::InvalidState(format!(
                    "cannot start a {} session",
                    state
                )))
            }
        }

        let liveness = liveness_query();
        self.sequencer.check(&liveness)?;
        let alive = poll::ask(&mut self.channel, &liveness, &self.poll, &self.cancel).await?;

        self.run_infra(prepare).await?;
        if alive {
            tracing::info!(session = %self.id, "Simulation worker is already running");
        } else {
            tracing::info!(session = %self.id, "Starting simulation worker");
            let launch = Batch::from(vec![Statement::eval(var("nsThread").method("start", vec![]))]);
            if let Err(e) = self.emit(&launch).await {
                self.run_infra(restore).await?;
                return Err(e);
            }
        }
        self.state = SessionState::Started;

        let migrated = self.migrate_pending().await;
        let restored = self.run_infra(restore).await;
        let migrated = migrated?;
        restored?;

        self.events.emit(Activity::SessionStarted {
            kind: self.kind.to_string(),
            migrated,
        });
        tracing::info!(session = %self.id, migrated, "Session started");
        Ok(())
    }

    async fn restart_started(&mut self, prepare: &[&str], restore: &[&str]) -> Result<()> {
        let pending = self.pending();
        match self.restart {
            RestartBehavior::Ignore => {
                if pending > 0 {
                    tracing::warn!(
                        session = %self.id,
                        pending,
                        "Session already started, later endpoints stay unmigrated"
                    );
                } else {
                    tracing::debug!(session = %self.id, "Session already started");
                }
                Ok(())
            }
            RestartBehavior::MigratePending => {
                if pending == 0 {
                    return Ok(());
                }
                self.run_infra(prepare).await?;
                let migrated = self.migrate_pending().await;
                let restored = self.run_infra(restore).await;
                let migrated = migrated?;
                restored?;
                tracing::info!(session = %self.id, migrated, "Pending endpoints migrated");
                Ok(())
            }
        }
    }

    /// Endpoints still waiting for migration.
    pub fn pending(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.state() == EndpointState::Provisioned)
            .count()
    }

    /// Migrate every provisioned endpoint in insertion order.
    async fn migrate_pending(&mut self) -> Result<usize> {
        let mut migrated = 0;
        for endpoint in self
            .endpoints
            .iter_mut()
            .filter(|e| e.state() == EndpointState::Provisioned)
        {
            endpoint
                .migrate(
                    &mut self.channel,
                    &self.sequencer,
                    &self.poll,
                    &self.cancel,
                    &self.events,
                )
                .await?;
            migrated += 1;
        }
        Ok(migrated)
    }

    async fn run_infra(&self, commands: &[&str]) -> Result<()> {
        for command in commands {
            self.infra.rcmd(command).await?;
        }
        Ok(())
    }

    /// Halt simulated time and wait for the worker to finish.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            SessionState::Started => {}
            SessionState::Stopped => return Ok(()),
            state => {
                return Err(NetError::InvalidState(format!(
                    "cannot stop a {} session",
                    state
                )))
            }
        }

        let halt = Batch::from(vec![Statement::eval(call(
            "Simulator.Stop",
            vec![call("Seconds", vec![uint(1)])],
        ))]);
        self.emit(&halt).await?;

        let polls = poll::wait_while(&mut self.channel, &liveness_query(), &self.poll, &self.cancel)
            .await?;
        self.state = SessionState::Stopped;
        self.events.emit(Activity::SessionStopped {
            kind: self.kind.to_string(),
        });
        tracing::info!(session = %self.id, polls, "Session stopped");
        Ok(())
    }

    /// Destroy the simulation, close the channel and stop the agent.
    pub async fn clear(&mut self) -> Result<()> {
        match self.state {
            SessionState::Building | SessionState::Stopped => {}
            SessionState::Started => {
                return Err(NetError::InvalidState(
                    "stop the session before clearing it".to_string(),
                ))
            }
            SessionState::Cleared => {
                return Err(NetError::InvalidState("session already cleared".to_string()))
            }
        }

        let teardown = Batch::from(vec![
            Statement::eval(call("Simulator.Destroy", vec![])),
            Statement::eval(call("exit", vec![])),
        ]);
        self.emit(&teardown).await?;
        self.channel.close().await?;
        self.infra
            .rcmd(&format!("{} stop", self.agent_command))
            .await?;

        self.state = SessionState::Cleared;
        self.events.emit(Activity::SessionCleared {
            kind: self.kind.to_string(),
        });
        tracing::info!(session = %self.id, "Session cleared");
        Ok(())
    }
}

/// `nsThread.isAlive ()` query
pub(crate) fn liveness_query() -> Statement {
    Statement::query(var("nsThread").method("isAlive", vec![]))
}

/// Realtime scheduling and checksums, common to every session.
pub(crate) fn simulator_globals() -> Vec<Statement> {
    vec![
        global_bind(
            "SimulatorImplementationType",
            string_value("ns3::RealtimeSimulatorImpl"),
        ),
        global_bind("ChecksumEnabled", boolean_value(true)),
    ]
}

/// The `run` function, the worker thread wrapping it, and the bridge list.
pub(crate) fn worker_statements() -> Vec<Statement> {
    vec![
        Statement::def(
            "run",
            vec![
                Statement::eval(call(
                    "Simulator.Stop",
                    vec![call("Seconds", vec![uint(86400)])],
                )),
                Statement::eval(call("Simulator.Run", vec![])),
            ],
        ),
        Statement::assign("nsThread", call("Thread", vec![kw("target", var("run"))])),
        Statement::assign("tapBridges", list(vec![])),
    ]
}

fn vector(v: Vector3) -> crate::script::Expr {
    call("Vector", vec![float(v.0), float(v.1), float(v.2)])
}

/// A fresh `nsNode` with the given mobility installed through `helper`.
pub(crate) fn node_statements(helper: &str, mobility: &Mobility) -> Vec<Statement> {
    let mut out = vec![
        Statement::assign("nsNode", call("Node", vec![])),
        Statement::eval(
            var(helper).method("SetMobilityModel", vec![string(mobility.model.type_id())]),
        ),
        Statement::eval(var(helper).method("Install", vec![var("nsNode")])),
    ];

    let model_lookup = || {
        Statement::assign(
            "mm",
            var("nsNode").method("GetObject", vec![call("MobilityModel.GetTypeId", vec![])]),
        )
    };
    if let Some(position) = mobility.position {
        out.push(model_lookup());
        out.push(Statement::eval(
            var("mm").method("SetPosition", vec![vector(position)]),
        ));
    }
    if let Some(velocity) = mobility.effective_velocity() {
        out.push(model_lookup());
        out.push(Statement::eval(
            var("mm").method("SetVelocity", vec![vector(velocity)]),
        ));
    }
    out
}

/// Bridge `nsDevice` on `nsNode` to the TAP named `device_name`, and
/// append the bridge to `tapBridges`.
pub(crate) fn tap_bridge_statements(mode: &str, device_name: &str) -> Vec<Statement> {
    vec![
        Statement::assign("tapBridgeHelper", call("TapBridgeHelper", vec![])),
        set_attribute("tapBridgeHelper", "Mode", string_value(mode)),
        set_attribute("tapBridgeHelper", "DeviceName", string_value(device_name)),
        Statement::assign("macAddress", call("Mac48Address.Allocate", vec![])),
        set_attribute(
            "tapBridgeHelper",
            "MacAddress",
            call("Mac48AddressValue", vec![var("macAddress")]),
        ),
        Statement::assign(
            "tb",
            var("tapBridgeHelper").method("Install", vec![var("nsNode"), var("nsDevice")]),
        ),
        Statement::eval(var("tapBridges").method("append", vec![var("tb")])),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_all(statements: &[Statement]) -> Vec<String> {
        statements
            .iter()
            .map(|s| s.render().unwrap().trim_end().to_string())
            .collect()
    }

    #[test]
    fn test_node_statements_fixed_position() {
        let lines = render_all(&node_statements(
            "mobility",
            &Mobility::fixed(Vector3(10.0, 0.0, 1.5)),
        ));
        assert_eq!(
            lines,
            vec![
                "nsNode = Node ()",
                "mobility.SetMobilityModel (\"ns3::ConstantPositionMobilityModel\")",
                "mobility.Install (nsNode)",
                "mm = nsNode.GetObject (MobilityModel.GetTypeId ())",
                "mm.SetPosition (Vector (10.0, 0.0, 1.5))",
            ]
        );
    }

    #[test]
    fn test_velocity_only_for_constant_velocity() {
        let mut mobility = Mobility::fixed(Vector3(0.0, 0.0, 0.0));
        mobility.velocity = Some(Vector3(1.0, 0.0, 0.0));
        let lines = render_all(&node_statements("mobilityhelper", &mobility));
        assert!(!lines.iter().any(|l| l.contains("SetVelocity")));

        let mobility = Mobility::moving(Vector3(0.0, 0.0, 0.0), Vector3(2.5, 0.0, 0.0));
        let lines = render_all(&node_statements("mobilityhelper", &mobility));
        assert_eq!(lines.last().unwrap(), "mm.SetVelocity (Vector (2.5, 0.0, 0.0))");
    }

    #[test]
    fn test_worker_statements() {
        let lines = render_all(&worker_statements());
        assert_eq!(
            lines,
            vec![
                "def run ():\n    Simulator.Stop (Seconds (86400))\n    Simulator.Run ()",
                "nsThread = Thread (target = run)",
                "tapBridges = []",
            ]
        );
    }

    #[test]
    fn test_tap_bridge_builds_before_append() {
        let lines = render_all(&tap_bridge_statements("UseLocal", "h1-eth0"));
        assert_eq!(lines[1], "tapBridgeHelper.SetAttribute (\"Mode\", StringValue (\"UseLocal\"))");
        assert_eq!(lines[5], "tb = tapBridgeHelper.Install (nsNode, nsDevice)");
        assert_eq!(lines[6], "tapBridges.append (tb)");
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Building.to_string(), "building");
        assert_eq!(SessionState::Cleared.to_string(), "cleared");
    }
}
