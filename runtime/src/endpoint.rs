//! Endpoint lifecycle.
//!
//! An endpoint is a TAP interface bridged to one simulated device. Its
//! OS-level device is created (and parked in the root namespace) when the
//! endpoint is provisioned, before the simulator-side bridge exists. Once
//! the bridge reports its link up, the endpoint is migrated into its
//! host's namespace and addressed.
//!
//! Migration runs a fixed list of steps. If one fails, the steps already
//! applied are undone in reverse order and the endpoint stays
//! provisioned; if an undo fails too, the endpoint is marked failed.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use opennet_core::config::PollPolicy;
use opennet_core::error::{NetError, Result};
use opennet_core::event::{Activity, EventEmitter};
use opennet_core::network::IfaceAddr;
use tokio_util::sync::CancellationToken;

use crate::channel::AgentChannel;
use crate::host::EmulatedHost;
use crate::poll;
use crate::script::{var, Statement};
use crate::sequencer::Sequencer;

/// Plain TAP interface for simulator infrastructure (EPC taps, eNB taps).
/// It never migrates.
#[derive(Debug, Clone)]
pub struct TapIntf {
    name: String,
    host: String,
    port: u32,
}

impl TapIntf {
    pub async fn create(host: &dyn EmulatedHost, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let port = host.new_port();
        host.cmd(&format!("ip tuntap add {} mode tap", name)).await?;
        tracing::debug!(host = %host.name(), intf = %name, port, "Infrastructure tap created");
        Ok(Self {
            name,
            host: host.name().to_string(),
            port,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u32 {
        self.port
    }
}

/// Endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// TAP exists in the root namespace and is bridged in the simulator
    Provisioned,
    /// Moved into its host's namespace and addressed
    Migrated,
    /// A migration step and its undo both failed
    Failed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointState::Provisioned => write!(f, "provisioned"),
            EndpointState::Migrated => write!(f, "migrated"),
            EndpointState::Failed => write!(f, "failed"),
        }
    }
}

/// Addressing applied after the namespace move
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationPlan {
    pub address: Option<IfaceAddr>,
    pub gateway: Option<Ipv4Addr>,
    /// Pin the gateway to a null MAC so no ARP traffic reaches the simulation
    pub pin_gateway_arp: bool,
    /// Drop the subnet route installed by the address assignment
    pub drop_subnet_route: bool,
}

impl MigrationPlan {
    /// UE endpoint: address, default route via the gateway, null-MAC ARP
    /// entry for the gateway, subnet route removed.
    pub fn ue(address: IfaceAddr, gateway: Ipv4Addr) -> Self {
        Self {
            address: Some(address),
            gateway: Some(gateway),
            pin_gateway_arp: true,
            drop_subnet_route: true,
        }
    }

    /// Wi-Fi endpoint: optional address only.
    pub fn wifi(address: Option<IfaceAddr>) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    fn steps(&self) -> Vec<MigrationStep> {
        let mut steps = vec![MigrationStep::MoveToNamespace, MigrationStep::LinkUp];
        if let Some(addr) = self.address {
            steps.push(MigrationStep::AssignAddress(addr));
        }
        if let Some(gw) = self.gateway {
            steps.push(MigrationStep::DefaultRoute(gw));
            if self.pin_gateway_arp {
                steps.push(MigrationStep::PinGatewayArp(gw));
            }
        }
        if let (true, Some(addr)) = (self.drop_subnet_route, self.address) {
            steps.push(MigrationStep::DropSubnetRoute(addr));
        }
        steps
    }
}

/// One OS mutation of a migration
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MigrationStep {
    MoveToNamespace,
    LinkUp,
    AssignAddress(IfaceAddr),
    DefaultRoute(Ipv4Addr),
    PinGatewayArp(Ipv4Addr),
    DropSubnetRoute(IfaceAddr),
}

/// Where a step's command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Root,
    Host,
}

impl MigrationStep {
    pub fn label(&self) -> &'static str {
        match self {
            MigrationStep::MoveToNamespace => "move",
            MigrationStep::LinkUp => "link-up",
            MigrationStep::AssignAddress(_) => "address",
            MigrationStep::DefaultRoute(_) => "default-route",
            MigrationStep::PinGatewayArp(_) => "gateway-arp",
            MigrationStep::DropSubnetRoute(_) => "subnet-route",
        }
    }

    fn apply(&self, intf: &str, target: &str) -> (Side, String) {
        match self {
            MigrationStep::MoveToNamespace => {
                (Side::Root, format!("ip link set dev {} netns {}", intf, target))
            }
            MigrationStep::LinkUp => (Side::Host, format!("ip link set dev {} up", intf)),
            MigrationStep::AssignAddress(addr) => {
                (Side::Host, format!("ip addr add dev {} {}", intf, addr))
            }
            MigrationStep::DefaultRoute(gw) => {
                (Side::Host, format!("ip route add default via {}", gw))
            }
            MigrationStep::PinGatewayArp(gw) => {
                (Side::Host, format!("arp -s {} 00:00:00:00:00:00", gw))
            }
            MigrationStep::DropSubnetRoute(addr) => {
                (Side::Host, format!("ip route del {}", addr.subnet_route()))
            }
        }
    }

    fn undo(&self, intf: &str) -> (Side, String) {
        match self {
            // Issued inside the host, it hands the interface back to PID 1
            MigrationStep::MoveToNamespace => {
                (Side::Host, format!("ip link set dev {} netns 1", intf))
            }
            MigrationStep::LinkUp => (Side::Host, format!("ip link set dev {} down", intf)),
            MigrationStep::AssignAddress(addr) => {
                (Side::Host, format!("ip addr del dev {} {}", intf, addr))
            }
            MigrationStep::DefaultRoute(gw) => {
                (Side::Host, format!("ip route del default via {}", gw))
            }
            MigrationStep::PinGatewayArp(gw) => (Side::Host, format!("arp -d {}", gw)),
            MigrationStep::DropSubnetRoute(addr) => (
                Side::Host,
                format!("ip route add {} dev {}", addr.subnet_route(), intf),
            ),
        }
    }
}

fn tap_delete(name: &str) -> String {
    format!("ip tuntap del {} mode tap", name)
}

/// TAP interface bridged to a simulated device
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    host: Arc<dyn EmulatedHost>,
    port: u32,
    bridge_index: usize,
    plan: MigrationPlan,
    state: EndpointState,
}

impl Endpoint {
    /// Interface name for `port` on `host`, e.g. `h1-eth0`.
    pub fn interface_name(host: &dyn EmulatedHost, port: u32) -> String {
        format!("{}-eth{}", host.name(), port)
    }

    /// Create the TAP inside the host and park it in the root namespace.
    pub async fn provision(
        host: Arc<dyn EmulatedHost>,
        port: u32,
        bridge_index: usize,
        plan: MigrationPlan,
    ) -> Result<Self> {
        let name = Self::interface_name(host.as_ref(), port);
        host.cmd(&format!("ip tuntap add {} mode tap", name)).await?;
        if let Err(e) = host.cmd(&format!("ip link set dev {} netns 1", name)).await {
            if let Err(undo) = host.cmd(&tap_delete(&name)).await {
                tracing::warn!(endpoint = %name, error = %undo, "Failed to delete TAP");
            }
            return Err(e);
        }
        tracing::debug!(endpoint = %name, bridge = bridge_index, "Endpoint provisioned");
        Ok(Self {
            name,
            host,
            port,
            bridge_index,
            plan,
            state: EndpointState::Provisioned,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &dyn EmulatedHost {
        self.host.as_ref()
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn bridge_index(&self) -> usize {
        self.bridge_index
    }

    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    pub fn address(&self) -> Option<IfaceAddr> {
        self.plan.address
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Whether the interface lives in its owner's namespace.
    pub fn in_right_namespace(&self) -> bool {
        self.state == EndpointState::Migrated || !self.host.in_namespace()
    }

    /// Query asking whether this endpoint's bridge reports link up.
    pub fn readiness_query(&self) -> Statement {
        Statement::query(
            var("tapBridges")
                .index(self.bridge_index as i64)
                .method("IsLinkUp", vec![]),
        )
    }

    /// Run a command wherever the interface currently lives.
    pub async fn cmd(&self, command: &str) -> Result<String> {
        if self.in_right_namespace() {
            self.host.cmd(command).await
        } else {
            self.host.rcmd(command).await
        }
    }

    /// Delete the TAP of an endpoint whose simulator side was never built.
    pub async fn discard(self) -> Result<()> {
        self.cmd(&tap_delete(&self.name)).await?;
        tracing::debug!(endpoint = %self.name, "Endpoint discarded");
        Ok(())
    }

    /// Wait for the bridge, then move into the host namespace and address.
    pub async fn migrate(
        &mut self,
        channel: &mut AgentChannel,
        sequencer: &Sequencer,
        policy: &PollPolicy,
        cancel: &CancellationToken,
        emitter: &EventEmitter,
    ) -> Result<()> {
        match self.state {
            EndpointState::Migrated => return Err(NetError::AlreadyMigrated(self.name.clone())),
            EndpointState::Failed => {
                return Err(NetError::InvalidState(format!(
                    "endpoint {} is in a failed state",
                    self.name
                )))
            }
            EndpointState::Provisioned => {}
        }

        let query = self.readiness_query();
        sequencer.check(&query)?;
        let polls = poll::wait_until(channel, &query, policy, cancel).await?;
        tracing::debug!(endpoint = %self.name, polls, "Bridge link up");

        let target = self.host.namespace_target();
        let steps = self.plan.steps();
        for (done, step) in steps.iter().enumerate() {
            let (side, command) = step.apply(&self.name, &target);
            tracing::debug!(endpoint = %self.name, step = step.label(), "Migration step");
            if let Err(e) = self.run(side, &command).await {
                return Err(self.roll_back(&steps[..done], step, e, emitter).await);
            }
        }

        self.state = EndpointState::Migrated;
        tracing::info!(endpoint = %self.name, host = %self.host.name(), "Endpoint migrated");
        emitter.emit(Activity::EndpointMigrated {
            endpoint: self.name.clone(),
            host: self.host.name().to_string(),
            address: self.plan.address.map(|a| a.to_string()),
        });
        Ok(())
    }

    async fn run(&self, side: Side, command: &str) -> Result<String> {
        match side {
            Side::Root => self.host.rcmd(command).await,
            Side::Host => self.host.cmd(command).await,
        }
    }

    async fn roll_back(
        &mut self,
        applied: &[MigrationStep],
        failed: &MigrationStep,
        cause: NetError,
        emitter: &EventEmitter,
    ) -> NetError {
        tracing::warn!(
            endpoint = %self.name,
            step = failed.label(),
            error = %cause,
            "Migration step failed, rolling back"
        );

        for step in applied.iter().rev() {
            let (side, command) = step.undo(&self.name);
            if let Err(e) = self.run(side, &command).await {
                self.state = EndpointState::Failed;
                tracing::error!(
                    endpoint = %self.name,
                    step = step.label(),
                    error = %e,
                    "Rollback failed"
                );
                return NetError::Inconsistent {
                    endpoint: self.name.clone(),
                    message: format!(
                        "{} failed ({}); undoing {} failed ({})",
                        failed.label(),
                        cause,
                        step.label(),
                        e
                    ),
                };
            }
        }

        emitter.emit(Activity::EndpointRolledBack {
            endpoint: self.name.clone(),
            step: failed.label().to_string(),
        });
        NetError::Migration {
            endpoint: self.name.clone(),
            step: failed.label().to_string(),
            message: cause.to_string(),
        }
    }
}
