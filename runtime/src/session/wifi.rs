//! 802.11g session: ad-hoc nodes, access points and stations on one YANS
//! channel, each bridged to a TAP on its emulated host.

use std::sync::Arc;

use opennet_core::config::WifiConfig;
use opennet_core::error::{NetError, Result};
use opennet_core::event::SessionEvent;
use opennet_core::mobility::Mobility;
use opennet_core::network::IfaceAddr;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{
    node_statements, simulator_globals, tap_bridge_statements, worker_statements, AgentScope,
    SessionCore, SessionOptions, SessionState,
};
use crate::endpoint::{Endpoint, MigrationPlan};
use crate::host::EmulatedHost;
use crate::script::{
    boolean_value, call, float, global, string, uint, uinteger_value, var, Expr, Statement,
};
use crate::sequencer::Batch;

pub const DEFAULT_SSID: &str = "default-ssid";
pub const DEFAULT_CHANNEL: u8 = 1;

/// MAC role of a simulated Wi-Fi node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum WifiRole {
    Adhoc,
    AccessPoint {
        #[serde(default = "default_channel")]
        channel: u8,
        #[serde(default = "default_ssid")]
        ssid: String,
    },
    Station {
        #[serde(default = "default_channel")]
        channel: u8,
        #[serde(default = "default_ssid")]
        ssid: String,
    },
}

fn default_channel() -> u8 {
    DEFAULT_CHANNEL
}

fn default_ssid() -> String {
    DEFAULT_SSID.to_string()
}

impl WifiRole {
    fn validate(&self) -> Result<()> {
        match self {
            WifiRole::Adhoc => Ok(()),
            WifiRole::AccessPoint { channel, ssid } | WifiRole::Station { channel, ssid } => {
                if !(1..=14).contains(channel) {
                    return Err(NetError::InvalidParameter(format!(
                        "802.11g channel {} out of range (1-14)",
                        channel
                    )));
                }
                if ssid.is_empty() {
                    return Err(NetError::InvalidParameter("ssid must not be empty".to_string()));
                }
                Ok(())
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            WifiRole::Adhoc => "adhoc",
            WifiRole::AccessPoint { .. } => "ap",
            WifiRole::Station { .. } => "sta",
        }
    }

    /// `machelper.SetType (...)` and, for infrastructure roles, the channel.
    fn mac_statements(&self) -> Vec<Statement> {
        let set_type = |args: Vec<Expr>| Statement::eval(var("machelper").method("SetType", args));
        let channel_number = |channel: u8| {
            Statement::eval(var("phyhelper").method(
                "Set",
                vec![string("ChannelNumber"), uinteger_value(channel.into())],
            ))
        };
        let ssid_value = |ssid: &str| call("SsidValue", vec![call("Ssid", vec![string(ssid)])]);

        match self {
            WifiRole::Adhoc => vec![set_type(vec![string("ns3::AdhocWifiMac")])],
            WifiRole::AccessPoint { channel, ssid } => vec![
                set_type(vec![
                    string("ns3::ApWifiMac"),
                    string("Ssid"),
                    ssid_value(ssid),
                    string("BeaconGeneration"),
                    boolean_value(true),
                    string("BeaconInterval"),
                    call("TimeValue", vec![call("Seconds", vec![float(2.5)])]),
                ]),
                channel_number(*channel),
            ],
            WifiRole::Station { channel, ssid } => vec![
                set_type(vec![
                    string("ns3::StaWifiMac"),
                    string("Ssid"),
                    ssid_value(ssid),
                    string("ScanType"),
                    call("EnumValue", vec![global("StaWifiMac.ACTIVE")]),
                ]),
                channel_number(*channel),
            ],
        }
    }
}

/// Wi-Fi network session
#[derive(Debug)]
pub struct WifiSession {
    core: SessionCore,
    config: WifiConfig,
}

impl WifiSession {
    /// Start the agent on the root switch, connect, and build the channel.
    pub async fn new(config: WifiConfig, root_switch: Arc<dyn EmulatedHost>) -> Result<Self> {
        Self::with_options(config, root_switch, SessionOptions::default()).await
    }

    pub async fn with_options(
        config: WifiConfig,
        root_switch: Arc<dyn EmulatedHost>,
        options: SessionOptions,
    ) -> Result<Self> {
        config.validate()?;
        let mut core = SessionCore::open(
            "wifi",
            root_switch,
            &config.agent,
            AgentScope::Host,
            config.poll.clone(),
            config.restart,
            options,
        )
        .await?;
        core.emit_setup(&setup_batch(&config)).await?;
        tracing::info!(session = %core.id(), qos = config.enable_qos, "Wi-Fi session built");
        Ok(Self { core, config })
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    pub fn config(&self) -> &WifiConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.core.endpoints()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.subscribe()
    }

    pub async fn add_adhoc(
        &mut self,
        host: Arc<dyn EmulatedHost>,
        mobility: &Mobility,
        address: Option<IfaceAddr>,
    ) -> Result<usize> {
        self.add_node(host, &WifiRole::Adhoc, mobility, address).await
    }

    pub async fn add_ap(
        &mut self,
        host: Arc<dyn EmulatedHost>,
        channel: u8,
        ssid: &str,
        mobility: &Mobility,
        address: Option<IfaceAddr>,
    ) -> Result<usize> {
        let role = WifiRole::AccessPoint {
            channel,
            ssid: ssid.to_string(),
        };
        self.add_node(host, &role, mobility, address).await
    }

    pub async fn add_sta(
        &mut self,
        host: Arc<dyn EmulatedHost>,
        channel: u8,
        ssid: &str,
        mobility: &Mobility,
        address: Option<IfaceAddr>,
    ) -> Result<usize> {
        let role = WifiRole::Station {
            channel,
            ssid: ssid.to_string(),
        };
        self.add_node(host, &role, mobility, address).await
    }

    /// Add one bridged Wi-Fi node. Returns its endpoint index.
    pub async fn add_node(
        &mut self,
        host: Arc<dyn EmulatedHost>,
        role: &WifiRole,
        mobility: &Mobility,
        address: Option<IfaceAddr>,
    ) -> Result<usize> {
        self.core.ensure_mutable()?;
        role.validate()?;

        let port = host.new_port();
        let name = Endpoint::interface_name(host.as_ref(), port);

        let mut device = Batch::new();
        device
            .extend(role.mac_statements())
            .extend(node_statements("mobilityhelper", mobility))
            .push(Statement::assign(
                "wifiDev",
                var("wifihelper")
                    .method(
                        "Install",
                        vec![var("phyhelper"), var("machelper"), var("nsNode")],
                    )
                    .method("Get", vec![uint(0)]),
            ));

        let mut bridge = Batch::new();
        bridge
            .push(Statement::assign("nsDevice", var("wifiDev")))
            .extend(tap_bridge_statements("UseLocal", &name));

        let mut combined = device.clone();
        combined.extend(bridge.statements().iter().cloned());
        self.core.validate(&combined)?;

        let index = self
            .core
            .add_endpoint(Arc::clone(&host), port, MigrationPlan::wifi(address), &device)
            .await?;
        self.core.emit(&bridge).await?;

        tracing::info!(
            host = %host.name(),
            endpoint = %name,
            role = role.label(),
            "Wi-Fi node added"
        );
        Ok(index)
    }

    /// Launch the simulation and migrate node endpoints. An already
    /// running worker is left alone, see [`SessionCore::start_with`].
    pub async fn start(&mut self) -> Result<()> {
        self.core.start().await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.core.stop().await
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.core.clear().await
    }
}

fn setup_batch(config: &WifiConfig) -> Batch {
    let mac_helper = if config.enable_qos {
        "QosWifiMacHelper.Default"
    } else {
        "NqosWifiMacHelper.Default"
    };

    let mut batch = Batch::new();
    batch
        .extend(simulator_globals())
        .extend([
            Statement::assign("wifihelper", call("WifiHelper.Default", vec![])),
            Statement::eval(
                var("wifihelper").method("SetStandard", vec![global("WIFI_PHY_STANDARD_80211g")]),
            ),
            Statement::assign("phyhelper", call("YansWifiPhyHelper.Default", vec![])),
            Statement::assign("channelhelper", call("YansWifiChannelHelper.Default", vec![])),
            Statement::eval(var("phyhelper").method(
                "SetChannel",
                vec![var("channelhelper").method("Create", vec![])],
            )),
            Statement::assign("machelper", call(mac_helper, vec![])),
            Statement::assign("mobilityhelper", call("MobilityHelper", vec![])),
        ])
        .extend(worker_statements());
    batch
}
