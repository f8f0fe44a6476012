//! LTE session: one EPC built from a TAP-backed EPC helper, eNBs and UEs.
//!
//! In Master mode the session hosts the PGW/SGW/MME and allocates UE
//! addresses from host index 2 (index 1 is the gateway). In Slave mode it
//! attaches to a master EPC through the slave TAP and allocates from 1.

use std::net::Ipv4Addr;
use std::sync::Arc;

use opennet_core::config::{LteConfig, LteMode};
use opennet_core::error::{NetError, Result};
use opennet_core::event::SessionEvent;
use opennet_core::mobility::Mobility;
use opennet_core::network::{slave_address_base, AddressCursor, IfaceAddr};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{
    node_statements, simulator_globals, tap_bridge_statements, worker_statements, AgentScope,
    SessionCore, SessionOptions, SessionState,
};
use crate::endpoint::{Endpoint, MigrationPlan, TapIntf};
use crate::host::EmulatedHost;
use crate::script::{
    boolean, call, double_value, float, global, log_component, set_default, string,
    string_value, uint, uinteger_value, var, Statement,
};
use crate::sequencer::Batch;

const MASTER_TAPS: [&str; 4] = ["pgwTap", "sgwTap", "mmeTap", "masterTap"];

const LOG_COMPONENTS: [(&str, &str); 6] = [
    ("TapEpcHelper", "LOG_LEVEL_ALL"),
    ("TapEpcMme", "LOG_LEVEL_ALL"),
    ("EpcSgwPgwApplication", "LOG_LEVEL_ALL"),
    ("FdNetDevice", "LOG_LEVEL_DEBUG"),
    ("TeidDscpMapping", "LOG_LEVEL_LOGIC"),
    ("TapEpcEnbApplication", "LOG_LEVEL_ALL"),
];

const DISABLE_IPV6: &str = "sysctl -w net.ipv6.conf.all.disable_ipv6=1";
const ENABLE_IPV6: &str = "sysctl -w net.ipv6.conf.all.disable_ipv6=0";

/// Dedicated bearer for one UE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpsBearerSpec {
    pub local_port_start: u16,
    pub local_port_end: u16,
    pub remote_port_start: u16,
    pub remote_port_end: u16,
    /// QoS class identifier, a simulator constant
    pub qci: String,
}

impl Default for EpsBearerSpec {
    fn default() -> Self {
        Self {
            local_port_start: 0,
            local_port_end: 65535,
            remote_port_start: 0,
            remote_port_end: 65535,
            qci: "EpsBearer.NGBR_VIDEO_TCP_DEFAULT".to_string(),
        }
    }
}

impl EpsBearerSpec {
    fn validate(&self) -> Result<()> {
        if self.local_port_start > self.local_port_end
            || self.remote_port_start > self.remote_port_end
        {
            return Err(NetError::InvalidParameter(format!(
                "bearer port range inverted: local {}-{}, remote {}-{}",
                self.local_port_start,
                self.local_port_end,
                self.remote_port_start,
                self.remote_port_end
            )));
        }
        Ok(())
    }
}

/// LTE network session
#[derive(Debug)]
pub struct LteSession {
    core: SessionCore,
    config: LteConfig,
    cursor: AddressCursor,
    infra_taps: Vec<TapIntf>,
    ues: usize,
    enbs: usize,
}

impl LteSession {
    /// Start the agent on the EPC switch, connect, and build the EPC.
    pub async fn new(config: LteConfig, epc_switch: Arc<dyn EmulatedHost>) -> Result<Self> {
        Self::with_options(config, epc_switch, SessionOptions::default()).await
    }

    pub async fn with_options(
        config: LteConfig,
        epc_switch: Arc<dyn EmulatedHost>,
        options: SessionOptions,
    ) -> Result<Self> {
        config.validate()?;
        let mut core = SessionCore::open(
            "lte",
            Arc::clone(&epc_switch),
            &config.agent,
            AgentScope::Root,
            config.poll.clone(),
            config.restart,
            options,
        )
        .await?;

        let mut infra_taps = Vec::new();
        let first_host = match config.mode {
            LteMode::Master => {
                for name in MASTER_TAPS {
                    infra_taps.push(TapIntf::create(epc_switch.as_ref(), name).await?);
                }
                2
            }
            LteMode::Slave => {
                core.emit_preamble(&slave_preamble(&config)).await?;
                infra_taps.push(TapIntf::create(epc_switch.as_ref(), &config.slave_name).await?);
                1
            }
        };
        let cursor = AddressCursor::new(config.ue_ip_base, config.ue_prefix_len, first_host)?;

        core.emit_setup(&setup_batch(&config)).await?;
        tracing::info!(
            session = %core.id(),
            mode = %config.mode,
            tdf = config.tdf,
            "LTE session built"
        );

        Ok(Self {
            core,
            config,
            cursor,
            infra_taps,
            ues: 0,
            enbs: 0,
        })
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    pub fn config(&self) -> &LteConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.core.endpoints()
    }

    pub fn infra_taps(&self) -> &[TapIntf] {
        &self.infra_taps
    }

    pub fn ue_count(&self) -> usize {
        self.ues
    }

    pub fn enb_count(&self) -> usize {
        self.enbs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.subscribe()
    }

    /// Add an eNB whose S1/X2 traffic leaves the simulation through
    /// `intf_name` on `host`.
    pub async fn add_enb(
        &mut self,
        host: Arc<dyn EmulatedHost>,
        intf_name: &str,
        mobility: &Mobility,
    ) -> Result<()> {
        self.core.ensure_mutable()?;

        let mut batch = Batch::new();
        batch.extend(node_statements("mobility", mobility)).extend([
            Statement::assign(
                "enbLteDev",
                var("lteHelper").method("InstallEnbDevice", vec![node_container()]),
            ),
            Statement::eval(var("enbLteDevs").method("Add", vec![var("enbLteDev")])),
        ]);
        self.core.validate(&batch)?;

        let tap = TapIntf::create(host.as_ref(), intf_name).await?;
        self.core.emit(&batch).await?;
        self.infra_taps.push(tap);
        self.enbs += 1;
        tracing::info!(host = %host.name(), intf = intf_name, "eNB added");
        Ok(())
    }

    /// Add a UE attached to the EPC. Returns the address it will get and
    /// its UE index (for [`LteSession::add_eps_bearer`]).
    pub async fn add_ue(
        &mut self,
        host: Arc<dyn EmulatedHost>,
        mobility: &Mobility,
    ) -> Result<(Ipv4Addr, usize)> {
        self.core.ensure_mutable()?;

        let port = host.new_port();
        let name = Endpoint::interface_name(host.as_ref(), port);

        let mut device = Batch::new();
        device.extend(node_statements("mobility", mobility)).extend([
            Statement::assign(
                "ueLteDev",
                var("lteHelper").method("InstallUeDevice", vec![node_container()]),
            ),
            Statement::eval(var("ueLteDevs").method("Add", vec![var("ueLteDev")])),
            Statement::eval(var("internetStack").method("Install", vec![var("nsNode")])),
            Statement::eval(var("tapEpcHelper").method("AssignUeIpv4Address", vec![var("ueLteDev")])),
            Statement::assign(
                "gatewayMacAddr",
                var("tapEpcHelper").method("GetUeDefaultGatewayMacAddress", vec![]),
            ),
        ]);

        let mut bridge = Batch::new();
        bridge
            .push(Statement::assign(
                "nsDevice",
                var("ueLteDev").method("Get", vec![uint(0)]),
            ))
            .extend(tap_bridge_statements("ConfigureLocal", &name))
            .extend([
                Statement::assign(
                    "dev",
                    var("nsDevice").method(
                        "GetObject",
                        vec![call("LteUeNetDevice.GetTypeId", vec![])],
                    ),
                ),
                Statement::eval(var("dev").method("SetMacAddress", vec![var("macAddress")])),
                Statement::eval(
                    var("dev").method("SetGatewayMacAddress", vec![var("gatewayMacAddr")]),
                ),
            ]);

        let mut combined = device.clone();
        combined.extend(bridge.statements().iter().cloned());
        self.core.validate(&combined)?;

        let ip = self.cursor.allocate()?;
        let address = IfaceAddr::new(ip, self.config.ue_prefix_len)?;

        host.cmd(DISABLE_IPV6).await?;
        self.core
            .add_endpoint(
                Arc::clone(&host),
                port,
                MigrationPlan::ue(address, self.config.ue_gw_ip),
                &device,
            )
            .await?;
        // ueLteDevs now holds the device, whatever happens to the bridge
        let ue_index = self.ues;
        self.ues += 1;
        self.core.emit(&bridge).await?;

        tracing::info!(host = %host.name(), endpoint = %name, ip = %ip, ue_index, "UE added");
        Ok((ip, ue_index))
    }

    /// Activate a dedicated bearer for UE `ue_index` once UEs attach.
    pub async fn add_eps_bearer(&mut self, ue_index: usize, bearer: &EpsBearerSpec) -> Result<()> {
        self.core.ensure_mutable()?;
        if ue_index >= self.ues {
            return Err(NetError::InvalidParameter(format!(
                "no UE with index {} (session has {})",
                ue_index, self.ues
            )));
        }
        bearer.validate()?;

        let mut batch = Batch::new();
        batch.extend([
            Statement::assign("tft", call("EpcTft", vec![])),
            Statement::assign("pf", call("EpcTft.PacketFilter", vec![])),
            Statement::set_field("pf", "localPortStart", uint(bearer.local_port_start.into())),
            Statement::set_field("pf", "localPortEnd", uint(bearer.local_port_end.into())),
            Statement::set_field("pf", "remotePortStart", uint(bearer.remote_port_start.into())),
            Statement::set_field("pf", "remotePortEnd", uint(bearer.remote_port_end.into())),
            Statement::eval(var("tft").method("Add", vec![var("pf")])),
            Statement::assign("bearer", call("EpsBearer", vec![global(bearer.qci.as_str())])),
            Statement::eval(call(
                "Simulator.Schedule",
                vec![
                    call("Seconds", vec![var("attachDelay")]),
                    global("LteHelper.ActivateDedicatedEpsBearer"),
                    var("lteHelper"),
                    var("ueLteDevs").method("Get", vec![uint(ue_index as u64)]),
                    var("bearer"),
                    var("tft"),
                ],
            )),
        ]);
        self.core.emit(&batch).await?;
        tracing::debug!(ue_index, qci = %bearer.qci, "EPS bearer scheduled");
        Ok(())
    }

    /// Launch the simulation and migrate UE endpoints. IPv6 is disabled on
    /// the EPC switch for the duration of the migration pass.
    ///
    /// A worker that is already running is not relaunched; its UEs are
    /// migrated all the same. See [`SessionCore::start_with`].
    pub async fn start(&mut self) -> Result<()> {
        self.core.start_with(&[DISABLE_IPV6], &[ENABLE_IPV6]).await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.core.stop().await
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.core.clear().await
    }
}

fn node_container() -> crate::script::Expr {
    call("NodeContainer", vec![var("nsNode")])
}

/// Defaults that must reach the EPC helper before it is constructed.
fn slave_preamble(config: &LteConfig) -> Batch {
    let base = slave_address_base(config.ue_ip_base).to_string();
    Batch::from(vec![
        set_default(
            "ns3::TapEpcHelper::EpcSlaveDeviceName",
            string_value(config.slave_name.as_str()),
        ),
        set_default(
            "ns3::TapEpcHelper::SlaveUeIpAddressBase",
            string_value(base.as_str()),
        ),
        set_default("ns3::TapEpcHelper::SlaveIpAddressBase", string_value(base)),
    ])
}

fn setup_batch(config: &LteConfig) -> Batch {
    let mut batch = Batch::new();

    for (component, level) in LOG_COMPONENTS {
        batch.push(log_component(component, level));
    }
    batch.extend(simulator_globals()).extend([
        set_default(
            "ns3::LteSpectrumPhy::CtrlErrorModelEnabled",
            call("BooleanValue", vec![boolean(false)]),
        ),
        set_default(
            "ns3::LteSpectrumPhy::DataErrorModelEnabled",
            call("BooleanValue", vec![boolean(false)]),
        ),
        set_default("ns3::TcpSocket::SegmentSize", uinteger_value(2440)),
        set_default(
            "ns3::LteHelper::Scheduler",
            string_value("ns3::FdMtFfMacScheduler"),
        ),
        set_default("ns3::TapEpcHelper::Mode", string_value(config.mode.to_string())),
        set_default("ns3::LteEnbPhy::TxPower", double_value(config.home_enb_tx_power)),
        Statement::eval(call(
            "LteTimeDilationFactor.SetTimeDilationFactor",
            vec![uint(config.tdf.into())],
        )),
    ]);
    if let Some(log_file) = &config.log_file {
        batch.push(set_default(
            "ns3::TapEpcHelper::LogFile",
            string_value(log_file.as_str()),
        ));
    }

    batch.extend([
        Statement::assign("attachDelay", float(config.attach_delay_s)),
        Statement::assign("lteHelper", call("LteHelper", vec![])),
        Statement::eval(var("lteHelper").method("SetImsiCounter", vec![uint(config.imsi_base)])),
        Statement::eval(
            var("lteHelper").method("SetCellIdCounter", vec![uint(config.cell_id_base.into())]),
        ),
        Statement::assign("tapEpcHelper", call("TapEpcHelper", vec![])),
        Statement::eval(var("lteHelper").method("SetEpcHelper", vec![var("tapEpcHelper")])),
        Statement::eval(var("tapEpcHelper").method("Initialize", vec![])),
    ]);

    if config.mode == LteMode::Master {
        batch.extend(pgw_statements(config));
    }

    batch.extend([
        Statement::assign("mobility", call("MobilityHelper", vec![])),
        Statement::assign("enbLteDevs", call("NetDeviceContainer", vec![])),
        Statement::assign("ueLteDevs", call("NetDeviceContainer", vec![])),
        Statement::assign("internetStack", call("InternetStackHelper", vec![])),
        Statement::eval(var("internetStack").method("SetIpv6StackInstall", vec![boolean(false)])),
        Statement::eval(call(
            "Simulator.Schedule",
            vec![
                call("Seconds", vec![var("attachDelay")]),
                global("LteHelper.Attach"),
                var("lteHelper"),
                var("ueLteDevs"),
            ],
        )),
    ]);
    batch.extend(worker_statements());
    batch
}

/// PGW TAP device and its address assignment (Master mode only).
fn pgw_statements(config: &LteConfig) -> Vec<Statement> {
    vec![
        Statement::assign("pgw", var("tapEpcHelper").method("GetPgwNode", vec![])),
        Statement::assign("tap", call("TapFdNetDeviceHelper", vec![])),
        Statement::eval(var("tap").method("SetDeviceName", vec![string("pgwTap")])),
        Statement::eval(
            var("tap").method("SetTapMacAddress", vec![call("Mac48Address.Allocate", vec![])]),
        ),
        Statement::assign("pgwDevice", var("tap").method("Install", vec![var("pgw")])),
        Statement::assign("ipv4Helper", call("Ipv4AddressHelper", vec![])),
        Statement::eval(var("ipv4Helper").method(
            "SetBase",
            vec![
                call("Ipv4Address", vec![string(config.pgw_ip_base.to_string())]),
                call("Ipv4Mask", vec![string(config.pgw_mask.to_string())]),
            ],
        )),
        Statement::assign(
            "pgwIpIfaces",
            var("ipv4Helper").method("Assign", vec![var("pgwDevice")]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::{CommandLog, RecordingHost, RecordingTransport, Transcript};
    use crate::endpoint::EndpointState;
    use crate::script::parse_float_literal;
    use opennet_core::config::{AgentConfig, RestartBehavior};
    use opennet_core::event::Activity;
    use opennet_core::mobility::Vector3;

    struct Rig {
        session: LteSession,
        sent: Transcript,
        commands: CommandLog,
        h1: Arc<RecordingHost>,
        h2: Arc<RecordingHost>,
    }

    async fn rig(config: LteConfig) -> Rig {
        let commands = CommandLog::new();
        let switch = Arc::new(RecordingHost::root("s1").sharing_log(&commands));
        let h1 = Arc::new(RecordingHost::namespaced("h1").sharing_log(&commands));
        let h2 = Arc::new(RecordingHost::namespaced("h2").sharing_log(&commands));
        let transport = RecordingTransport::healthy_agent();
        let sent = transport.log();
        let session = LteSession::with_options(
            config,
            switch,
            SessionOptions::with_transport(Box::new(transport)),
        )
        .await
        .unwrap();
        Rig {
            session,
            sent,
            commands,
            h1,
            h2,
        }
    }

    fn master() -> LteConfig {
        LteConfig::new(AgentConfig::new("127.0.0.1"))
    }

    fn slave() -> LteConfig {
        let mut config = master();
        config.mode = LteMode::Slave;
        config
    }

    #[tokio::test]
    async fn test_master_two_ues_start() {
        let mut rig = rig(master()).await;
        let mut events_rx = rig.session.subscribe();

        let (ip1, idx1) = rig
            .session
            .add_ue(rig.h1.clone(), &Mobility::fixed(Vector3(0.0, 0.0, 0.0)))
            .await
            .unwrap();
        let (ip2, idx2) = rig
            .session
            .add_ue(rig.h2.clone(), &Mobility::default())
            .await
            .unwrap();
        assert_eq!(ip1, Ipv4Addr::new(7, 0, 0, 2));
        assert_eq!(ip2, Ipv4Addr::new(7, 0, 0, 3));
        assert_eq!((idx1, idx2), (0, 1));

        rig.session.start().await.unwrap();
        assert_eq!(rig.session.state(), SessionState::Started);

        // Setup once, before any per-UE statement
        let sent = rig.sent.statements();
        assert_eq!(rig.sent.count("lteHelper = LteHelper ()"), 1);
        assert_eq!(rig.sent.count("pgw = tapEpcHelper.GetPgwNode ()"), 1);
        let setup_end = rig.sent.position("tapBridges = []").unwrap();
        let first_ue = rig.sent.position("InstallUeDevice").unwrap();
        assert!(setup_end < first_ue);
        assert!(sent[..setup_end].iter().all(|s| !s.contains("nsNode")));

        // Each endpoint polls its own bridge
        assert!(rig.sent.position("tapBridges[0].IsLinkUp ()").unwrap()
            < rig.sent.position("tapBridges[1].IsLinkUp ()").unwrap());

        // Two migrations, in insertion order
        let migrations: Vec<_> = rig
            .commands
            .lines()
            .into_iter()
            .filter(|c| c.contains("netns h"))
            .collect();
        assert_eq!(
            migrations,
            vec!["ip link set dev h1-eth0 netns h1", "ip link set dev h2-eth0 netns h2"]
        );
        assert!(rig
            .session
            .endpoints()
            .iter()
            .all(|e| e.state() == EndpointState::Migrated));

        let mut migrated = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            if let Activity::EndpointMigrated { endpoint, .. } = event.activity {
                migrated.push(endpoint);
            }
        }
        assert_eq!(migrated, vec!["h1-eth0", "h2-eth0"]);

        // IPv6 is toggled on the EPC switch around the migration pass
        let lines = rig.commands.lines();
        let disable = lines
            .iter()
            .rposition(|c| c == DISABLE_IPV6)
            .unwrap();
        let enable = lines.iter().position(|c| c == ENABLE_IPV6).unwrap();
        let last_move = lines.iter().rposition(|c| c.contains("netns h2")).unwrap();
        assert!(disable < last_move && last_move < enable);
    }

    #[tokio::test]
    async fn test_second_start_sends_nothing() {
        let mut rig = rig(master()).await;
        rig.session
            .add_ue(rig.h1.clone(), &Mobility::default())
            .await
            .unwrap();
        rig.session.start().await.unwrap();

        let sent = rig.sent.len();
        let commands = rig.commands.lines().len();
        rig.session.start().await.unwrap();
        assert_eq!(rig.sent.len(), sent);
        assert_eq!(rig.commands.lines().len(), commands);
    }

    #[tokio::test]
    async fn test_restart_ignore_leaves_late_endpoint() {
        let mut rig = rig(master()).await;
        rig.session.start().await.unwrap();
        rig.session
            .add_ue(rig.h1.clone(), &Mobility::default())
            .await
            .unwrap();
        rig.session.start().await.unwrap();
        assert_eq!(rig.session.endpoints()[0].state(), EndpointState::Provisioned);
    }

    #[tokio::test]
    async fn test_restart_migrate_pending() {
        let mut config = master();
        config.restart = RestartBehavior::MigratePending;
        let mut rig = rig(config).await;
        rig.session
            .add_ue(rig.h1.clone(), &Mobility::default())
            .await
            .unwrap();
        rig.session.start().await.unwrap();
        rig.session
            .add_ue(rig.h2.clone(), &Mobility::default())
            .await
            .unwrap();
        rig.session.start().await.unwrap();

        assert!(rig
            .session
            .endpoints()
            .iter()
            .all(|e| e.state() == EndpointState::Migrated));
        // The worker is launched once
        assert_eq!(rig.sent.count("nsThread.start ()"), 1);
        assert_eq!(rig.commands.count("ip link set dev h1-eth0 netns h1"), 1);
    }

    #[tokio::test]
    async fn test_slave_has_no_pgw_block() {
        let rig = rig(slave()).await;
        let sent = rig.sent.statements();
        for needle in ["GetPgwNode", "TapFdNetDeviceHelper", "Ipv4AddressHelper", "pgwIpIfaces"] {
            assert!(
                sent.iter().all(|s| !s.contains(needle)),
                "{} emitted in Slave mode",
                needle
            );
        }
        assert_eq!(
            sent[0],
            "Config.SetDefault (\"ns3::TapEpcHelper::EpcSlaveDeviceName\", StringValue (\"slaveTap\"))\n"
        );
        assert!(sent[1].contains("StringValue (\"0.0.0.1\")"));
        assert!(rig.sent.count("StringValue (\"Slave\")") == 1);
        assert_eq!(rig.session.infra_taps()[0].name(), "slaveTap");
    }

    #[tokio::test]
    async fn test_slave_first_address() {
        let mut rig = rig(slave()).await;
        let (ip, _) = rig
            .session
            .add_ue(rig.h1.clone(), &Mobility::default())
            .await
            .unwrap();
        assert_eq!(ip, Ipv4Addr::new(7, 0, 0, 1));
    }

    #[tokio::test]
    async fn test_master_infra_taps_before_setup() {
        let rig = rig(master()).await;
        let names: Vec<_> = rig.session.infra_taps().iter().map(|t| t.name()).collect();
        assert_eq!(names, MASTER_TAPS.to_vec());
        let lines = rig.commands.lines();
        assert_eq!(lines[0], "/usr/bin/opennet-agent.py start");
        assert_eq!(lines[1], "ip tuntap add pgwTap mode tap");
    }

    #[tokio::test]
    async fn test_tap_created_before_bridge() {
        let mut rig = rig(master()).await;
        let sent_before = rig.sent.len();
        rig.session
            .add_ue(rig.h1.clone(), &Mobility::default())
            .await
            .unwrap();
        // The TAP precedes the device batch; the bridge batch follows both
        let sent = rig.sent.statements();
        let bridge = sent[sent_before..]
            .iter()
            .position(|s| s.starts_with("tapBridgeHelper = TapBridgeHelper ()"))
            .unwrap();
        assert!(bridge > 0);
        assert!(rig.commands.count("ip tuntap add h1-eth0 mode tap") == 1);
        assert!(rig.sent.count("StringValue (\"ConfigureLocal\")") == 1);
        assert!(rig.sent.count("dev.SetGatewayMacAddress (gatewayMacAddr)") == 1);
    }

    #[tokio::test]
    async fn test_failed_ue_keeps_indices_aligned() {
        let mut rig = rig(master()).await;
        rig.h1.fail_on("ip link set dev h1-eth0 netns 1");
        let err = rig
            .session
            .add_ue(rig.h1.clone(), &Mobility::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Command { .. }));
        assert_eq!(rig.sent.count("ueLteDevs.Add"), 0);
        assert_eq!(rig.commands.count("ip tuntap add h1-eth0 mode tap"), 1);
        assert_eq!(rig.commands.count("ip tuntap del h1-eth0 mode tap"), 1);
        assert!(rig.session.endpoints().is_empty());
        assert_eq!(rig.session.ue_count(), 0);

        let (ip, idx) = rig
            .session
            .add_ue(rig.h2.clone(), &Mobility::default())
            .await
            .unwrap();
        // Addresses are never handed out twice
        assert_eq!(ip, Ipv4Addr::new(7, 0, 0, 3));
        assert_eq!(idx, 0);
        assert_eq!(rig.sent.count("ueLteDevs.Add"), 1);
        assert_eq!(rig.session.endpoints()[0].name(), "h2-eth0");
        assert_eq!(rig.session.endpoints()[0].bridge_index(), 0);

        rig.session
            .add_eps_bearer(idx, &EpsBearerSpec::default())
            .await
            .unwrap();
        assert!(matches!(
            rig.session.add_eps_bearer(1, &EpsBearerSpec::default()).await,
            Err(NetError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_tap_created_before_device_batch() {
        let mut rig = rig(master()).await;
        rig.h1.fail_on("ip tuntap add h1-eth0");
        assert!(rig
            .session
            .add_ue(rig.h1.clone(), &Mobility::default())
            .await
            .is_err());
        assert_eq!(rig.sent.count("InstallUeDevice"), 0);
        assert_eq!(rig.sent.count("nsNode = Node ()"), 0);
    }

    #[tokio::test]
    async fn test_tx_power_round_trips() {
        let mut config = master();
        config.home_enb_tx_power = 23.5;
        let rig = rig(config).await;
        let line = rig
            .sent
            .statements()
            .into_iter()
            .find(|s| s.contains("ns3::LteEnbPhy::TxPower"))
            .unwrap();
        let literal = line
            .split("DoubleValue (")
            .nth(1)
            .and_then(|rest| rest.split(')').next())
            .unwrap();
        assert_eq!(parse_float_literal(literal), Some(23.5));
    }

    #[tokio::test]
    async fn test_eps_bearer() {
        let mut rig = rig(master()).await;
        let (_, idx) = rig
            .session
            .add_ue(rig.h1.clone(), &Mobility::default())
            .await
            .unwrap();

        let bearer = EpsBearerSpec {
            local_port_start: 5000,
            local_port_end: 5001,
            ..Default::default()
        };
        rig.session.add_eps_bearer(idx, &bearer).await.unwrap();
        assert_eq!(rig.sent.count("pf.localPortStart = 5000"), 1);
        assert_eq!(
            rig.sent.count(
                "Simulator.Schedule (Seconds (attachDelay), LteHelper.ActivateDedicatedEpsBearer, lteHelper, ueLteDevs.Get (0), bearer, tft)"
            ),
            1
        );

        let sent = rig.sent.len();
        assert!(matches!(
            rig.session.add_eps_bearer(1, &bearer).await,
            Err(NetError::InvalidParameter(_))
        ));
        assert_eq!(rig.sent.len(), sent);
    }

    #[tokio::test]
    async fn test_enb_uses_infra_tap() {
        let mut rig = rig(master()).await;
        let enb_host = Arc::new(RecordingHost::root("s2").sharing_log(&rig.commands));
        rig.session
            .add_enb(enb_host, "enbTap0", &Mobility::fixed(Vector3(5.0, 5.0, 0.0)))
            .await
            .unwrap();
        assert_eq!(rig.session.enb_count(), 1);
        assert_eq!(rig.commands.count("ip tuntap add enbTap0 mode tap"), 1);
        assert_eq!(
            rig.sent.count("enbLteDev = lteHelper.InstallEnbDevice (NodeContainer (nsNode))"),
            1
        );
        assert!(rig.session.endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let mut rig = rig(master()).await;
        assert!(matches!(
            rig.session.stop().await,
            Err(NetError::InvalidState(_))
        ));
        rig.session.start().await.unwrap();
        assert!(matches!(
            rig.session.clear().await,
            Err(NetError::InvalidState(_))
        ));
        rig.session.stop().await.unwrap();
        assert_eq!(rig.sent.count("Simulator.Stop (Seconds (1))"), 1);
        assert!(matches!(
            rig.session.start().await,
            Err(NetError::InvalidState(_))
        ));
        assert!(matches!(
            rig.session.add_ue(rig.h1.clone(), &Mobility::default()).await,
            Err(NetError::InvalidState(_))
        ));

        rig.session.clear().await.unwrap();
        let sent = rig.sent.statements();
        let n = sent.len();
        assert_eq!(sent[n - 3], "Simulator.Destroy ()\n");
        assert_eq!(sent[n - 2], "exit ()\n");
        assert_eq!(sent[n - 1], "<close>");
        assert_eq!(
            rig.commands.lines().last().map(String::as_str),
            Some("/usr/bin/opennet-agent.py stop")
        );
        assert!(matches!(
            rig.session.clear().await,
            Err(NetError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_already_running_worker_not_relaunched() {
        let commands = CommandLog::new();
        let switch = Arc::new(RecordingHost::root("s1").sharing_log(&commands));
        let transport = RecordingTransport::new()
            .with_responder(|q| q.contains("isAlive").then(|| b"True".to_vec()));
        let sent = transport.log();
        let mut session = LteSession::with_options(
            master(),
            switch,
            SessionOptions::with_transport(Box::new(transport)),
        )
        .await
        .unwrap();
        session.start().await.unwrap();
        assert_eq!(sent.count("nsThread.start ()"), 0);
        assert_eq!(session.state(), SessionState::Started);
    }
}
