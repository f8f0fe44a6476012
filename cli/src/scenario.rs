//! Scenario files: the hosts of an emulated topology, the simulated
//! network joining them, and the entities to add to it.
//!
//! ```yaml
//! hosts:
//!   - name: s1
//!   - name: h1
//!     netns: h1
//! infra: s1
//! network:
//!   kind: lte
//!   config:
//!     agent:
//!       address: 192.168.56.10
//!   ues:
//!     - host: h1
//!       mobility:
//!         position: [0.0, 0.0, 0.0]
//! ```

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use opennet_core::config::{load_yaml, LteConfig, WifiConfig};
use opennet_core::error::{NetError, Result};
use opennet_core::mobility::Mobility;
use opennet_core::network::IfaceAddr;
use opennet_runtime::host::HostSpec;
use opennet_runtime::{
    EmulatedHost, Endpoint, EpsBearerSpec, LteSession, SessionCore, SessionOptions, WifiRole,
    WifiSession,
};
use serde::{Deserialize, Serialize};

/// Top-level scenario document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub name: Option<String>,

    pub hosts: Vec<HostSpec>,

    /// Host the agent runs on: the EPC switch for LTE, the root switch
    /// for Wi-Fi
    pub infra: String,

    pub network: NetworkSpec,
}

/// Simulated network and the entities attached to it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkSpec {
    Lte {
        config: LteConfig,
        #[serde(default)]
        enbs: Vec<EnbSpec>,
        #[serde(default)]
        ues: Vec<UeSpec>,
    },
    Wifi {
        config: WifiConfig,
        #[serde(default)]
        nodes: Vec<WifiNodeSpec>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnbSpec {
    pub host: String,
    pub intf: String,
    #[serde(default)]
    pub mobility: Mobility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UeSpec {
    pub host: String,
    #[serde(default)]
    pub mobility: Mobility,
    #[serde(default)]
    pub bearers: Vec<EpsBearerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiNodeSpec {
    pub host: String,
    #[serde(flatten)]
    pub role: WifiRole,
    #[serde(default)]
    pub mobility: Mobility,
    /// `ADDR/PREFIX` assigned after migration
    #[serde(default)]
    pub address: Option<String>,
}

impl WifiNodeSpec {
    pub fn address(&self) -> Result<Option<IfaceAddr>> {
        self.address.as_deref().map(str::parse::<IfaceAddr>).transpose()
    }
}

impl NetworkSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkSpec::Lte { .. } => "lte",
            NetworkSpec::Wifi { .. } => "wifi",
        }
    }

    /// Hosts named by the entities, in order of appearance.
    fn referenced_hosts(&self) -> Vec<&str> {
        match self {
            NetworkSpec::Lte { enbs, ues, .. } => enbs
                .iter()
                .map(|e| e.host.as_str())
                .chain(ues.iter().map(|u| u.host.as_str()))
                .collect(),
            NetworkSpec::Wifi { nodes, .. } => nodes.iter().map(|n| n.host.as_str()).collect(),
        }
    }
}

impl ScenarioConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let scenario: Self = load_yaml(path)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for host in &self.hosts {
            if host.name.is_empty() {
                return Err(NetError::Config("host name must not be empty".to_string()));
            }
            if !names.insert(host.name.as_str()) {
                return Err(NetError::Config(format!("duplicate host '{}'", host.name)));
            }
        }
        if !names.contains(self.infra.as_str()) {
            return Err(NetError::Config(format!(
                "infra host '{}' is not in hosts",
                self.infra
            )));
        }
        for host in self.network.referenced_hosts() {
            if !names.contains(host) {
                return Err(NetError::Config(format!("unknown host '{}'", host)));
            }
        }

        match &self.network {
            NetworkSpec::Lte { config, .. } => config.validate(),
            NetworkSpec::Wifi { config, nodes } => {
                for node in nodes {
                    node.address()?;
                }
                config.validate()
            }
        }
    }

    /// Build a host for every entry in `hosts`.
    pub fn hosts_with<F>(&self, mut make: F) -> HostMap
    where
        F: FnMut(&HostSpec) -> Arc<dyn EmulatedHost>,
    {
        HostMap {
            hosts: self
                .hosts
                .iter()
                .map(|spec| (spec.name.clone(), make(spec)))
                .collect(),
        }
    }

    /// Open the session and add every entity, in file order.
    pub async fn open(&self, hosts: &HostMap, options: SessionOptions) -> Result<Session> {
        let infra = hosts.get(&self.infra)?;
        match &self.network {
            NetworkSpec::Lte { config, enbs, ues } => {
                let mut session = LteSession::with_options(config.clone(), infra, options).await?;
                for enb in enbs {
                    session
                        .add_enb(hosts.get(&enb.host)?, &enb.intf, &enb.mobility)
                        .await?;
                }
                for ue in ues {
                    let (ip, index) = session.add_ue(hosts.get(&ue.host)?, &ue.mobility).await?;
                    tracing::debug!(host = %ue.host, ip = %ip, index, "UE ready");
                    for bearer in &ue.bearers {
                        session.add_eps_bearer(index, bearer).await?;
                    }
                }
                Ok(Session::Lte(session))
            }
            NetworkSpec::Wifi { config, nodes } => {
                let mut session = WifiSession::with_options(config.clone(), infra, options).await?;
                for node in nodes {
                    session
                        .add_node(
                            hosts.get(&node.host)?,
                            &node.role,
                            &node.mobility,
                            node.address()?,
                        )
                        .await?;
                }
                Ok(Session::Wifi(session))
            }
        }
    }

    /// One-line description for logs and `validate` output.
    pub fn summary(&self) -> String {
        let name = self.name.as_deref().unwrap_or("scenario");
        match &self.network {
            NetworkSpec::Lte { config, enbs, ues } => {
                let bearers: usize = ues.iter().map(|u| u.bearers.len()).sum();
                format!(
                    "{}: lte ({}), {} hosts, {} eNBs, {} UEs, {} bearers",
                    name,
                    config.mode,
                    self.hosts.len(),
                    enbs.len(),
                    ues.len(),
                    bearers
                )
            }
            NetworkSpec::Wifi { nodes, .. } => format!(
                "{}: wifi, {} hosts, {} nodes",
                name,
                self.hosts.len(),
                nodes.len()
            ),
        }
    }
}

/// Hosts by name
pub struct HostMap {
    hosts: HashMap<String, Arc<dyn EmulatedHost>>,
}

impl HostMap {
    pub fn get(&self, name: &str) -> Result<Arc<dyn EmulatedHost>> {
        self.hosts
            .get(name)
            .cloned()
            .ok_or_else(|| NetError::Config(format!("unknown host '{}'", name)))
    }
}

/// An open session of either kind
#[derive(Debug)]
pub enum Session {
    Lte(LteSession),
    Wifi(WifiSession),
}

impl Session {
    pub fn core(&self) -> &SessionCore {
        match self {
            Session::Lte(s) => s.core(),
            Session::Wifi(s) => s.core(),
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.core().endpoints()
    }

    pub async fn start(&mut self) -> Result<()> {
        match self {
            Session::Lte(s) => s.start().await,
            Session::Wifi(s) => s.start().await,
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Session::Lte(s) => s.stop().await,
            Session::Wifi(s) => s.stop().await,
        }
    }

    pub async fn clear(&mut self) -> Result<()> {
        match self {
            Session::Lte(s) => s.clear().await,
            Session::Wifi(s) => s.clear().await,
        }
    }
}

/// Address shown for an endpoint before and after migration.
pub fn endpoint_address(endpoint: &Endpoint) -> Option<Ipv4Addr> {
    endpoint.address().map(|a| a.ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opennet_core::config::LteMode;
    use opennet_runtime::{RecordingHost, RecordingTransport};
    use std::io::Write;

    const LTE: &str = r#"
name: two-ue
hosts:
  - name: s1
  - name: h1
    netns: h1
  - name: h2
    netns: h2
infra: s1
network:
  kind: lte
  config:
    mode: Master
    agent:
      address: 127.0.0.1
  ues:
    - host: h1
      mobility:
        position: [0.0, 0.0, 0.0]
      bearers:
        - local_port_start: 5000
          local_port_end: 5000
    - host: h2
"#;

    const WIFI: &str = r#"
hosts:
  - name: s0
  - name: ap1
    netns: ap1
  - name: sta1
    netns: sta1
infra: s0
network:
  kind: wifi
  config:
    enable_qos: false
    agent:
      address: 127.0.0.1
  nodes:
    - host: ap1
      role: access_point
      channel: 6
      ssid: lab
      address: 10.0.0.1/24
    - host: sta1
      role: station
      ssid: lab
"#;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn recording_hosts(scenario: &ScenarioConfig) -> HostMap {
        scenario.hosts_with(|spec| Arc::new(RecordingHost::for_spec(spec)))
    }

    #[test]
    fn test_load_lte_scenario() {
        let file = write_temp(LTE);
        let scenario = ScenarioConfig::load(file.path()).unwrap();
        assert_eq!(scenario.network.kind(), "lte");
        match &scenario.network {
            NetworkSpec::Lte { config, ues, .. } => {
                assert_eq!(config.mode, LteMode::Master);
                assert_eq!(config.agent.port, 53724);
                assert_eq!(ues.len(), 2);
                assert_eq!(ues[0].bearers[0].local_port_end, 5000);
                assert_eq!(ues[0].bearers[0].remote_port_end, 65535);
            }
            other => panic!("expected lte, got {other:?}"),
        }
        assert_eq!(
            scenario.summary(),
            "two-ue: lte (Master), 3 hosts, 0 eNBs, 2 UEs, 1 bearers"
        );
    }

    #[test]
    fn test_load_wifi_scenario() {
        let file = write_temp(WIFI);
        let scenario = ScenarioConfig::load(file.path()).unwrap();
        match &scenario.network {
            NetworkSpec::Wifi { config, nodes } => {
                assert!(!config.enable_qos);
                assert_eq!(
                    nodes[0].role,
                    WifiRole::AccessPoint {
                        channel: 6,
                        ssid: "lab".to_string()
                    }
                );
                assert_eq!(nodes[0].address().unwrap().unwrap().prefix_len, 24);
                assert_eq!(nodes[1].address().unwrap(), None);
            }
            other => panic!("expected wifi, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_host_rejected() {
        let yaml = LTE.replace("  - host: h2\n", "  - host: h9\n");
        let file = write_temp(&yaml);
        let err = ScenarioConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("h9"));
    }

    #[test]
    fn test_infra_must_be_a_host() {
        let yaml = LTE.replace("infra: s1", "infra: s7");
        let file = write_temp(&yaml);
        assert!(matches!(
            ScenarioConfig::load(file.path()),
            Err(NetError::Config(_))
        ));
    }

    #[test]
    fn test_bad_address_rejected() {
        let yaml = WIFI.replace("10.0.0.1/24", "10.0.0.1");
        let file = write_temp(&yaml);
        assert!(matches!(
            ScenarioConfig::load(file.path()),
            Err(NetError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_open_adds_entities_in_order() {
        let file = write_temp(LTE);
        let scenario = ScenarioConfig::load(file.path()).unwrap();
        let hosts = recording_hosts(&scenario);
        let transport = RecordingTransport::healthy_agent();
        let sent = transport.log();

        let mut session = scenario
            .open(&hosts, SessionOptions::with_transport(Box::new(transport)))
            .await
            .unwrap();
        let names: Vec<_> = session.endpoints().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["h1-eth0", "h2-eth0"]);
        assert_eq!(
            endpoint_address(&session.endpoints()[1]),
            Some(Ipv4Addr::new(7, 0, 0, 3))
        );
        assert_eq!(sent.count("pf.localPortStart = 5000"), 1);

        session.start().await.unwrap();
        session.stop().await.unwrap();
        session.clear().await.unwrap();
        assert_eq!(sent.count("exit ()"), 1);
    }
}
