use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::{NetError, Result};

/// Default TCP port the simulation agent listens on.
pub const DEFAULT_AGENT_PORT: u16 = 53724;

/// Default agent control script on the infrastructure host.
pub const DEFAULT_AGENT_COMMAND: &str = "/usr/bin/opennet-agent.py";

/// Simulation agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Address the agent listens on (required)
    pub address: String,

    /// Agent TCP port
    #[serde(default = "default_agent_port")]
    pub port: u16,

    /// Script run with `start` / `stop` on the infrastructure host
    #[serde(default = "default_agent_command")]
    pub agent_command: String,

    /// Connect retry policy
    #[serde(default)]
    pub connect: ConnectPolicy,
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_agent_command() -> String {
    DEFAULT_AGENT_COMMAND.to_string()
}

impl AgentConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: DEFAULT_AGENT_PORT,
            agent_command: default_agent_command(),
            connect: ConnectPolicy::default(),
        }
    }

    /// `host:port` form used for connecting and logging.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(NetError::Config("agent address is required".to_string()));
        }
        self.connect.validate()
    }
}

/// Connect retry policy
///
/// Backoff doubles from `initial_backoff_ms` up to `max_backoff_ms`.
/// A `timeout_ms` of `None` retries forever.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_ms: Option<u64>,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            timeout_ms: None,
        }
    }
}

impl ConnectPolicy {
    /// Delay before the given retry (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.initial_backoff_ms == 0 {
            return Err(NetError::Config(
                "connect.initial_backoff_ms must be positive".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(NetError::Config(
                "connect.max_backoff_ms must not be below initial_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Readiness / liveness polling policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollPolicy {
    /// Sleep between unsuccessful polls
    pub interval_ms: u64,

    /// Give up after this long (`None` = wait forever)
    pub timeout_ms: Option<u64>,

    /// Consecutive non-sentinel replies tolerated before failing
    pub max_unrecognized_replies: u32,

    /// Maximum bytes read for one reply
    pub recv_buffer: usize,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            timeout_ms: None,
            max_unrecognized_replies: 5,
            recv_buffer: 1024,
        }
    }
}

impl PollPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.recv_buffer == 0 {
            return Err(NetError::Config("poll.recv_buffer must be positive".to_string()));
        }
        Ok(())
    }
}

/// What a second `start()` on a started session does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartBehavior {
    /// Return immediately without contacting the agent
    #[default]
    Ignore,

    /// Migrate endpoints added since the previous start
    MigratePending,
}

/// EPC role of an LTE session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LteMode {
    #[default]
    Master,
    Slave,
}

impl fmt::Display for LteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LteMode::Master => write!(f, "Master"),
            LteMode::Slave => write!(f, "Slave"),
        }
    }
}

impl std::str::FromStr for LteMode {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Master" | "master" => Ok(LteMode::Master),
            "Slave" | "slave" => Ok(LteMode::Slave),
            _ => Err(NetError::Config(format!(
                "mode should be Master or Slave, got '{}'",
                s
            ))),
        }
    }
}

/// LTE session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LteConfig {
    /// Time dilation factor
    #[serde(default = "default_tdf")]
    pub tdf: u32,

    #[serde(default)]
    pub mode: LteMode,

    #[serde(default)]
    pub imsi_base: u64,

    #[serde(default)]
    pub cell_id_base: u32,

    #[serde(default = "default_ue_ip_base")]
    pub ue_ip_base: Ipv4Addr,

    #[serde(default = "default_ue_ip_base")]
    pub ue_gw_ip: Ipv4Addr,

    /// Prefix length assigned to UE interfaces
    #[serde(default = "default_ue_prefix_len")]
    pub ue_prefix_len: u8,

    #[serde(default = "default_pgw_ip_base")]
    pub pgw_ip_base: Ipv4Addr,

    #[serde(default = "default_pgw_mask")]
    pub pgw_mask: Ipv4Addr,

    /// Home eNB transmit power in dBm
    #[serde(default = "default_home_enb_tx_power")]
    pub home_enb_tx_power: f64,

    /// TAP device name used in slave mode
    #[serde(default = "default_slave_name")]
    pub slave_name: String,

    /// Simulator-side EPC log file
    #[serde(default)]
    pub log_file: Option<String>,

    /// Seconds of simulated time before UEs attach
    #[serde(default = "default_attach_delay")]
    pub attach_delay_s: f64,

    pub agent: AgentConfig,

    #[serde(default)]
    pub poll: PollPolicy,

    #[serde(default)]
    pub restart: RestartBehavior,
}

fn default_tdf() -> u32 {
    1
}

fn default_ue_ip_base() -> Ipv4Addr {
    Ipv4Addr::new(7, 0, 0, 1)
}

fn default_ue_prefix_len() -> u8 {
    8
}

fn default_pgw_ip_base() -> Ipv4Addr {
    Ipv4Addr::new(1, 0, 0, 0)
}

fn default_pgw_mask() -> Ipv4Addr {
    Ipv4Addr::new(255, 0, 0, 0)
}

fn default_home_enb_tx_power() -> f64 {
    30.0
}

fn default_slave_name() -> String {
    "slaveTap".to_string()
}

fn default_attach_delay() -> f64 {
    10.0
}

impl LteConfig {
    pub fn new(agent: AgentConfig) -> Self {
        Self {
            tdf: default_tdf(),
            mode: LteMode::Master,
            imsi_base: 0,
            cell_id_base: 0,
            ue_ip_base: default_ue_ip_base(),
            ue_gw_ip: default_ue_ip_base(),
            ue_prefix_len: default_ue_prefix_len(),
            pgw_ip_base: default_pgw_ip_base(),
            pgw_mask: default_pgw_mask(),
            home_enb_tx_power: default_home_enb_tx_power(),
            slave_name: default_slave_name(),
            log_file: None,
            attach_delay_s: default_attach_delay(),
            agent,
            poll: PollPolicy::default(),
            restart: RestartBehavior::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.agent.validate()?;
        self.poll.validate()?;
        if self.tdf == 0 {
            return Err(NetError::Config("tdf must be at least 1".to_string()));
        }
        if self.ue_prefix_len == 0 || self.ue_prefix_len > 30 {
            return Err(NetError::Config(format!(
                "ue_prefix_len {} out of range (1-30)",
                self.ue_prefix_len
            )));
        }
        if !self.home_enb_tx_power.is_finite() || !self.attach_delay_s.is_finite() {
            return Err(NetError::Config(
                "home_enb_tx_power and attach_delay_s must be finite".to_string(),
            ));
        }
        if self.mode == LteMode::Slave && self.slave_name.is_empty() {
            return Err(NetError::Config("slave_name is required in Slave mode".to_string()));
        }
        Ok(())
    }
}

/// Wi-Fi session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WifiConfig {
    /// Use the QoS MAC helper instead of the non-QoS one
    #[serde(default = "default_enable_qos")]
    pub enable_qos: bool,

    pub agent: AgentConfig,

    #[serde(default)]
    pub poll: PollPolicy,

    #[serde(default)]
    pub restart: RestartBehavior,
}

fn default_enable_qos() -> bool {
    true
}

impl WifiConfig {
    pub fn new(agent: AgentConfig) -> Self {
        Self {
            enable_qos: true,
            agent,
            poll: PollPolicy::default(),
            restart: RestartBehavior::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.agent.validate()?;
        self.poll.validate()
    }
}

/// Load a YAML document from disk.
pub fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        NetError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let value = serde_yaml::from_str(&data)?;
    tracing::debug!(path = %path.display(), bytes = data.len(), "Loaded YAML document");
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_lte_defaults_match_constructor() {
        let config = LteConfig::new(AgentConfig::new("10.0.0.1"));
        assert_eq!(config.tdf, 1);
        assert_eq!(config.mode, LteMode::Master);
        assert_eq!(config.ue_ip_base, Ipv4Addr::new(7, 0, 0, 1));
        assert_eq!(config.ue_gw_ip, Ipv4Addr::new(7, 0, 0, 1));
        assert_eq!(config.pgw_mask, Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(config.home_enb_tx_power, 30.0);
        assert_eq!(config.slave_name, "slaveTap");
        assert_eq!(config.agent.port, 53724);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lte_yaml_defaults() {
        let yaml = "agent:\n  address: 192.168.0.10\nmode: Slave\n";
        let config: LteConfig = serde_yaml::from_str(yaml).unwrap();
        let expected = {
            let mut c = LteConfig::new(AgentConfig::new("192.168.0.10"));
            c.mode = LteMode::Slave;
            c
        };
        assert_eq!(config, expected);
    }

    #[test]
    fn test_agent_address_required() {
        let yaml = "mode: Master\n";
        assert!(serde_yaml::from_str::<LteConfig>(yaml).is_err());

        let config = LteConfig::new(AgentConfig::new("  "));
        assert!(matches!(config.validate(), Err(NetError::Config(_))));
    }

    #[test]
    fn test_lte_mode_parse_and_display() {
        assert_eq!("Master".parse::<LteMode>().unwrap(), LteMode::Master);
        assert_eq!("slave".parse::<LteMode>().unwrap(), LteMode::Slave);
        assert!("Relay".parse::<LteMode>().is_err());
        assert_eq!(LteMode::Slave.to_string(), "Slave");
    }

    #[test]
    fn test_connect_backoff_caps() {
        let policy = ConnectPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(1600));
        assert_eq!(policy.backoff(5), Duration::from_millis(2000));
        assert_eq!(policy.backoff(60), Duration::from_millis(2000));
        assert!(policy.timeout().is_none());
    }

    #[test]
    fn test_invalid_policies_rejected() {
        let mut agent = AgentConfig::new("10.0.0.1");
        agent.connect.initial_backoff_ms = 0;
        assert!(agent.validate().is_err());

        let mut config = WifiConfig::new(AgentConfig::new("10.0.0.1"));
        config.poll.recv_buffer = 0;
        assert!(config.validate().is_err());

        let mut lte = LteConfig::new(AgentConfig::new("10.0.0.1"));
        lte.home_enb_tx_power = f64::NAN;
        assert!(lte.validate().is_err());
    }

    #[test]
    fn test_restart_behavior_serde() {
        let b: RestartBehavior = serde_yaml::from_str("migrate_pending").unwrap();
        assert_eq!(b, RestartBehavior::MigratePending);
        assert_eq!(RestartBehavior::default(), RestartBehavior::Ignore);
    }

    #[test]
    fn test_load_yaml_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enable_qos: false\nagent:\n  address: 10.1.1.1\n  port: 6000").unwrap();

        let config: WifiConfig = load_yaml(file.path()).unwrap();
        assert!(!config.enable_qos);
        assert_eq!(config.agent.endpoint(), "10.1.1.1:6000");
        assert_eq!(config.poll, PollPolicy::default());
    }

    #[test]
    fn test_load_yaml_missing_file() {
        let result: Result<WifiConfig> = load_yaml(Path::new("/nonexistent/opennet.yaml"));
        assert!(matches!(result, Err(NetError::Config(_))));
    }
}
