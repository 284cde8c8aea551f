//! Configuration for endpoints and switches.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapter::DeviceKind;
use crate::protocol::{Route, DEFAULT_MAX_SIZE, DEFAULT_NETWORK};

/// Port a switch listens on when none is given.
pub const DEFAULT_PORT: u16 = 10002;

/// Transport protocol between an endpoint and its switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    /// One frame per datagram. The built-in switch listens on TCP only,
    /// so `udp` endpoints need a switch that serves datagrams.
    Udp,
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "tcp"),
            TransportProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Endpoint (access point) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Primary switch address (`host[:port]`)
    pub connection: String,

    /// Optional fallback switch address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,

    /// `tcp` (default) or `udp`; see [`TransportProtocol::Udp`]
    #[serde(default)]
    pub protocol: TransportProtocol,

    /// Endpoint alias, defaults to the host name
    #[serde(default)]
    pub alias: String,

    /// Login name, `user@network` accepted
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Tenant network
    #[serde(default)]
    pub network: String,

    /// Liveness timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Ask the switch for an address lease
    #[serde(default = "default_true")]
    pub request_addr: bool,

    #[serde(default)]
    pub interface: InterfaceConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    /// Largest frame payload accepted on the wire
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
}

/// Virtual interface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name; empty lets the kernel choose
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Static address in CIDR notation
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub provider: DeviceKind,

    /// Host bridge to enslave the device to (TAP mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

/// Bounded queue capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Session outbound write queue
    #[serde(default = "default_queue")]
    pub sock_wr: usize,

    /// Adapter kernel write queue
    #[serde(default = "default_queue")]
    pub tap_wr: usize,
}

/// Switch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Client liveness timeout in seconds
    #[serde(default = "default_switch_timeout")]
    pub timeout: u64,

    /// Forwarding table aging in seconds
    #[serde(default = "default_mac_timeout")]
    pub mac_timeout: u64,

    #[serde(default = "default_max_frame")]
    pub max_frame: usize,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub networks: Vec<NetworkConfig>,

    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// One tenant network served by the switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,

    #[serde(default = "default_netmask")]
    pub netmask: String,

    #[serde(default)]
    pub gateway: String,

    #[serde(default)]
    pub range: Option<RangeConfig>,

    #[serde(default)]
    pub routes: Vec<Route>,

    #[serde(default, rename = "static")]
    pub static_leases: Vec<StaticLease>,
}

/// Inclusive address range for dynamic leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeConfig {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticLease {
    pub alias: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,

    #[serde(default)]
    pub network: String,

    pub password: String,

    #[serde(default = "default_role")]
    pub role: String,
}

fn default_timeout() -> u64 {
    60
}

fn default_switch_timeout() -> u64 {
    120
}

fn default_mac_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_mtu() -> u16 {
    1500
}

fn default_queue() -> usize {
    1024
}

fn default_max_frame() -> usize {
    DEFAULT_MAX_SIZE
}

fn default_listen() -> String {
    format!("0.0.0.0:{}", DEFAULT_PORT)
}

fn default_netmask() -> String {
    "255.255.255.0".to_string()
}

fn default_role() -> String {
    "guest".to_string()
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            mtu: default_mtu(),
            address: String::new(),
            provider: DeviceKind::default(),
            bridge: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sock_wr: default_queue(),
            tap_wr: default_queue(),
        }
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            timeout: default_switch_timeout(),
            mac_timeout: default_mac_timeout(),
            max_frame: default_max_frame(),
            queue: QueueConfig::default(),
            networks: Vec::new(),
            users: Vec::new(),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// Append the default port when `addr` has none.
fn with_default_port(addr: &str) -> String {
    let has_port = addr
        .rsplit_once(':')
        .map(|(_, port)| port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if has_port {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    }
}

fn host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

impl AccessConfig {
    pub fn new(connection: &str, username: &str, password: &str) -> Self {
        Self {
            connection: connection.to_string(),
            fallback: None,
            protocol: TransportProtocol::default(),
            alias: String::new(),
            username: username.to_string(),
            password: password.to_string(),
            network: String::new(),
            timeout: default_timeout(),
            request_addr: true,
            interface: InterfaceConfig::default(),
            queue: QueueConfig::default(),
            max_frame: default_max_frame(),
            status_file: None,
            pid_file: None,
        }
    }

    /// Load, correct and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config: Self = read_json(path.as_ref())?;
        config.correct();
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(self, path.as_ref())
    }

    /// Fill derived defaults.
    pub fn correct(&mut self) {
        if let Some((name, network)) = self.username.split_once('@') {
            if self.network.is_empty() {
                self.network = network.to_string();
            }
            self.username = name.to_string();
        }
        if self.network.is_empty() {
            self.network = DEFAULT_NETWORK.to_string();
        }
        if self.alias.is_empty() {
            self.alias = host_name();
        }
        if !self.connection.is_empty() {
            self.connection = with_default_port(&self.connection);
        }
        self.fallback = self
            .fallback
            .take()
            .filter(|f| !f.is_empty())
            .map(|f| with_default_port(&f));
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.is_empty() {
            anyhow::bail!("Connection cannot be empty");
        }
        if self.username.is_empty() {
            anyhow::bail!("Username cannot be empty");
        }
        if self.timeout == 0 {
            anyhow::bail!("Timeout cannot be zero");
        }
        if self.queue.sock_wr == 0 || self.queue.tap_wr == 0 {
            anyhow::bail!("Queue capacity cannot be zero");
        }
        if self.max_frame < 64 || self.max_frame > u16::MAX as usize {
            anyhow::bail!("Max frame must be between 64 and 65535");
        }
        if !self.interface.address.is_empty() {
            let addr = self.interface.address.split('/').next().unwrap_or_default();
            addr.parse::<Ipv4Addr>()
                .with_context(|| format!("Invalid interface address: {}", self.interface.address))?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl SwitchConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config: Self = read_json(path.as_ref())?;
        config.correct();
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(self, path.as_ref())
    }

    pub fn correct(&mut self) {
        self.listen = with_default_port(&self.listen);
        for user in &mut self.users {
            if let Some((name, network)) = user.name.split_once('@') {
                if user.network.is_empty() {
                    user.network = network.to_string();
                }
                user.name = name.to_string();
            }
            if user.network.is_empty() {
                user.network = DEFAULT_NETWORK.to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout == 0 {
            anyhow::bail!("Timeout cannot be zero");
        }
        if self.mac_timeout == 0 {
            anyhow::bail!("MAC timeout cannot be zero");
        }
        if self.max_frame < 64 || self.max_frame > u16::MAX as usize {
            anyhow::bail!("Max frame must be between 64 and 65535");
        }
        let mut seen = std::collections::HashSet::new();
        for net in &self.networks {
            if net.name.is_empty() {
                anyhow::bail!("Network name cannot be empty");
            }
            if !seen.insert(net.name.as_str()) {
                anyhow::bail!("Duplicate network: {}", net.name);
            }
            net.netmask
                .parse::<Ipv4Addr>()
                .with_context(|| format!("Invalid netmask for {}: {}", net.name, net.netmask))?;
            if let Some(range) = &net.range {
                if u32::from(range.start) > u32::from(range.end) {
                    anyhow::bail!("Range start after end in network {}", net.name);
                }
            }
        }
        for user in &self.users {
            if user.name.is_empty() {
                anyhow::bail!("User name cannot be empty");
            }
        }
        Ok(())
    }

    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_access_correct() {
        let mut config = AccessConfig::new("switch.example", "alice@corp", "pw");
        config.alias = "laptop".into();
        config.correct();
        assert_eq!(config.username, "alice");
        assert_eq!(config.network, "corp");
        assert_eq!(config.connection, "switch.example:10002");
        assert!(config.validate().is_ok());

        let mut plain = AccessConfig::new("10.1.1.1:443", "bob", "pw");
        plain.correct();
        assert_eq!(plain.network, "default");
        assert_eq!(plain.connection, "10.1.1.1:443");
    }

    #[test]
    fn test_access_validation() {
        let mut config = AccessConfig::new("h:1", "u", "p");
        assert!(config.validate().is_ok());

        config.interface.address = "10.0.0.300/24".into();
        assert!(config.validate().is_err());

        config.interface.address = "10.0.0.5/24".into();
        config.timeout = 0;
        assert!(config.validate().is_err());

        config.timeout = 10;
        config.username.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_access_defaults_from_json() -> Result<()> {
        let config: AccessConfig =
            serde_json::from_str(r#"{"connection":"h:1","username":"u"}"#)?;
        assert_eq!(config.timeout, 60);
        assert!(config.request_addr);
        assert_eq!(config.queue.sock_wr, 1024);
        assert_eq!(config.interface.mtu, 1500);
        assert_eq!(config.protocol, TransportProtocol::Tcp);
        assert_eq!(config.interface.provider, DeviceKind::Tap);
        Ok(())
    }

    #[test]
    fn test_udp_protocol_from_json() -> Result<()> {
        let config: AccessConfig =
            serde_json::from_str(r#"{"connection":"h:1","username":"u","protocol":"udp"}"#)?;
        assert_eq!(config.protocol, TransportProtocol::Udp);
        assert_eq!(config.protocol.to_string(), "udp");
        assert!(serde_json::from_str::<AccessConfig>(
            r#"{"connection":"h:1","username":"u","protocol":"quic"}"#
        )
        .is_err());
        Ok(())
    }

    #[test]
    fn test_access_file_operations() -> Result<()> {
        let mut config = AccessConfig::new("h:1", "alice@corp", "pw");
        config.alias = "box".into();
        config.interface.provider = DeviceKind::Tun;
        config.interface.address = "10.0.0.5/24".into();

        let temp_file = NamedTempFile::new()?;
        config.to_file(temp_file.path())?;

        let loaded = AccessConfig::from_file(temp_file.path())?;
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.network, "corp");
        assert_eq!(loaded.interface.provider, DeviceKind::Tun);
        Ok(())
    }

    #[test]
    fn test_switch_config() -> Result<()> {
        let json = r#"{
            "listen": "127.0.0.1",
            "networks": [{
                "name": "corp",
                "gateway": "10.0.0.1",
                "range": {"start": "10.0.0.10", "end": "10.0.0.20"},
                "static": [{"alias": "printer", "address": "10.0.0.5"}]
            }],
            "users": [{"name": "alice@corp", "password": "pw"}]
        }"#;
        let temp_file = NamedTempFile::new()?;
        fs::write(temp_file.path(), json)?;

        let config = SwitchConfig::from_file(temp_file.path())?;
        assert_eq!(config.listen, "127.0.0.1:10002");
        assert_eq!(config.mac_timeout, 300);
        let corp = config.network("corp").unwrap();
        assert_eq!(corp.netmask, "255.255.255.0");
        assert_eq!(corp.static_leases[0].alias, "printer");
        assert_eq!(config.users[0].name, "alice");
        assert_eq!(config.users[0].network, "corp");
        assert_eq!(config.users[0].role, "guest");
        Ok(())
    }

    #[test]
    fn test_switch_validation() {
        let mut config = SwitchConfig::default();
        config.networks.push(NetworkConfig {
            name: "corp".into(),
            netmask: "255.255.255.0".into(),
            gateway: String::new(),
            range: Some(RangeConfig {
                start: Ipv4Addr::new(10, 0, 0, 20),
                end: Ipv4Addr::new(10, 0, 0, 10),
            }),
            routes: Vec::new(),
            static_leases: Vec::new(),
        });
        assert!(config.validate().is_err());

        config.networks[0].range = None;
        assert!(config.validate().is_ok());

        let dup = config.networks[0].clone();
        config.networks.push(dup);
        assert!(config.validate().is_err());
    }
}
