//! JSON bodies carried by control frames.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Literal login response body on success.
pub const LOGIN_OKAY: &str = "okay";

/// Tenant used when a login names none.
pub const DEFAULT_NETWORK: &str = "default";

/// Endpoint credentials sent in `LoginReq`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub system: String,
}

impl User {
    pub fn new(name: &str, network: &str, password: &str) -> Self {
        Self {
            name: name.to_string(),
            password: password.to_string(),
            network: network.to_string(),
            system: std::env::consts::OS.to_string(),
            ..Default::default()
        }
    }

    /// Normalize a record received from an older or sloppy client.
    ///
    /// `name@network` is split, an empty network becomes `default`, the
    /// alias is lowercased and the uuid falls back to the alias.
    pub fn normalize(&mut self) {
        if let Some((name, network)) = self.name.split_once('@') {
            if self.network.is_empty() {
                self.network = network.to_string();
            }
            self.name = name.to_string();
        }
        if self.network.is_empty() {
            self.network = DEFAULT_NETWORK.to_string();
        }
        self.alias = self.alias.to_lowercase();
        if self.uuid.is_empty() {
            self.uuid = self.alias.clone();
        }
    }

    /// `name@network` identifier.
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.network)
    }
}

/// A route pushed along with a leased network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    #[serde(default)]
    pub nexthop: String,
    #[serde(default)]
    pub metric: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
}

impl Route {
    pub fn new(prefix: &str, nexthop: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            nexthop: nexthop.to_string(),
            metric: 250,
            ..Default::default()
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.prefix, self.nexthop)
    }
}

/// Network descriptor exchanged by `IpAddrReq` / `IpAddrResp`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub name: String,
    /// Tenant hint from older endpoints that leave `name` empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub netmask: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

impl Network {
    /// Build a descriptor from `a.b.c.d/len` or a bare address.
    ///
    /// A bare address gets a host netmask.
    pub fn from_cidr(name: &str, cidr: &str) -> Self {
        let (address, netmask) = match cidr.split_once('/') {
            Some((addr, len)) => {
                let mask = len
                    .parse::<u8>()
                    .ok()
                    .filter(|l| *l <= 32)
                    .map(|l| prefix_to_netmask(l).to_string())
                    .unwrap_or_else(|| len.to_string());
                (addr.to_string(), mask)
            }
            None => (cidr.to_string(), "255.255.255.255".to_string()),
        };
        Self {
            name: name.to_string(),
            address,
            netmask,
            ..Default::default()
        }
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.address.parse().ok()
    }

    pub fn mask(&self) -> Option<Ipv4Addr> {
        self.netmask.parse().ok()
    }

    /// Prefix length of the netmask.
    pub fn prefix_len(&self) -> Option<u8> {
        self.mask().map(netmask_to_prefix)
    }

    /// `address/len`, if both halves parse.
    pub fn cidr(&self) -> Option<String> {
        Some(format!("{}/{}", self.ipv4()?, self.prefix_len()?))
    }

    /// Logical equality used to suppress no-op reconfiguration.
    ///
    /// Address and netmask must match and the route lists must match
    /// after sorting; the name and gateway are ignored.
    pub fn same_as(&self, other: &Network) -> bool {
        if self.address != other.address || self.netmask != other.netmask {
            return false;
        }
        if self.routes.len() != other.routes.len() {
            return false;
        }
        let mut ours: Vec<String> = self.routes.iter().map(|r| r.to_string()).collect();
        let mut theirs: Vec<String> = other.routes.iter().map(|r| r.to_string()).collect();
        ours.sort();
        theirs.sort();
        ours == theirs
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name:{} gateway:{} address:{} netmask:{} routes:{}",
            self.name,
            self.gateway,
            self.address,
            self.netmask,
            self.routes.len()
        )
    }
}

/// `None`-aware wrapper over [`Network::same_as`].
pub fn network_equal(old: Option<&Network>, new: Option<&Network>) -> bool {
    match (old, new) {
        (None, None) => true,
        (Some(o), Some(n)) => o.same_as(n),
        _ => false,
    }
}

/// Body of `PingReq`, `PongResp` and `LeftReq`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage {
    /// Nanoseconds since the Unix epoch when the ping was sent.
    pub datetime: i64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub connection: String,
    #[serde(default)]
    pub address: String,
}

/// One row of a `NeighborResp`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborInfo {
    #[serde(default)]
    pub uptime: i64,
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "ethernet")]
    pub hw_addr: String,
    pub address: String,
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub network: String,
}

/// Current time in nanoseconds since the Unix epoch.
pub fn unix_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub fn prefix_to_netmask(len: u8) -> Ipv4Addr {
    let len = len.min(32) as u32;
    let bits = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Ipv4Addr::from(bits)
}

pub fn netmask_to_prefix(mask: Ipv4Addr) -> u8 {
    u32::from(mask).leading_ones() as u8
}
