//! Switch-side handling of control requests.
//!
//! The handler is transport-agnostic: it looks at one request from one
//! client and says what to do about it. The server owns the sockets.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use super::lease::{Lease, LeasePool};
use crate::config::{NetworkConfig, SwitchConfig, UserConfig};
use crate::packet::{format_mac, ArpOperation, ArpPacket};
use crate::protocol::{
    unix_nanos, Action, Frame, NeighborInfo, Network, User, DEFAULT_NETWORK, LOGIN_OKAY,
};

/// Address sent back when no lease can be produced.
pub const PLACEHOLDER_ADDR: &str = "169.254.0.0";

/// Netmask used with the placeholder when the network has none.
pub const PLACEHOLDER_NETMASK: &str = "255.255.0.0";

/// Reply body of a rejected login.
pub const LOGIN_FAILED: &str = "authentication failed";

/// What the server knows about one connection.
#[derive(Debug, Clone, Default)]
pub struct ClientRecord {
    pub id: u64,
    pub remote: String,
    /// Set once logged in.
    pub user: Option<User>,
    pub address: Option<Ipv4Addr>,
}

impl ClientRecord {
    pub fn new(id: u64, remote: &str) -> Self {
        Self {
            id,
            remote: remote.to_string(),
            ..Default::default()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// The handler's verdict on one request.
#[derive(Debug)]
pub enum Outcome {
    Reply(Frame),
    /// Login accepted; attach the client to the user's network.
    LoggedIn { user: User, reply: Frame },
    /// Address handed out (or the placeholder).
    Leased {
        reply: Frame,
        address: Option<Ipv4Addr>,
    },
    /// Take the client offline.
    Leave,
    Ignore,
}

struct NetworkEntry {
    config: NetworkConfig,
    pool: LeasePool,
}

pub struct RequestHandler {
    users: Vec<UserConfig>,
    networks: HashMap<String, NetworkEntry>,
    /// ARP senders, tagged with the connection they were seen on.
    neighbors: RwLock<HashMap<Ipv4Addr, (u64, NeighborInfo)>>,
}

impl RequestHandler {
    pub fn new(config: &SwitchConfig) -> Self {
        let networks = config
            .networks
            .iter()
            .map(|net| {
                let range = net.range.as_ref().map(|r| (r.start, r.end));
                let pool = LeasePool::new(&net.name, range);
                for lease in &net.static_leases {
                    pool.add_static(&lease.alias.to_lowercase(), lease.address);
                }
                (
                    net.name.clone(),
                    NetworkEntry {
                        config: net.clone(),
                        pool,
                    },
                )
            })
            .collect();
        Self {
            users: config.users.clone(),
            networks,
            neighbors: RwLock::new(HashMap::new()),
        }
    }

    pub fn handle(&self, client: &ClientRecord, action: Action, body: &[u8]) -> Outcome {
        debug!(client = %client.remote, %action, len = body.len(), "Request");
        match action {
            Action::LoginReq => self.on_login(client, body),
            Action::IpAddrReq => self.on_ip_addr(client, body),
            Action::NeighborReq => self.on_neighbor(client),
            Action::PingReq => Outcome::Reply(Frame::control(
                Action::PongResp,
                Bytes::copy_from_slice(body),
            )),
            Action::LeftReq => {
                info!(client = %client.remote, "Client leaving");
                Outcome::Leave
            }
            other => {
                warn!(client = %client.remote, action = %other, "Unexpected request");
                Outcome::Ignore
            }
        }
    }

    fn on_login(&self, client: &ClientRecord, body: &[u8]) -> Outcome {
        if client.is_authenticated() {
            debug!(client = %client.remote, "Already logged in");
            return Outcome::Reply(Frame::control(Action::LoginResp, LOGIN_OKAY));
        }
        let mut user: User = match serde_json::from_slice(body) {
            Ok(user) => user,
            Err(e) => {
                warn!(client = %client.remote, error = %e, "Invalid login body");
                return Outcome::Reply(Frame::control(Action::LoginResp, "invalid login"));
            }
        };
        user.normalize();

        if !self.check_user(&user) {
            warn!(client = %client.remote, user = %user.id(), "Login rejected");
            return Outcome::Reply(Frame::control(Action::LoginResp, LOGIN_FAILED));
        }
        info!(client = %client.remote, user = %user.id(), alias = %user.alias, "Login accepted");
        Outcome::LoggedIn {
            user,
            reply: Frame::control(Action::LoginResp, LOGIN_OKAY),
        }
    }

    fn check_user(&self, user: &User) -> bool {
        self.users.iter().any(|u| {
            let network = if u.network.is_empty() {
                DEFAULT_NETWORK
            } else {
                &u.network
            };
            u.name == user.name && network == user.network && u.password == user.password
        })
    }

    fn on_ip_addr(&self, client: &ClientRecord, body: &[u8]) -> Outcome {
        let Some(user) = &client.user else {
            debug!(client = %client.remote, "Address request before login");
            return Outcome::Ignore;
        };
        let mut request: Network = match serde_json::from_slice(body) {
            Ok(req) => req,
            Err(e) => {
                warn!(client = %client.remote, error = %e, "Invalid address request");
                return Outcome::Ignore;
            }
        };
        if request.name.is_empty() {
            request.name = std::mem::take(&mut request.tenant);
        }
        if request.name.is_empty() {
            request.name = DEFAULT_NETWORK.to_string();
        }
        let Some(entry) = self.networks.get(&request.name) else {
            warn!(client = %client.remote, network = %request.name, "Unknown network");
            return Outcome::Ignore;
        };

        let lease = find_lease(&entry.pool, &user.alias, &request.address);
        let netmask = if entry.config.netmask.is_empty() {
            PLACEHOLDER_NETMASK.to_string()
        } else {
            entry.config.netmask.clone()
        };
        let address = match &lease {
            Some(lease) => lease.address.to_string(),
            None => {
                warn!(client = %client.remote, network = %request.name, "No address available");
                PLACEHOLDER_ADDR.to_string()
            }
        };
        let response = Network {
            name: entry.config.name.clone(),
            address,
            netmask,
            gateway: entry.config.gateway.clone(),
            routes: entry.config.routes.clone(),
            ..Default::default()
        };
        info!(client = %client.remote, alias = %user.alias, address = %response.address, "Address assigned");

        match Frame::control_json(Action::IpAddrResp, &response) {
            Ok(reply) => Outcome::Leased {
                reply,
                address: lease.map(|l| l.address),
            },
            Err(e) => {
                warn!(error = %e, "Failed to encode address response");
                Outcome::Ignore
            }
        }
    }

    fn on_neighbor(&self, client: &ClientRecord) -> Outcome {
        let network = client.user.as_ref().map(|u| u.network.as_str());
        let list: Vec<NeighborInfo> = self
            .neighbors()
            .into_iter()
            .filter(|n| network.map_or(true, |net| n.network == net))
            .collect();
        match Frame::control_json(Action::NeighborResp, &list) {
            Ok(reply) => Outcome::Reply(reply),
            Err(e) => {
                warn!(error = %e, "Failed to encode neighbors");
                Outcome::Ignore
            }
        }
    }

    /// Record the IPv4 sender of an ARP frame seen from `client`.
    pub fn learn_arp(&self, client: &ClientRecord, frame: &[u8]) {
        let Some(arp) = ArpPacket::parse(frame) else {
            return;
        };
        if !matches!(arp.operation, ArpOperation::Request | ArpOperation::Reply)
            || arp.sender_ip.is_unspecified()
        {
            return;
        }
        let (uuid, network) = client
            .user
            .as_ref()
            .map(|u| (u.uuid.clone(), u.network.clone()))
            .unwrap_or_default();
        let info = NeighborInfo {
            uptime: unix_nanos() / 1_000_000_000,
            uuid,
            hw_addr: format_mac(&arp.sender_mac),
            address: arp.sender_ip.to_string(),
            client: client.remote.clone(),
            network,
        };
        let mut neighbors = self.neighbors.write();
        if !neighbors.contains_key(&arp.sender_ip) {
            debug!(ip = %arp.sender_ip, mac = %info.hw_addr, client = %client.remote, "New neighbor");
        }
        neighbors.insert(arp.sender_ip, (client.id, info));
    }

    /// Drop the neighbors learned from connection `id`.
    pub fn forget(&self, id: u64) -> usize {
        let mut neighbors = self.neighbors.write();
        let before = neighbors.len();
        neighbors.retain(|_, (owner, _)| *owner != id);
        before - neighbors.len()
    }

    pub fn neighbors(&self) -> Vec<NeighborInfo> {
        let mut list: Vec<NeighborInfo> = self
            .neighbors
            .read()
            .values()
            .map(|(_, info)| info.clone())
            .collect();
        list.sort_by(|a, b| a.address.cmp(&b.address));
        list
    }

    /// Return a disconnected client's dynamic lease.
    pub fn release(&self, user: &User) -> Option<Lease> {
        self.networks.get(&user.network)?.pool.release(&user.alias)
    }

    pub fn leases(&self, network: &str) -> Vec<Lease> {
        self.networks
            .get(network)
            .map(|entry| entry.pool.list())
            .unwrap_or_default()
    }
}

/// Existing lease first, then the requested address, then the range.
fn find_lease(pool: &LeasePool, alias: &str, requested: &str) -> Option<Lease> {
    let requested = requested.split('/').next().unwrap_or_default();
    let current = pool.get(alias);
    if requested.is_empty() {
        return current.or_else(|| pool.lease(alias));
    }
    let Ok(addr) = requested.parse::<Ipv4Addr>() else {
        return current.or_else(|| pool.lease(alias));
    };
    match current {
        Some(lease) if lease.address == addr => Some(lease),
        _ => pool.bind(alias, addr).or_else(|| pool.lease(alias)),
    }
}
