//! Endpoint orchestrator.
//!
//! A [`Worker`] wires one primary and an optional fallback [`Session`] to a
//! single [`TapAdapter`]:
//!
//! - frames read from the adapter go to the first authenticated session,
//!   primary preferred
//! - frames from either session go to the adapter
//! - address leases are applied through the [`Platform`] collaborator and
//!   turned into next-hop rules for TUN mode
//! - a status snapshot is written every 2 seconds when configured

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::adapter::{DeviceConfig, DeviceFactory, TapAdapter, TapConfig, TapListener};
use crate::config::AccessConfig;
use crate::error::Result;
use crate::platform::Platform;
use crate::protocol::{network_equal, prefix_to_netmask, Network, Route, User};
use crate::session::{Session, SessionConfig, SessionListener};
use crate::status::EndpointStatus;
use crate::transport::{self, Transport};

/// Period of status snapshots.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(2);

/// A destination prefix and the next hop used to reach it.
///
/// `next_hop` is `None` for the on-link prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixRule {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub next_hop: Option<Ipv4Addr>,
}

impl PrefixRule {
    /// Parse `a.b.c.d/len`.
    pub fn parse(prefix: &str, next_hop: Option<Ipv4Addr>) -> Option<Self> {
        let (addr, len) = prefix.trim().split_once('/')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let prefix_len: u8 = len.parse().ok().filter(|l| *l <= 32)?;
        Some(Self::new(addr, prefix_len, next_hop))
    }

    pub fn new(addr: Ipv4Addr, prefix_len: u8, next_hop: Option<Ipv4Addr>) -> Self {
        let mask = u32::from(prefix_to_netmask(prefix_len));
        Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix_len,
            next_hop,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(prefix_to_netmask(self.prefix_len));
        u32::from(ip) & mask == u32::from(self.network)
    }
}

/// First matching rule decides: on-link → `dest`, routed → its next hop.
pub fn find_next(rules: &[PrefixRule], dest: Ipv4Addr) -> Ipv4Addr {
    rules
        .iter()
        .find(|rule| rule.contains(dest))
        .and_then(|rule| rule.next_hop)
        .unwrap_or(dest)
}

/// Routes worth installing: parsable prefix, parsable next hop that is not
/// the endpoint itself.
fn usable_routes(network: &Network) -> Vec<Route> {
    let own = network.ipv4();
    network
        .routes
        .iter()
        .filter(|route| PrefixRule::parse(&route.prefix, None).is_some())
        .filter(|route| match route.nexthop.parse::<Ipv4Addr>() {
            Ok(hop) => Some(hop) != own,
            Err(_) => false,
        })
        .cloned()
        .collect()
}

fn build_rules(network: &Network, routes: &[Route]) -> Vec<PrefixRule> {
    let mut rules = Vec::with_capacity(routes.len() + 1);
    if let (Some(addr), Some(len)) = (network.ipv4(), network.prefix_len()) {
        rules.push(PrefixRule::new(addr, len, None));
    }
    rules.extend(
        routes
            .iter()
            .filter_map(|r| PrefixRule::parse(&r.prefix, r.nexthop.parse().ok())),
    );
    rules
}

#[derive(Default)]
struct NetState {
    /// Network currently applied to the interface.
    network: Option<Network>,
    /// Routes installed for it.
    routes: Vec<Route>,
    device: Option<String>,
}

struct WorkerState {
    config: AccessConfig,
    uuid: String,
    platform: Arc<dyn Platform>,
    tap: TapAdapter,
    sessions: Vec<Session>,
    net: tokio::sync::Mutex<NetState>,
    rules: RwLock<Vec<PrefixRule>>,
    started_at: Instant,
    done: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Listener handed to the sessions and the adapter.
///
/// Holds the worker weakly so the components do not keep it alive.
struct Link {
    state: Weak<WorkerState>,
}

/// An endpoint: sessions plus a tap adapter.
#[derive(Clone)]
pub struct Worker {
    state: Arc<WorkerState>,
}

fn session_config(config: &AccessConfig, name: &str, uuid: &str) -> SessionConfig {
    let mut user = User::new(&config.username, &config.network, &config.password);
    user.uuid = uuid.to_string();
    user.alias = config.alias.clone();

    let mut session = SessionConfig::new(name, user);
    session.request_addr = config.request_addr;
    session.address = static_network(config);
    session.timeout = config.timeout();
    session.write_queue = config.queue.sock_wr;
    session
}

fn static_network(config: &AccessConfig) -> Option<Network> {
    if config.interface.address.is_empty() {
        None
    } else {
        Some(Network::from_cidr(&config.network, &config.interface.address))
    }
}

fn tap_config(config: &AccessConfig) -> TapConfig {
    TapConfig {
        device: DeviceConfig {
            name: config.interface.name.clone(),
            kind: config.interface.provider,
            mtu: config.interface.mtu,
        },
        address: Some(config.interface.address.clone()).filter(|a| !a.is_empty()),
        write_queue: config.queue.tap_wr,
    }
}

impl Worker {
    /// Build a worker whose transports follow the configured protocol.
    pub fn new(
        config: AccessConfig,
        factory: Arc<dyn DeviceFactory>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let connect = |remote: &str| {
            transport::connector(config.protocol, remote, config.timeout(), config.max_frame)
        };
        let primary = connect(&config.connection);
        let fallback = config.fallback.as_deref().map(connect);
        Self::with_transports(config, primary, fallback, factory, platform)
    }

    pub fn with_transports(
        config: AccessConfig,
        primary: Arc<dyn Transport>,
        fallback: Option<Arc<dyn Transport>>,
        factory: Arc<dyn DeviceFactory>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let uuid = uuid::Uuid::new_v4().to_string();
        let (done, _) = watch::channel(false);

        let state = Arc::new_cyclic(|weak: &Weak<WorkerState>| {
            let link = Arc::new(Link { state: weak.clone() });
            let tap = TapAdapter::new(tap_config(&config), factory, link.clone());
            let mut sessions = vec![Session::new(
                session_config(&config, "primary", &uuid),
                primary,
                link.clone(),
            )];
            if let Some(fallback) = fallback {
                sessions.push(Session::new(
                    session_config(&config, "fallback", &uuid),
                    fallback,
                    link,
                ));
            }
            WorkerState {
                config,
                uuid,
                platform,
                tap,
                sessions,
                net: tokio::sync::Mutex::new(NetState::default()),
                rules: RwLock::new(Vec::new()),
                started_at: Instant::now(),
                done,
                task: Mutex::new(None),
            }
        });
        Self { state }
    }

    /// Write the pid file, open the adapter and connect every session.
    pub async fn start(&self) -> Result<()> {
        let st = &self.state;
        info!(uuid = %st.uuid, user = %st.config.username, network = %st.config.network, "Starting worker");

        if let Some(path) = &st.config.pid_file {
            if let Err(e) = tokio::fs::write(path, std::process::id().to_string()).await {
                warn!(path = %path.display(), error = %e, "Failed to write pid file");
            }
        }

        st.tap.start()?;
        for session in &st.sessions {
            session.connect()?;
        }

        let span = info_span!("worker", uuid = %st.uuid);
        let task = tokio::spawn(st.clone().status_loop(st.done.subscribe()).instrument(span));
        *st.task.lock() = Some(task);
        Ok(())
    }

    /// Release the address, leave the switch and close the adapter.
    pub async fn stop(&self) {
        let st = &self.state;
        info!(uuid = %st.uuid, "Stopping worker");
        let _ = st.done.send(true);
        let task = st.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        {
            let mut net = st.net.lock().await;
            st.free_ip_addr(&mut net).await;
        }
        for session in &st.sessions {
            session.disconnect().await;
        }
        st.tap.stop().await;
    }

    pub fn uuid(&self) -> &str {
        &self.state.uuid
    }

    pub fn sessions(&self) -> &[Session] {
        &self.state.sessions
    }

    pub fn tap(&self) -> &TapAdapter {
        &self.state.tap
    }

    /// Network currently applied to the interface.
    pub async fn network(&self) -> Option<Network> {
        self.state.net.lock().await.network.clone()
    }

    pub async fn status(&self) -> EndpointStatus {
        self.state.status().await
    }

    /// Reconnect every session now.
    pub fn force_reconnect(&self) -> Result<()> {
        for session in &self.state.sessions {
            session.force_reconnect()?;
        }
        Ok(())
    }
}

impl WorkerState {
    fn active_session(&self) -> &Session {
        self.sessions
            .iter()
            .find(|s| s.is_authenticated())
            .unwrap_or(&self.sessions[0])
    }

    async fn status_loop(self: Arc<Self>, mut done: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = done.changed() => break,
                _ = ticker.tick() => self.flush_status().await,
            }
        }
    }

    async fn flush_status(&self) {
        let Some(path) = &self.config.status_file else {
            return;
        };
        let status = self.status().await;
        if let Err(e) = status.save(path).await {
            warn!(path = %path.display(), error = %e, "Failed to write status file");
        }
    }

    async fn status(&self) -> EndpointStatus {
        let session = self.active_session().status().await;
        let net = self.net.lock().await;
        EndpointStatus {
            rx_bytes: session.statistics.recv_bytes,
            tx_bytes: session.statistics.send_bytes,
            err_pkt: session.statistics.send_errors,
            uptime: self.started_at.elapsed().as_secs(),
            alive_time: session.alive_time,
            state: session.state.to_string(),
            device: net.device.clone().unwrap_or_default(),
            network: self.config.network.clone(),
            protocol: self.config.protocol.to_string(),
            user: self.config.username.clone(),
            remote: session.remote,
            uuid: self.uuid.clone(),
            alias: self.config.alias.clone(),
            system: std::env::consts::OS.to_string(),
            latency_ms: session.latency_ms,
            address: net.network.clone(),
        }
    }

    async fn on_success(&self, session: &str) {
        info!(session, "Session authenticated");
        // Without leasing the static address is applied as if leased
        if !self.config.request_addr {
            if let Some(network) = static_network(&self.config) {
                self.on_ip_addr(session, &network).await;
            }
        }
    }

    async fn on_ip_addr(&self, session: &str, network: &Network) {
        let mut net = self.net.lock().await;
        if network_equal(net.network.as_ref(), Some(network)) {
            debug!(session, %network, "Network unchanged");
            return;
        }
        self.free_ip_addr(&mut net).await;
        self.apply_network(&mut net, network.clone(), true).await;
    }

    async fn apply_network(&self, net: &mut NetState, network: Network, update_tap: bool) {
        let Some(cidr) = network.cidr() else {
            warn!(%network, "Network has no usable address");
            return;
        };
        info!(%cidr, gateway = %network.gateway, routes = network.routes.len(), "Applying network");
        if update_tap {
            self.tap.set_addr(&cidr).await;
        }

        let routes = usable_routes(&network);
        if let Some(device) = net.device.clone() {
            if let Err(e) = self
                .platform
                .add_address(&device, &cidr, &network.gateway)
                .await
            {
                warn!(%device, %cidr, error = %e, "Failed to add address");
            }
            if !routes.is_empty() {
                if let Err(e) = self.platform.add_routes(&device, &routes).await {
                    warn!(%device, error = %e, "Failed to add routes");
                }
            }
        } else {
            debug!(%cidr, "Device not open yet, deferring address");
        }

        *self.rules.write() = build_rules(&network, &routes);
        net.routes = routes;
        net.network = Some(network);
    }

    async fn free_ip_addr(&self, net: &mut NetState) {
        let Some(network) = net.network.take() else {
            return;
        };
        let routes = std::mem::take(&mut net.routes);
        self.rules.write().clear();

        let Some(device) = net.device.clone() else {
            return;
        };
        if !routes.is_empty() {
            if let Err(e) = self.platform.delete_routes(&device, &routes).await {
                debug!(%device, error = %e, "Failed to delete routes");
            }
        }
        if let Some(cidr) = network.cidr() {
            if let Err(e) = self.platform.delete_address(&device, &cidr).await {
                debug!(%device, %cidr, error = %e, "Failed to delete address");
            }
            info!(%device, %cidr, "Released address");
        }
    }

    async fn on_open(&self, device: &str) {
        let mut net = self.net.lock().await;
        // A reopened device lost its address
        let network = net.network.clone();
        if net.device.is_some() {
            self.free_ip_addr(&mut net).await;
        } else {
            net.network = None;
            net.routes.clear();
        }
        net.device = Some(device.to_string());

        if let Err(e) = self
            .platform
            .on_interface_ready(device, self.config.interface.mtu)
            .await
        {
            warn!(device, error = %e, "Failed to bring interface up");
        }
        if let Some(bridge) = &self.config.interface.bridge {
            if let Err(e) = self.platform.set_master(device, bridge).await {
                warn!(device, bridge = %bridge, error = %e, "Failed to join bridge");
            }
        }

        if let Some(network) = network {
            self.apply_network(&mut net, network, false).await;
        }
    }

    async fn on_close(&self, session: &str) {
        info!(session, "Session closed");
        if self.sessions.iter().any(|s| s.is_authenticated()) {
            return;
        }
        let mut net = self.net.lock().await;
        self.free_ip_addr(&mut net).await;
    }

    /// Frame from the adapter to the overlay.
    async fn to_overlay(&self, frame: Bytes) {
        match self.sessions.iter().find(|s| s.is_authenticated()) {
            Some(session) => {
                if let Err(e) = session.send(frame).await {
                    debug!(session = %session.name(), error = %e, "Send failed");
                }
            }
            None => trace!("No authenticated session, dropping frame"),
        }
    }

    /// Frame from a session to the adapter.
    async fn to_device(&self, frame: Bytes) {
        if let Err(e) = self.tap.write(frame).await {
            debug!(error = %e, "Adapter write failed");
        }
    }
}

#[async_trait]
impl SessionListener for Link {
    async fn on_success(&self, session: &str) {
        if let Some(state) = self.state.upgrade() {
            state.on_success(session).await;
        }
    }

    async fn on_ip_addr(&self, session: &str, network: &Network) {
        if let Some(state) = self.state.upgrade() {
            state.on_ip_addr(session, network).await;
        }
    }

    async fn on_close(&self, session: &str) {
        if let Some(state) = self.state.upgrade() {
            state.on_close(session).await;
        }
    }

    async fn on_frame(&self, _session: &str, frame: Bytes) {
        if let Some(state) = self.state.upgrade() {
            state.to_device(frame).await;
        }
    }
}

#[async_trait]
impl TapListener for Link {
    async fn on_open(&self, device: &str) {
        if let Some(state) = self.state.upgrade() {
            state.on_open(device).await;
        }
    }

    async fn on_frame(&self, frame: Bytes) {
        if let Some(state) = self.state.upgrade() {
            state.to_overlay(frame).await;
        }
    }

    fn find_next(&self, dest: Ipv4Addr) -> Ipv4Addr {
        match self.state.upgrade() {
            Some(state) => find_next(&state.rules.read(), dest),
            None => dest,
        }
    }
}
